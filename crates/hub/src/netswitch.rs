//! Network switch actuator speaking the Shelly Gen2 RPC-over-HTTP dialect:
//!
//! - `GET /rpc/Switch.Set?id=<output>&on=<bool>`
//! - `GET /rpc/Switch.GetStatus?id=<output>`
//! - `GET /rpc/Shelly.GetDeviceInfo`
//!
//! Every response must be a JSON object without an `error` member.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::device::{Actuator, State};
use crate::error::DeviceError;

pub struct NetworkSwitch {
    device_id: String,
    base_url: String,
    output: u32,
    timeout: Duration,
    client: reqwest::Client,
}

impl NetworkSwitch {
    pub fn new(device_id: &str, address: &str, output: u32, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .with_context(|| format!("failed to build http client for '{device_id}'"))?;

        let address = address.trim_end_matches('/');
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };

        Ok(Self {
            device_id: device_id.to_string(),
            base_url,
            output,
            timeout,
            client,
        })
    }

    async fn rpc(&self, method: &str, params: &[(&str, String)]) -> Result<Value, DeviceError> {
        let url = format!("{}/rpc/{method}", self.base_url);
        debug!(device = %self.device_id, %url, ?params, "rpc request");

        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::protocol(format!("{method} returned HTTP {status}")));
        }

        let body: Value = response.json().await.map_err(|e| self.classify(e))?;
        if !body.is_object() {
            return Err(DeviceError::protocol(format!("{method} returned non-object payload")));
        }
        if let Some(err) = body.get("error") {
            return Err(DeviceError::protocol(format!("{method} failed: {err}")));
        }
        Ok(body)
    }

    fn classify(&self, err: reqwest::Error) -> DeviceError {
        if err.is_timeout() {
            DeviceError::Timeout(self.timeout)
        } else if err.is_decode() {
            DeviceError::protocol(format!("malformed response: {err}"))
        } else if err.is_connect() {
            DeviceError::unreachable(format!("cannot connect to {}: {err}", self.base_url))
        } else {
            DeviceError::unreachable(err.to_string())
        }
    }
}

#[async_trait]
impl Actuator for NetworkSwitch {
    async fn set(&self, on: bool) -> Result<(), DeviceError> {
        self.rpc(
            "Switch.Set",
            &[("id", self.output.to_string()), ("on", on.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn query(&self) -> Result<State, DeviceError> {
        let body = self
            .rpc("Switch.GetStatus", &[("id", self.output.to_string())])
            .await?;
        Ok(match body.get("output").and_then(Value::as_bool) {
            Some(on) => State::from_on(on),
            None => State::Unknown,
        })
    }

    async fn probe(&self) -> Result<String, DeviceError> {
        let info = self.rpc("Shelly.GetDeviceInfo", &[]).await?;
        let field = |key: &str| info.get(key).and_then(Value::as_str).unwrap_or("?").to_string();
        Ok(format!(
            "{} model={} fw={}",
            field("id"),
            field("model"),
            field("ver")
        ))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
