//! TOML config file loading, validation, and construction of the device
//! registry and sensor gate.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::device::{Actuator, DeviceIdentity, DeviceKind, DeviceRegistry};
use crate::health::HealthPolicy;
use crate::netswitch::NetworkSwitch;
use crate::relay::ContactRelay;
use crate::sensor::{HttpSensor, SensorGate, SensorSettings, SensorSource};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub health: HealthSection,
    pub sensor: Option<SensorSection>,
    #[serde(default)]
    pub relays: Vec<RelayEntry>,
    #[serde(default)]
    pub switches: Vec<SwitchEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    pub check_interval_sec: u64,
    pub data_dir: PathBuf,
    pub web_port: u16,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            check_interval_sec: 10,
            data_dir: PathBuf::from("data"),
            web_port: 8080,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub max_consecutive_errors: u32,
    pub retry_cooldown_sec: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        let policy = HealthPolicy::default();
        Self {
            max_consecutive_errors: policy.max_consecutive_errors,
            retry_cooldown_sec: policy.retry_cooldown.as_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SensorSection {
    pub url: String,
    #[serde(default = "default_sensor_timeout")]
    pub timeout_sec: f64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_sec: u64,
    #[serde(default = "default_skip_threshold")]
    pub humidity_skip_threshold: f64,
}

#[derive(Debug, Deserialize)]
pub struct RelayEntry {
    pub device_id: String,
    pub name: String,
    pub gpio_pin: i64,
    #[serde(default = "default_true")]
    pub active_low: bool,
    #[serde(default = "default_relay_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct SwitchEntry {
    pub device_id: String,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub output: u32,
    #[serde(default = "default_switch_timeout")]
    pub timeout_sec: f64,
}

fn default_true() -> bool {
    true
}

fn default_relay_timeout_ms() -> u64 {
    1000
}

fn default_switch_timeout() -> f64 {
    5.0
}

fn default_sensor_timeout() -> f64 {
    crate::sensor::DEFAULT_FETCH_TIMEOUT.as_secs_f64()
}

fn default_cache_ttl() -> u64 {
    crate::sensor::DEFAULT_CACHE_TTL.as_secs()
}

fn default_skip_threshold() -> f64 {
    crate::sensor::DEFAULT_HUMIDITY_SKIP_THRESHOLD
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_controller(&mut errors);
        self.validate_sensor(&mut errors);
        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        if self.controller.check_interval_sec == 0 {
            errors.push("controller: check_interval_sec must be positive".into());
        }
        if self.controller.data_dir.as_os_str().is_empty() {
            errors.push("controller: data_dir is empty".into());
        }
        if self.health.max_consecutive_errors == 0 {
            errors.push("health: max_consecutive_errors must be positive".into());
        }
    }

    fn validate_sensor(&self, errors: &mut Vec<String>) {
        let Some(s) = &self.sensor else {
            return;
        };
        if s.url.trim().is_empty() {
            errors.push("sensor: url is empty".into());
        }
        if !(s.timeout_sec.is_finite() && s.timeout_sec > 0.0) {
            errors.push(format!(
                "sensor: timeout_sec must be positive, got {}",
                s.timeout_sec
            ));
        }
        if !(0.0..=100.0).contains(&s.humidity_skip_threshold) {
            errors.push(format!(
                "sensor: humidity_skip_threshold {} out of range [0, 100]",
                s.humidity_skip_threshold
            ));
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        // ── Identity (unique across both kinds) ─────────────
        let identities = self
            .relays
            .iter()
            .enumerate()
            .map(|(i, r)| (entry_ctx("relays", i, &r.device_id), r.device_id.as_str(), r.name.as_str()))
            .chain(self.switches.iter().enumerate().map(|(i, s)| {
                (entry_ctx("switches", i, &s.device_id), s.device_id.as_str(), s.name.as_str())
            }));

        for (ctx, device_id, name) in identities {
            if device_id.trim().is_empty() {
                errors.push(format!("{ctx}: device_id is empty"));
            } else if !seen_ids.insert(device_id) {
                errors.push(format!("{ctx}: duplicate device_id"));
            }
            if name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }
        }

        for (i, r) in self.relays.iter().enumerate() {
            let ctx = entry_ctx("relays", i, &r.device_id);

            // ── GPIO pin whitelist ──────────────────────────────
            if !VALID_GPIO_PINS.contains(&r.gpio_pin) {
                errors.push(format!(
                    "{ctx}: gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    r.gpio_pin
                ));
            } else if !seen_pins.insert(r.gpio_pin) {
                errors.push(format!(
                    "{ctx}: gpio_pin {} is already used by another relay",
                    r.gpio_pin
                ));
            }

            if r.timeout_ms == 0 {
                errors.push(format!("{ctx}: timeout_ms must be positive"));
            }
        }

        for (i, s) in self.switches.iter().enumerate() {
            let ctx = entry_ctx("switches", i, &s.device_id);
            if s.address.trim().is_empty() {
                errors.push(format!("{ctx}: address is empty"));
            }
            if !(s.timeout_sec.is_finite() && s.timeout_sec > 0.0) {
                errors.push(format!(
                    "{ctx}: timeout_sec must be positive, got {}",
                    s.timeout_sec
                ));
            }
        }
    }

    pub fn device_count(&self) -> usize {
        self.relays.len() + self.switches.len()
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.controller.check_interval_sec)
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            max_consecutive_errors: self.health.max_consecutive_errors,
            retry_cooldown: Duration::from_secs(self.health.retry_cooldown_sec),
        }
    }

    pub fn sensor_settings(&self) -> SensorSettings {
        match &self.sensor {
            Some(s) => SensorSettings {
                cache_ttl: Duration::from_secs(s.cache_ttl_sec),
                fetch_timeout: Duration::from_secs_f64(s.timeout_sec),
                humidity_skip_threshold: s.humidity_skip_threshold,
            },
            None => SensorSettings::default(),
        }
    }
}

fn entry_ctx(section: &str, i: usize, device_id: &str) -> String {
    if device_id.is_empty() {
        format!("{section}[{i}]")
    } else {
        format!("device '{device_id}'")
    }
}

// ---------------------------------------------------------------------------
// Load + build
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Construct one actuator per configured device. Relays come first, then
/// switches, each in file order.
pub fn build_registry(config: &Config) -> Result<DeviceRegistry> {
    let mut devices: Vec<(DeviceIdentity, Box<dyn Actuator>)> =
        Vec::with_capacity(config.device_count());

    for r in &config.relays {
        // Validation guarantees the pin fits.
        let gpio_pin = u8::try_from(r.gpio_pin)
            .with_context(|| format!("device '{}': gpio_pin out of range", r.device_id))?;
        let identity = DeviceIdentity {
            device_id: r.device_id.clone(),
            name: r.name.clone(),
            kind: DeviceKind::ContactRelay {
                gpio_pin,
                active_low: r.active_low,
            },
            timeout: Duration::from_millis(r.timeout_ms),
        };
        let relay = ContactRelay::new(&r.device_id, gpio_pin, r.active_low);
        devices.push((identity, Box::new(relay)));
    }

    for s in &config.switches {
        let timeout = Duration::from_secs_f64(s.timeout_sec);
        let identity = DeviceIdentity {
            device_id: s.device_id.clone(),
            name: s.name.clone(),
            kind: DeviceKind::NetworkSwitch {
                address: s.address.clone(),
                output: s.output,
            },
            timeout,
        };
        let switch = NetworkSwitch::new(&s.device_id, &s.address, s.output, timeout)
            .with_context(|| format!("failed to set up switch '{}'", s.device_id))?;
        devices.push((identity, Box::new(switch)));
    }

    tracing::info!(
        relays = config.relays.len(),
        switches = config.switches.len(),
        "device registry built"
    );

    Ok(DeviceRegistry::new(devices, config.health_policy()))
}

/// Build the sensor gate. Without a `[sensor]` section the gate has no source
/// and never skips.
pub fn build_sensor_gate(config: &Config) -> Result<SensorGate> {
    let settings = config.sensor_settings();
    let source: Option<Box<dyn SensorSource>> = match &config.sensor {
        Some(s) => {
            let http = HttpSensor::new(&s.url, settings.fetch_timeout)
                .context("failed to set up sensor client")?;
            Some(Box::new(http))
        }
        None => {
            tracing::warn!("no [sensor] configured, humidity skip disabled");
            None
        }
    };
    Ok(SensorGate::new(source, settings))
}

// ===========================================================================
// Tests
// ===========================================================================
