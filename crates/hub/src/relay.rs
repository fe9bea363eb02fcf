//! Contact relays on GPIO output lines. The `gpio` feature gates the real
//! rppal driver; without it a mock relay logs transitions instead.

use async_trait::async_trait;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};
#[cfg(feature = "gpio")]
use std::sync::{Mutex, PoisonError};
#[cfg(feature = "gpio")]
use tracing::error;

#[cfg(not(feature = "gpio"))]
use std::sync::atomic::{AtomicBool, Ordering};

use crate::device::{Actuator, State};
use crate::error::DeviceError;

/// Output level that produces `on` for a relay of the given polarity.
/// Active-low boards switch on with LOW; active-high with HIGH.
pub fn level_for(on: bool, active_low: bool) -> bool {
    on != active_low
}

/// Inverse of [`level_for`]: whether a pin reading HIGH means the relay is on.
pub fn on_from_level(high: bool, active_low: bool) -> bool {
    high != active_low
}

fn polarity(active_low: bool) -> &'static str {
    if active_low {
        "active-low"
    } else {
        "active-high"
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay (production: requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct ContactRelay {
    device_id: String,
    gpio_pin: u8,
    active_low: bool,
    pin: Result<Mutex<OutputPin>, String>,
}

#[cfg(feature = "gpio")]
impl ContactRelay {
    /// Claim the pin and drive it to OFF. A pin that cannot be claimed leaves
    /// the relay registered but not initialised.
    pub fn new(device_id: &str, gpio_pin: u8, active_low: bool) -> Self {
        let pin = Gpio::new()
            .and_then(|gpio| gpio.get(gpio_pin))
            .map(|pin| {
                let mut out = pin.into_output();
                drive(&mut out, level_for(false, active_low));
                info!(device = %device_id, gpio_pin, polarity = polarity(active_low), "relay ready");
                Mutex::new(out)
            })
            .map_err(|e| {
                error!(device = %device_id, gpio_pin, error = %e, "relay init failed");
                format!("gpio {gpio_pin}: {e}")
            });

        Self {
            device_id: device_id.to_string(),
            gpio_pin,
            active_low,
            pin,
        }
    }

    fn pin(&self) -> Result<std::sync::MutexGuard<'_, OutputPin>, DeviceError> {
        match &self.pin {
            Ok(pin) => Ok(pin.lock().unwrap_or_else(PoisonError::into_inner)),
            Err(reason) => Err(DeviceError::NotInitialized(format!(
                "{}: {reason}",
                self.device_id
            ))),
        }
    }
}

#[cfg(feature = "gpio")]
fn drive(pin: &mut OutputPin, high: bool) {
    if high {
        pin.set_high();
    } else {
        pin.set_low();
    }
}

#[cfg(feature = "gpio")]
#[async_trait]
impl Actuator for ContactRelay {
    async fn set(&self, on: bool) -> Result<(), DeviceError> {
        let mut pin = self.pin()?;
        drive(&mut pin, level_for(on, self.active_low));
        Ok(())
    }

    async fn query(&self) -> Result<State, DeviceError> {
        let pin = self.pin()?;
        Ok(State::from_on(on_from_level(
            pin.is_set_high(),
            self.active_low,
        )))
    }

    async fn probe(&self) -> Result<String, DeviceError> {
        let state = self.query().await?;
        Ok(format!(
            "gpio {} ({}) reads {state:?}",
            self.gpio_pin,
            polarity(self.active_low)
        ))
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development: no hardware, logs transitions)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct ContactRelay {
    device_id: String,
    gpio_pin: u8,
    active_low: bool,
    on: AtomicBool,
}

#[cfg(not(feature = "gpio"))]
impl ContactRelay {
    pub fn new(device_id: &str, gpio_pin: u8, active_low: bool) -> Self {
        info!(
            device = %device_id,
            gpio_pin,
            polarity = polarity(active_low),
            "mock-gpio: relay registered (not wired)"
        );
        Self {
            device_id: device_id.to_string(),
            gpio_pin,
            active_low,
            on: AtomicBool::new(false),
        }
    }
}

#[cfg(not(feature = "gpio"))]
#[async_trait]
impl Actuator for ContactRelay {
    async fn set(&self, on: bool) -> Result<(), DeviceError> {
        self.on.store(on, Ordering::SeqCst);
        info!(
            device = %self.device_id,
            gpio_pin = self.gpio_pin,
            level = if level_for(on, self.active_low) { "HIGH" } else { "LOW" },
            "mock-gpio: relay {}",
            if on { "ON" } else { "OFF" }
        );
        Ok(())
    }

    async fn query(&self) -> Result<State, DeviceError> {
        Ok(State::from_on(self.on.load(Ordering::SeqCst)))
    }

    async fn probe(&self) -> Result<String, DeviceError> {
        Ok(format!(
            "mock gpio {} ({})",
            self.gpio_pin,
            polarity(self.active_low)
        ))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
