use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_PORT: u16 = 1502;
pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Zero-based address of the inverter AC power register (`I_AC_Power`).
pub const INVERTER_POWER_REGISTER: u16 = 40_083;
/// Zero-based address of the inverter AC power scale factor (`I_AC_Power_SF`).
pub const INVERTER_POWER_SF_REGISTER: u16 = 40_084;

/// Sign applied to a decoded reading before it is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Readings are forced positive (production, import).
    Positive,
    /// Readings are negated (export-style meters).
    Negative,
}

impl Polarity {
    pub fn from_force_positive(force_positive: bool) -> Self {
        if force_positive {
            Polarity::Positive
        } else {
            Polarity::Negative
        }
    }

    pub fn is_positive(self) -> bool {
        matches!(self, Polarity::Positive)
    }
}

/// One polled device. Built once from configuration and never mutated by the poller.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEndpoint {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub update_interval: Duration,
    pub unit_id: u8,
    /// 0 selects the inverter's own registers, N > 0 selects external meter N.
    pub meter: u8,
    pub power_register: Option<u16>,
    pub scale_factor_register: Option<u16>,
    /// Decode the power register as u16 instead of two's-complement i16.
    pub unsigned: bool,
    pub polarity: Polarity,
}

impl DeviceEndpoint {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            host: host.into(),
            port: DEFAULT_PORT,
            update_interval: Duration::from_secs(DEFAULT_UPDATE_INTERVAL_SECS),
            unit_id: DEFAULT_UNIT_ID,
            meter: 0,
            power_register: None,
            scale_factor_register: None,
            unsigned: true,
            polarity: Polarity::Positive,
        }
    }

    pub fn is_meter(&self) -> bool {
        self.meter > 0
    }

    /// Resolves the registers to read for this endpoint.
    ///
    /// Inverters (meter 0) fall back to the SunSpec inverter addresses for
    /// whichever register is not configured. Meters have no defaults: a meter
    /// without a power register cannot be polled, while a missing scale-factor
    /// register means the power register is used unscaled.
    pub fn register_layout(&self) -> Result<RegisterLayout, ConfigError> {
        if self.is_meter() {
            let power = self
                .power_register
                .ok_or(ConfigError::MissingPowerRegister { meter: self.meter })?;
            return Ok(RegisterLayout {
                power,
                scale_factor: self.scale_factor_register,
            });
        }

        Ok(RegisterLayout {
            power: self.power_register.unwrap_or(INVERTER_POWER_REGISTER),
            scale_factor: Some(
                self.scale_factor_register
                    .unwrap_or(INVERTER_POWER_SF_REGISTER),
            ),
        })
    }
}

/// Register addresses read in a single poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    pub power: u16,
    pub scale_factor: Option<u16>,
}

impl RegisterLayout {
    /// True when both registers can be fetched with one two-register read.
    pub fn is_contiguous(&self) -> bool {
        self.scale_factor == self.power.checked_add(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("meter {meter} has no power register configured")]
    MissingPowerRegister { meter: u8 },
}
