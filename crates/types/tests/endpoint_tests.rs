use std::time::Duration;

use types::{
    ConfigError, DeviceEndpoint, Polarity, RegisterLayout, DEFAULT_PORT, INVERTER_POWER_REGISTER,
    INVERTER_POWER_SF_REGISTER,
};

#[test]
fn new_endpoint_uses_defaults() {
    let endpoint = DeviceEndpoint::new("inverter", "192.168.1.50");
    assert_eq!(endpoint.name, "inverter");
    assert_eq!(endpoint.port, DEFAULT_PORT);
    assert_eq!(endpoint.update_interval, Duration::from_secs(60));
    assert_eq!(endpoint.unit_id, 1);
    assert_eq!(endpoint.meter, 0);
    assert!(endpoint.unsigned);
    assert_eq!(endpoint.polarity, Polarity::Positive);
}

#[test]
fn inverter_falls_back_to_default_registers() {
    let endpoint = DeviceEndpoint::new("inverter", "10.0.0.2");
    let layout = endpoint.register_layout().expect("layout");
    assert_eq!(
        layout,
        RegisterLayout {
            power: INVERTER_POWER_REGISTER,
            scale_factor: Some(INVERTER_POWER_SF_REGISTER),
        }
    );
    assert!(layout.is_contiguous());
}

#[test]
fn inverter_defaults_apply_per_register() {
    let mut endpoint = DeviceEndpoint::new("inverter", "10.0.0.2");
    endpoint.power_register = Some(40_100);
    let layout = endpoint.register_layout().expect("layout");
    assert_eq!(layout.power, 40_100);
    assert_eq!(layout.scale_factor, Some(INVERTER_POWER_SF_REGISTER));
    assert!(!layout.is_contiguous());
}

#[test]
fn meter_requires_power_register() {
    let mut endpoint = DeviceEndpoint::new("grid", "10.0.0.2");
    endpoint.meter = 1;
    assert_eq!(
        endpoint.register_layout(),
        Err(ConfigError::MissingPowerRegister { meter: 1 })
    );

    endpoint.power_register = Some(40_206);
    let layout = endpoint.register_layout().expect("layout");
    assert_eq!(layout.power, 40_206);
    assert_eq!(layout.scale_factor, None);

    endpoint.scale_factor_register = Some(40_210);
    let layout = endpoint.register_layout().expect("layout");
    assert_eq!(layout.scale_factor, Some(40_210));
    assert!(!layout.is_contiguous());
}

#[test]
fn contiguous_layout_does_not_wrap() {
    let layout = RegisterLayout {
        power: u16::MAX,
        scale_factor: Some(0),
    };
    assert!(!layout.is_contiguous());
}

#[test]
fn polarity_from_flag() {
    assert_eq!(Polarity::from_force_positive(true), Polarity::Positive);
    assert_eq!(Polarity::from_force_positive(false), Polarity::Negative);
    assert!(!Polarity::Negative.is_positive());
}
