use std::time::Duration;

use poller_actor::{Schedule, POLARITY_OFFSET};
use types::{DeviceEndpoint, Polarity};

fn endpoint(id: &str, polarity: Polarity, interval_secs: u64) -> DeviceEndpoint {
    let mut endpoint = DeviceEndpoint::new(id, "192.168.1.50");
    endpoint.polarity = polarity;
    endpoint.update_interval = Duration::from_secs(interval_secs);
    endpoint
}

#[test]
fn polarity_offsets_first_tick_around_nominal_boundary() {
    let inverter = Schedule::for_endpoint(&endpoint("inverter", Polarity::Positive, 60), 0);
    let meter = Schedule::for_endpoint(&endpoint("meter", Polarity::Negative, 60), 0);

    assert_eq!(inverter.period, Duration::from_secs(60));
    assert_eq!(meter.period, Duration::from_secs(60));
    assert_eq!(inverter.first_tick, Duration::from_millis(59_500));
    assert_eq!(meter.first_tick, Duration::from_millis(60_500));
    assert_eq!(meter.first_tick - inverter.first_tick, Duration::from_secs(1));
}

#[test]
fn short_interval_does_not_underflow() {
    let mut device = endpoint("fast", Polarity::Positive, 0);
    device.update_interval = Duration::from_millis(200);

    let schedule = Schedule::for_endpoint(&device, 0);

    assert_eq!(schedule.first_tick, Duration::ZERO);
    assert_eq!(schedule.period, Duration::from_millis(200));
}

#[test]
fn zero_interval_keeps_nonzero_period() {
    let schedule = Schedule::for_endpoint(&endpoint("broken", Polarity::Negative, 0), 0);
    assert!(schedule.period > Duration::ZERO);
    assert!(schedule.first_tick >= POLARITY_OFFSET);
}

#[test]
fn stagger_is_stable_and_bounded() {
    let device = endpoint("inverter-garage", Polarity::Positive, 60);
    let first = Schedule::for_endpoint(&device, 2_000);
    let second = Schedule::for_endpoint(&device, 2_000);

    assert_eq!(first, second);
    assert!(first.first_tick >= Duration::from_millis(59_500));
    assert!(first.first_tick < Duration::from_millis(61_500));
    assert_eq!(first.period, Duration::from_secs(60));
}
