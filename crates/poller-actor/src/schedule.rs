use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use types::{DeviceEndpoint, Polarity};

/// Shift applied to the first tick so inverter and meter reads against the
/// same gateway do not land in the same connection window.
pub const POLARITY_OFFSET: Duration = Duration::from_millis(500);

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// When a poller fires: once after `first_tick`, then every `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub first_tick: Duration,
    pub period: Duration,
}

impl Schedule {
    /// Positive-polarity devices fire [`POLARITY_OFFSET`] before the nominal
    /// boundary and negative-polarity devices the same amount after it. A
    /// non-zero `stagger_ms` adds a stable per-device offset in
    /// `[0, stagger_ms)`.
    pub fn for_endpoint(endpoint: &DeviceEndpoint, stagger_ms: u64) -> Self {
        let period = endpoint.update_interval.max(MIN_PERIOD);
        let nominal = match endpoint.polarity {
            Polarity::Positive => period.saturating_sub(POLARITY_OFFSET),
            Polarity::Negative => period.saturating_add(POLARITY_OFFSET),
        };

        Self {
            first_tick: nominal + stagger_offset(&endpoint.id, stagger_ms),
            period,
        }
    }
}

fn stagger_offset(device_id: &str, stagger_ms: u64) -> Duration {
    if stagger_ms == 0 {
        return Duration::ZERO;
    }

    let mut hasher = DefaultHasher::new();
    device_id.hash(&mut hasher);
    Duration::from_millis(hasher.finish() % stagger_ms)
}
