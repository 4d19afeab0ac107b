use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Receives the latest reading of a device once per completed poll.
///
/// Implementations must return immediately; a slow consumer must not hold up
/// the next poll cycle.
pub trait PublishSink: Send + Sync {
    fn update(&self, device_id: &str, value: f64);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub device_id: String,
    pub value: f64,
    pub published_at_ms: u64,
}

/// Forwards readings into a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<Reading>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<Reading>) -> Self {
        Self { sender }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Reading>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender), receiver)
    }
}

impl PublishSink for ChannelSink {
    fn update(&self, device_id: &str, value: f64) {
        let reading = Reading {
            device_id: device_id.to_string(),
            value,
            published_at_ms: unix_ms(),
        };

        match self.sender.try_send(reading) {
            Ok(()) => {}
            Err(TrySendError::Full(reading)) => {
                warn!(
                    device = %reading.device_id,
                    value = reading.value,
                    "reading channel full, dropping update"
                );
            }
            Err(TrySendError::Closed(reading)) => {
                debug!(device = %reading.device_id, "reading channel closed");
            }
        }
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
