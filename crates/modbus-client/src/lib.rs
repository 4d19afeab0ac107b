use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::lookup_host;
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::{Reader, Slave};
use tracing::{debug, trace, warn};

/// Configuration options shared by every Modbus TCP session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on connect and on each register request, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { timeout_ms: 1_000 }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot resolve {0}:{1}")]
    InvalidAddress(String, u16),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("short response at {address}: expected {expected} registers, got {actual}")]
    ShortResponse {
        address: u16,
        expected: u16,
        actual: usize,
    },
    #[error("transport is not connected")]
    NotConnected,
}

impl TransportError {
    /// Network faults that are expected to clear on their own and are retried
    /// on the next poll cycle. Everything else is a protocol or usage error.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout { .. } => true,
            TransportError::Io(err) => is_transient_io(err.kind()),
            TransportError::InvalidAddress(..)
            | TransportError::ShortResponse { .. }
            | TransportError::NotConnected => false,
        }
    }
}

fn is_transient_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
    )
}

/// Register-oriented session with a single device.
///
/// Implementations hold at most one open session. `close` must be safe to
/// call on a transport that is already closed or was never connected.
#[async_trait]
pub trait RegisterTransport: Send {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError>;

    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn close(&mut self);
}

/// Modbus TCP transport backed by tokio-modbus.
pub struct ModbusTransport {
    config: ClientConfig,
    unit_id: u8,
    context: Option<Context>,
}

impl ModbusTransport {
    pub fn new(unit_id: u8, config: ClientConfig) -> Self {
        Self {
            config,
            unit_id,
            context: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.context.is_some()
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms.max(1))
    }

    /// Takes no `self`: `Context` is not `Sync`, so a borrow of the transport
    /// held across this await would make `connect` non-`Send`.
    async fn resolve(
        host: &str,
        port: u16,
        limit: Duration,
        timeout_ms: u64,
    ) -> Result<SocketAddr, TransportError> {
        let mut addrs = timeout(limit, lookup_host((host, port)))
            .await
            .map_err(|_| TransportError::Timeout { timeout_ms })??;
        addrs
            .next()
            .ok_or_else(|| TransportError::InvalidAddress(host.to_string(), port))
    }
}

#[async_trait]
impl RegisterTransport for ModbusTransport {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        if self.context.is_some() {
            warn!(host, port, "connect called with an open session, closing it first");
            self.close().await;
        }

        let limit = self.request_timeout();
        let timeout_ms = self.config.timeout_ms;
        let unit_id = self.unit_id;

        let addr = Self::resolve(host, port, limit, timeout_ms).await?;
        let context = timeout(limit, tcp::connect_slave(addr, Slave(unit_id)))
            .await
            .map_err(|_| TransportError::Timeout { timeout_ms })??;

        debug!(%addr, unit_id, "modbus connected");
        self.context = Some(context);
        Ok(())
    }

    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let request_timeout = self.request_timeout();
        let timeout_ms = self.config.timeout_ms;
        let ctx = self.context.as_mut().ok_or(TransportError::NotConnected)?;

        let values = timeout(request_timeout, ctx.read_holding_registers(address, count))
            .await
            .map_err(|_| TransportError::Timeout { timeout_ms })??;

        if values.len() < usize::from(count) {
            return Err(TransportError::ShortResponse {
                address,
                expected: count,
                actual: values.len(),
            });
        }

        trace!(address, count, ?values, "modbus read ok");
        Ok(values)
    }

    async fn close(&mut self) {
        let Some(mut ctx) = self.context.take() else {
            return;
        };
        if let Err(err) = ctx.disconnect().await {
            debug!(error = %err, "modbus disconnect failed");
        }
    }
}
