use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use modbus_client::{ClientConfig, ModbusTransport};
use poller_actor::{ActorConfig, ChannelSink, DevicePoller, PublishSink, Reading};
use power_bridge::BridgeConfig;
use types::DeviceEndpoint;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = parse_config_arg();
    let config = BridgeConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;
    for device in config.unpollable_devices() {
        warn!(
            device = %device.id,
            meter = device.meter,
            "meter has no power register configured, its cycles will be skipped"
        );
    }

    if let Some(addr) = config.metrics_addr()? {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("metrics exporter install failed")?;
        info!(%addr, "metrics exporter listening");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sink, rx) = ChannelSink::channel(config.channel_capacity);
    let sink: Arc<dyn PublishSink> = Arc::new(sink);
    let reading_handle = tokio::spawn(reading_task(rx, shutdown_rx.clone()));

    let specs = build_poller_specs(&config, sink, shutdown_rx.clone());

    let mut join_set = JoinSet::new();
    for spec in specs.values() {
        spawn_poller(spec.clone(), &mut join_set, Duration::ZERO);
    }
    info!(devices = specs.len(), "pollers started");

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    let mut shutdown_signal = std::pin::pin!(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
                break;
            }
            maybe_result = join_set.join_next() => {
                match maybe_result {
                    Some(Ok(id)) => {
                        warn!(device = %id, "poller exited unexpectedly, respawning");
                        if let Some(spec) = specs.get(&id) {
                            spawn_poller(
                                spec.clone(),
                                &mut join_set,
                                Duration::from_millis(config.respawn_delay_ms),
                            );
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "poller task failed");
                    }
                    None => break,
                }
            }
        }
    }

    // pollers finish their in-flight cycle and close the transport
    let drained = timeout(SHUTDOWN_GRACE, async {
        while let Some(result) = join_set.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "poller task join failed");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("pollers did not stop in time, aborting");
        join_set.abort_all();
    }

    let _ = reading_handle.await;
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

#[derive(Clone)]
struct PollerSpec {
    endpoint: DeviceEndpoint,
    modbus_config: ClientConfig,
    poller_config: ActorConfig,
    sink: Arc<dyn PublishSink>,
    shutdown: watch::Receiver<bool>,
}

fn build_poller_specs(
    config: &BridgeConfig,
    sink: Arc<dyn PublishSink>,
    shutdown: watch::Receiver<bool>,
) -> HashMap<String, PollerSpec> {
    config
        .devices
        .iter()
        .map(|endpoint| {
            let spec = PollerSpec {
                endpoint: endpoint.clone(),
                modbus_config: config.modbus.clone(),
                poller_config: config.poller.clone(),
                sink: sink.clone(),
                shutdown: shutdown.clone(),
            };
            (endpoint.id.clone(), spec)
        })
        .collect()
}

fn spawn_poller(spec: PollerSpec, join_set: &mut JoinSet<String>, delay: Duration) {
    join_set.spawn(async move {
        if delay > Duration::ZERO {
            sleep(delay).await;
        }
        let id = spec.endpoint.id.clone();
        let transport = ModbusTransport::new(spec.endpoint.unit_id, spec.modbus_config);
        let poller = DevicePoller::new(
            spec.endpoint,
            transport,
            spec.sink,
            spec.shutdown,
            spec.poller_config,
        );
        poller.run().await;
        id
    });
}

async fn reading_task(mut rx: mpsc::Receiver<Reading>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            maybe_reading = rx.recv() => {
                match maybe_reading {
                    Some(reading) => record_reading(&reading),
                    None => break,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    while let Ok(reading) = rx.try_recv() {
                        record_reading(&reading);
                    }
                    info!("reading consumer shutdown requested");
                    break;
                }
            }
        }
    }
}

fn record_reading(reading: &Reading) {
    match serde_json::to_string(reading) {
        Ok(payload) => info!(device = %reading.device_id, %payload, "reading published"),
        Err(err) => warn!(device = %reading.device_id, error = %err, "reading serialize failed"),
    }
    counter!("bridge_readings_published_total", "device" => reading.device_id.clone()).increment(1);
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(
    mut shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
