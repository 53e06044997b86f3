use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use thiserror::Error;

use crate::config::AppConfig;
use crate::events::EventEmitter;

pub const HEARTBEAT_EVENT: &str = "heartbeat.tick";
pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 60_000;

const STOP_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub management_server_id: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            management_server_id: 1,
        }
    }
}

impl HeartbeatConfig {
    pub fn from_app_config(app_config: &AppConfig) -> Self {
        Self {
            interval_ms: app_config.heartbeat.interval_ms,
            management_server_id: app_config.server.management_server_id,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("heartbeat interval must be between {MIN_INTERVAL_MS}ms and {MAX_INTERVAL_MS}ms, got {provided_ms}ms")]
    InvalidInterval { provided_ms: u64 },
    #[error("heartbeat is already running")]
    AlreadyRunning,
    #[error("failed to spawn heartbeat thread: {message}")]
    Spawn { message: String },
    #[error("heartbeat worker thread join failed")]
    JoinFailed,
}

/// Periodic liveness tick for this management server. Each tick is emitted
/// as a `heartbeat.tick` event carrying a monotonically increasing counter.
pub struct Heartbeat {
    pub initiated_at: DateTime<Utc>,
    config: HeartbeatConfig,
    emitter: Arc<EventEmitter>,
    stop_signal: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn new(emitter: Arc<EventEmitter>, config: HeartbeatConfig) -> Result<Self, HeartbeatError> {
        if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&config.interval_ms) {
            return Err(HeartbeatError::InvalidInterval {
                provided_ms: config.interval_ms,
            });
        }

        Ok(Self {
            initiated_at: Utc::now(),
            config,
            emitter,
            stop_signal: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    pub fn start(&mut self) -> Result<(), HeartbeatError> {
        if self.worker.is_some() {
            return Err(HeartbeatError::AlreadyRunning);
        }

        self.stop_signal.store(false, Ordering::SeqCst);
        let stop_signal = Arc::clone(&self.stop_signal);
        let emitter = Arc::clone(&self.emitter);
        let initiated_at = self.initiated_at;
        let config = self.config;
        let interval = Duration::from_millis(config.interval_ms);

        let worker = thread::Builder::new()
            .name("fleetd-heartbeat".to_owned())
            .spawn(move || {
                let mut tick: u64 = 0;
                while !stop_signal.load(Ordering::SeqCst) {
                    tick += 1;
                    let payload = json!({
                        "tick": tick,
                        "management_server_id": config.management_server_id,
                        "initiated_at": initiated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                        "emitted_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                        "interval_ms": config.interval_ms,
                    });
                    emitter.emit_logged(HEARTBEAT_EVENT, Some(payload));

                    let next_tick = Instant::now() + interval;
                    while !stop_signal.load(Ordering::SeqCst) {
                        let remaining = next_tick.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        thread::sleep(remaining.min(STOP_POLL));
                    }
                }
            })
            .map_err(|error| HeartbeatError::Spawn {
                message: error.to_string(),
            })?;

        self.worker = Some(worker);
        tracing::debug!(target: "heartbeat", interval_ms = config.interval_ms, "heartbeat started");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), HeartbeatError> {
        self.stop_signal.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker.take() {
            return handle.join().map_err(|_| HeartbeatError::JoinFailed);
        }

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
