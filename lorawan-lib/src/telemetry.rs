//! Telemetry relay: where decoded uplinks go and pending downlinks come from.
//!
//! `Telemetry` opens one `TelemetryChannel` per device. The orchestrator
//! caches the handle in the device session and only ever awaits
//! `poll_downlink`, and always under a timeout; the other calls are
//! dispatched without waiting for them.

use crate::error::LoraError;
use crate::types::Eui64;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

/// Cloud-to-device message waiting to be sent in a receive window.
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkMessage {
    pub id: String,
    pub payload: Bytes,
}

#[async_trait]
pub trait TelemetryChannel: Send + Sync {
    async fn send_uplink(&self, message: Value) -> Result<(), LoraError>;

    /// Wait at most `timeout` for a pending downlink.
    async fn poll_downlink(&self, timeout: Duration) -> Option<DownlinkMessage>;

    /// Persist counters. `fcnt_down` is `None` when only the uplink counter moved.
    async fn update_counters(&self, fcnt_up: u32, fcnt_down: Option<u32>) -> Result<(), LoraError>;

    async fn complete_downlink(&self, message: &DownlinkMessage) -> Result<(), LoraError>;
}

pub type TelemetryHandle = Arc<dyn TelemetryChannel>;

pub trait Telemetry: Send + Sync {
    fn open(&self, dev_eui: &Eui64, primary_key: Option<&str>) -> TelemetryHandle;
}

/// Last counters persisted for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterState {
    pub fcnt_up: u32,
    pub fcnt_down: Option<u32>,
}

/// In-process relay; keeps everything it is handed.
#[derive(Default)]
pub struct MemoryTelemetry {
    channels: DashMap<Eui64, Arc<MemoryChannel>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel for `dev_eui`, created on first use
    pub fn channel(&self, dev_eui: &Eui64) -> Arc<MemoryChannel> {
        Arc::clone(
            self.channels
                .entry(*dev_eui)
                .or_insert_with(|| Arc::new(MemoryChannel::new(*dev_eui)))
                .value(),
        )
    }

    pub fn opened(&self, dev_eui: &Eui64) -> bool {
        self.channels.contains_key(dev_eui)
    }
}

impl Telemetry for MemoryTelemetry {
    fn open(&self, dev_eui: &Eui64, _primary_key: Option<&str>) -> TelemetryHandle {
        debug!(%dev_eui, "Opening telemetry channel");
        self.channel(dev_eui)
    }
}

pub struct MemoryChannel {
    dev_eui: Eui64,
    next_id: AtomicU64,
    uplinks: Mutex<Vec<Value>>,
    pending: Mutex<VecDeque<DownlinkMessage>>,
    arrived: Notify,
    counters: Mutex<Option<CounterState>>,
    completed: Mutex<Vec<String>>,
}

impl MemoryChannel {
    pub fn new(dev_eui: Eui64) -> Self {
        Self {
            dev_eui,
            next_id: AtomicU64::new(1),
            uplinks: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            arrived: Notify::new(),
            counters: Mutex::new(None),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Queue a downlink for the device's next receive window
    pub async fn enqueue_downlink(&self, payload: impl Into<Bytes>) -> DownlinkMessage {
        let message = DownlinkMessage {
            id: format!("{}-{}", self.dev_eui, self.next_id.fetch_add(1, Ordering::Relaxed)),
            payload: payload.into(),
        };
        self.pending.lock().await.push_back(message.clone());
        self.arrived.notify_one();
        message
    }

    pub async fn uplinks(&self) -> Vec<Value> {
        self.uplinks.lock().await.clone()
    }

    pub async fn counters(&self) -> Option<CounterState> {
        *self.counters.lock().await
    }

    pub async fn completed(&self) -> Vec<String> {
        self.completed.lock().await.clone()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[async_trait]
impl TelemetryChannel for MemoryChannel {
    async fn send_uplink(&self, message: Value) -> Result<(), LoraError> {
        info!(dev_eui = %self.dev_eui, "Uplink: {}", message);
        self.uplinks.lock().await.push(message);
        Ok(())
    }

    async fn poll_downlink(&self, timeout: Duration) -> Option<DownlinkMessage> {
        if let Some(message) = self.pending.lock().await.pop_front() {
            return Some(message);
        }
        // notify_one stores a permit when nobody is waiting yet
        tokio::time::timeout(timeout, self.arrived.notified()).await.ok()?;
        self.pending.lock().await.pop_front()
    }

    async fn update_counters(&self, fcnt_up: u32, fcnt_down: Option<u32>) -> Result<(), LoraError> {
        debug!(dev_eui = %self.dev_eui, fcnt_up, ?fcnt_down, "Persisting frame counters");
        *self.counters.lock().await = Some(CounterState { fcnt_up, fcnt_down });
        Ok(())
    }

    async fn complete_downlink(&self, message: &DownlinkMessage) -> Result<(), LoraError> {
        debug!(dev_eui = %self.dev_eui, id = %message.id, "Downlink completed");
        self.completed.lock().await.push(message.id.clone());
        Ok(())
    }
}
