//! Per-device session state and the in-memory store that owns it.
//!
//! Every session lives in a slot guarded by its own `tokio::sync::Mutex`.
//! A slot is reachable by DevAddr (data frames) and, for joined devices, by
//! DevEUI as well; both keys then point at the same slot so that join replay
//! checks and frame-counter updates see one record. Holding a slot's guard
//! serializes the whole read-validate-write sequence for that device.
//!
//! Lock order when both keys are involved is DevEUI first. The data path only
//! ever locks by DevAddr.

use crate::directory::{DeviceKeys, OtaaSession};
use crate::error::LoraError;
use crate::mac::JoinRequestFrame;
use crate::telemetry::TelemetryHandle;
use crate::types::{AesKey, DevAddr, DevNonce, Eui64};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lookup key for a session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    DevAddr(DevAddr),
    DevEui(Eui64),
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::DevAddr(addr) => write!(f, "DevAddr {}", addr),
            SessionKey::DevEui(eui) => write!(f, "DevEUI {}", eui),
        }
    }
}

impl From<DevAddr> for SessionKey {
    fn from(addr: DevAddr) -> Self {
        SessionKey::DevAddr(addr)
    }
}

impl From<Eui64> for SessionKey {
    fn from(eui: Eui64) -> Self {
        SessionKey::DevEui(eui)
    }
}

#[derive(Clone, Default)]
pub struct DeviceSession {
    pub dev_addr: Option<DevAddr>,
    pub dev_eui: Option<Eui64>,
    pub app_eui: Option<Eui64>,
    pub nwk_s_key: Option<AesKey>,
    pub app_s_key: Option<AesKey>,
    /// Only populated for the join phase
    pub app_key: Option<AesKey>,
    /// Last DevNonce seen from this device
    pub dev_nonce: Option<DevNonce>,
    pub primary_key: Option<String>,
    pub is_known_device: bool,
    pub is_join_valid: bool,
    pub fcnt_up: u32,
    pub fcnt_down: u32,
    /// Opened lazily on the first authenticated frame
    pub telemetry: Option<TelemetryHandle>,
}

impl DeviceSession {
    /// Negative entry for a DevAddr the directory does not know
    pub fn unknown(dev_addr: DevAddr) -> Self {
        Self {
            dev_addr: Some(dev_addr),
            ..Default::default()
        }
    }

    /// Session for an already-provisioned device, as returned by the directory
    pub fn from_keys(dev_addr: DevAddr, keys: DeviceKeys) -> Self {
        Self {
            dev_addr: Some(dev_addr),
            dev_eui: Some(keys.dev_eui),
            app_eui: keys.app_eui,
            nwk_s_key: Some(keys.nwk_s_key),
            app_s_key: keys.app_s_key,
            primary_key: keys.primary_key,
            is_known_device: true,
            ..Default::default()
        }
    }

    /// Record of a refused join, kept to recognize a replay of the same DevNonce
    pub fn rejected_join(request: &JoinRequestFrame, is_our_device: bool) -> Self {
        Self {
            dev_eui: Some(request.dev_eui),
            app_eui: Some(request.app_eui),
            dev_nonce: Some(request.dev_nonce),
            is_known_device: is_our_device,
            is_join_valid: false,
            ..Default::default()
        }
    }

    /// Fresh session after a successful join. Both counters restart at zero.
    pub fn joined(request: &JoinRequestFrame, otaa: OtaaSession) -> Self {
        Self {
            dev_addr: Some(otaa.dev_addr),
            dev_eui: Some(request.dev_eui),
            app_eui: Some(request.app_eui),
            nwk_s_key: Some(otaa.nwk_s_key),
            app_s_key: otaa.app_s_key,
            app_key: Some(otaa.app_key),
            dev_nonce: Some(request.dev_nonce),
            primary_key: otaa.primary_key,
            is_known_device: true,
            is_join_valid: true,
            fcnt_up: 0,
            fcnt_down: 0,
            telemetry: None,
        }
    }

    /// Distrust the device until the process restarts
    pub fn mark_untrusted(&mut self) {
        self.is_known_device = false;
    }

    /// Accept counters that advance, plus the ABP reset case: a counter of 1
    /// from a device without an AppEUI on record.
    pub fn check_fcnt(&self, fcnt: u16) -> Result<(), LoraError> {
        let received = u32::from(fcnt);
        if received > self.fcnt_up || (received == 1 && self.app_eui.is_none()) {
            Ok(())
        } else {
            Err(LoraError::StaleFrameCounter {
                received,
                current: self.fcnt_up,
            })
        }
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keys stay out of logs
        f.debug_struct("DeviceSession")
            .field("dev_addr", &self.dev_addr)
            .field("dev_eui", &self.dev_eui)
            .field("app_eui", &self.app_eui)
            .field("dev_nonce", &self.dev_nonce)
            .field("is_known_device", &self.is_known_device)
            .field("is_join_valid", &self.is_join_valid)
            .field("fcnt_up", &self.fcnt_up)
            .field("fcnt_down", &self.fcnt_down)
            .field("has_telemetry", &self.telemetry.is_some())
            .finish()
    }
}

pub type SessionSlot = Arc<Mutex<Option<DeviceSession>>>;

/// Exclusive access to one slot; `None` means nothing is cached yet.
pub type SessionGuard = OwnedMutexGuard<Option<DeviceSession>>;

/// In-memory session cache. Purely additive: nothing is evicted.
#[derive(Default)]
pub struct SessionStore {
    slots: DashMap<SessionKey, SessionSlot>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: SessionKey) -> SessionSlot {
        // Clone the Arc out so no shard lock is held across an await
        Arc::clone(self.slots.entry(key).or_default().value())
    }

    /// Lock the slot for `key`, creating an empty one if needed.
    pub async fn lock(&self, key: impl Into<SessionKey>) -> SessionGuard {
        self.slot(key.into()).lock_owned().await
    }

    /// Snapshot of the session stored under `key`
    pub async fn lookup(&self, key: impl Into<SessionKey>) -> Option<DeviceSession> {
        let slot = self.slots.get(&key.into()).map(|entry| Arc::clone(entry.value()))?;
        let guard = slot.lock().await;
        guard.clone()
    }

    /// Store `session` under `key`, overwriting whatever was there.
    pub async fn put(&self, key: impl Into<SessionKey>, session: DeviceSession) {
        *self.lock(key).await = Some(session);
    }

    /// Returns false when no session is cached for `dev_addr`.
    pub async fn mark_untrusted(&self, dev_addr: DevAddr) -> bool {
        let mut guard = self.lock(dev_addr).await;
        match guard.as_mut() {
            Some(session) => {
                session.mark_untrusted();
                true
            }
            None => false,
        }
    }

    /// Point `key` at the slot held by `guard`, so both keys share one session.
    pub fn alias(&self, key: impl Into<SessionKey>, guard: &SessionGuard) {
        self.slots.insert(key.into(), Arc::clone(OwnedMutexGuard::mutex(guard)));
    }

    /// Drop `key` if, and only if, it still points at the slot held by `guard`.
    pub fn unalias(&self, key: impl Into<SessionKey>, guard: &SessionGuard) {
        let slot = OwnedMutexGuard::mutex(guard);
        self.slots.remove_if(&key.into(), |_, current| Arc::ptr_eq(current, slot));
    }

    pub fn contains(&self, key: impl Into<SessionKey>) -> bool {
        self.slots.contains_key(&key.into())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> DevAddr {
        s.parse().unwrap()
    }

    fn known(dev_addr: DevAddr) -> DeviceSession {
        DeviceSession {
            dev_addr: Some(dev_addr),
            is_known_device: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_counter_must_advance() {
        let mut session = known(addr("01020304"));
        session.app_eui = Some("0000000000000001".parse().unwrap());
        session.fcnt_up = 10;

        assert!(session.check_fcnt(11).is_ok());
        assert!(matches!(
            session.check_fcnt(10),
            Err(LoraError::StaleFrameCounter { received: 10, current: 10 })
        ));
        assert!(session.check_fcnt(1).is_err());
    }

    #[test]
    fn test_abp_reset_needs_missing_app_eui() {
        let mut session = known(addr("01020304"));
        session.fcnt_up = 500;
        assert!(session.check_fcnt(1).is_ok());
        assert!(session.check_fcnt(2).is_err());
    }

    #[tokio::test]
    async fn test_put_lookup_overwrite() {
        let store = SessionStore::new();
        let a = addr("01020304");
        assert!(store.lookup(a).await.is_none());

        store.put(a, known(a)).await;
        assert!(store.lookup(a).await.unwrap().is_known_device);

        store.put(a, DeviceSession::unknown(a)).await;
        assert!(!store.lookup(a).await.unwrap().is_known_device);
    }

    #[tokio::test]
    async fn test_mark_untrusted() {
        let store = SessionStore::new();
        let a = addr("01020304");
        assert!(!store.mark_untrusted(a).await);

        store.put(a, known(a)).await;
        assert!(store.mark_untrusted(a).await);
        assert!(!store.lookup(a).await.unwrap().is_known_device);
    }

    #[tokio::test]
    async fn test_alias_shares_one_session() {
        let store = SessionStore::new();
        let eui: Eui64 = "BE7A00000000888F".parse().unwrap();
        let a = addr("0028B946");

        {
            let mut guard = store.lock(eui).await;
            *guard = Some(known(a));
            store.alias(a, &guard);
        }

        store.mark_untrusted(a).await;
        assert!(!store.lookup(eui).await.unwrap().is_known_device);

        {
            let guard = store.lock(eui).await;
            store.unalias(a, &guard);
        }
        assert!(!store.contains(a));
        assert!(store.contains(eui));
    }

    #[tokio::test]
    async fn test_unalias_leaves_foreign_slot() {
        let store = SessionStore::new();
        let a = addr("01020304");
        store.put(a, known(a)).await;

        let guard = store.lock(SessionKey::DevEui(Eui64::default())).await;
        store.unalias(a, &guard);
        drop(guard);
        assert!(store.lookup(a).await.is_some());
    }
}
