//! Device directory: resolves DevAddr to session keys and performs the
//! server side of OTAA.
//!
//! The orchestrator only talks to the `DeviceDirectory` trait. A networked
//! key-issuance service implements it in production; `MemoryDirectory` is
//! the in-process implementation backed by a device registry file.

use crate::crypto;
use crate::error::LoraError;
use crate::mac::JoinRequestFrame;
use crate::types::{AesKey, AppNonce, DevAddr, DevNonce, Eui64, NetId};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Keys for a device that is already activated.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceKeys {
    pub dev_eui: Eui64,
    pub app_eui: Option<Eui64>,
    pub nwk_s_key: AesKey,
    pub app_s_key: Option<AesKey>,
    pub primary_key: Option<String>,
}

/// Key material issued by a successful join.
#[derive(Debug, Clone, PartialEq)]
pub struct OtaaSession {
    pub dev_addr: DevAddr,
    pub app_key: AesKey,
    pub nwk_s_key: AesKey,
    pub app_s_key: Option<AesKey>,
    pub app_nonce: AppNonce,
    pub net_id: NetId,
    pub primary_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OtaaOutcome {
    Accepted(OtaaSession),
    Rejected { is_our_device: bool },
    /// The Join-Request did not authenticate under the device's AppKey.
    /// Nothing was changed.
    InvalidMic,
}

impl OtaaOutcome {
    pub fn is_join_valid(&self) -> bool {
        matches!(self, OtaaOutcome::Accepted(_))
    }
}

/// Key-issuance collaborator.
///
/// `Ok(None)` from `get_keys` means the address does not belong to this
/// network. `Err(LoraError::DirectoryUnavailable)` means the directory could
/// not answer; callers must not cache that as a negative result.
///
/// Implementations of `perform_otaa` must check the Join-Request MIC under
/// the AppKey before touching any state, assign a DevAddr that is unique at
/// assignment time, and refuse a DevNonce that was already consumed.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn get_keys(&self, dev_addr: &DevAddr) -> Result<Option<DeviceKeys>, LoraError>;

    async fn perform_otaa(&self, request: &JoinRequestFrame) -> Result<OtaaOutcome, LoraError>;
}

/// One entry of the device registry file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub dev_eui: Eui64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_eui: Option<Eui64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_key: Option<AesKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_addr: Option<DevAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nwk_s_key: Option<AesKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_s_key: Option<AesKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_nonce: Option<DevNonce>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_nonce: Option<AppNonce>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
}

impl DeviceRecord {
    fn keys(&self) -> Option<DeviceKeys> {
        Some(DeviceKeys {
            dev_eui: self.dev_eui,
            app_eui: self.app_eui,
            nwk_s_key: self.nwk_s_key?,
            app_s_key: self.app_s_key,
            primary_key: self.primary_key.clone(),
        })
    }
}

/// Registry held in memory.
pub struct MemoryDirectory {
    net_id: NetId,
    devices: DashMap<Eui64, DeviceRecord>,
    addresses: DashMap<DevAddr, Eui64>,
}

impl MemoryDirectory {
    pub fn new(net_id: NetId) -> Self {
        Self {
            net_id,
            devices: DashMap::new(),
            addresses: DashMap::new(),
        }
    }

    pub fn from_records(net_id: NetId, records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let directory = Self::new(net_id);
        for record in records {
            directory.insert(record);
        }
        directory
    }

    /// Parse a JSON array of `DeviceRecord`
    pub fn from_json(net_id: NetId, json: &str) -> Result<Self, LoraError> {
        let records: Vec<DeviceRecord> = serde_json::from_str(json)?;
        Ok(Self::from_records(net_id, records))
    }

    pub fn insert(&self, record: DeviceRecord) {
        if let Some(dev_addr) = record.dev_addr {
            self.addresses.insert(dev_addr, record.dev_eui);
        }
        self.devices.insert(record.dev_eui, record);
    }

    pub fn record(&self, dev_eui: &Eui64) -> Option<DeviceRecord> {
        self.devices.get(dev_eui).map(|r| r.value().clone())
    }

    pub fn net_id(&self) -> NetId {
        self.net_id
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Reserve a random address in this network's NwkID range.
    ///
    /// The 7-bit NwkID (low bits of the NetID) fills the top of the address;
    /// the remaining 25 bits are random and redrawn until unused.
    fn allocate_dev_addr(&self, dev_eui: Eui64) -> DevAddr {
        let nwk_id = u32::from(self.net_id.0[2] & 0x7F);
        loop {
            let candidate = DevAddr::from_bytes(((nwk_id << 25) | (rand::random::<u32>() & 0x01FF_FFFF)).to_be_bytes());
            if let Entry::Vacant(slot) = self.addresses.entry(candidate) {
                slot.insert(dev_eui);
                return candidate;
            }
            debug!(dev_addr = %candidate, "DevAddr already assigned, drawing another");
        }
    }

    fn release_dev_addr(&self, dev_addr: &DevAddr, dev_eui: &Eui64) {
        self.addresses.remove_if(dev_addr, |_, owner| owner == dev_eui);
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDirectory {
    async fn get_keys(&self, dev_addr: &DevAddr) -> Result<Option<DeviceKeys>, LoraError> {
        let Some(dev_eui) = self.addresses.get(dev_addr).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self.devices.get(&dev_eui).and_then(|record| record.keys()))
    }

    async fn perform_otaa(&self, request: &JoinRequestFrame) -> Result<OtaaOutcome, LoraError> {
        let (dev_eui, app_eui, dev_nonce) = (&request.dev_eui, &request.app_eui, &request.dev_nonce);

        let Some(record) = self.record(dev_eui) else {
            info!(%dev_eui, "OTAA refused, unknown device");
            return Ok(OtaaOutcome::Rejected { is_our_device: false });
        };

        match record.app_eui {
            Some(expected) if expected == *app_eui => {}
            Some(_) => {
                warn!(%dev_eui, %app_eui, "OTAA refused, AppEUI does not match");
                return Ok(OtaaOutcome::Rejected { is_our_device: true });
            }
            None => {
                warn!(%dev_eui, "OTAA refused, no AppEUI on record");
                return Ok(OtaaOutcome::Rejected { is_our_device: true });
            }
        }

        let Some(app_key) = record.app_key else {
            warn!(%dev_eui, "OTAA refused, no AppKey on record");
            return Ok(OtaaOutcome::Rejected { is_our_device: true });
        };

        if !request.verify_mic(&app_key) {
            warn!(%dev_eui, "OTAA refused, Join-Request MIC does not verify");
            return Ok(OtaaOutcome::InvalidMic);
        }

        if record.dev_nonce == Some(*dev_nonce) {
            warn!(%dev_eui, %dev_nonce, "OTAA refused, DevNonce already used");
            return Ok(OtaaOutcome::Rejected { is_our_device: true });
        }

        let app_nonce = AppNonce::from_bytes(rand::random());
        let (nwk_s_key, app_s_key) = crypto::derive_session_keys(&app_nonce, &self.net_id, dev_nonce, &app_key);
        let dev_addr = self.allocate_dev_addr(*dev_eui);

        if let Some(mut entry) = self.devices.get_mut(dev_eui) {
            if let Some(previous) = entry.dev_addr.replace(dev_addr) {
                if previous != dev_addr {
                    self.release_dev_addr(&previous, dev_eui);
                }
            }
            entry.nwk_s_key = Some(nwk_s_key);
            entry.app_s_key = Some(app_s_key);
            entry.dev_nonce = Some(*dev_nonce);
            entry.app_nonce = Some(app_nonce);
        }

        info!(%dev_eui, %dev_addr, "OTAA accepted");
        Ok(OtaaOutcome::Accepted(OtaaSession {
            dev_addr,
            app_key,
            nwk_s_key,
            app_s_key: Some(app_s_key),
            app_nonce,
            net_id: self.net_id,
            primary_key: record.primary_key,
        }))
    }
}
