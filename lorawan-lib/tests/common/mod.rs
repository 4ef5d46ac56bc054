//! Common test utilities and shared imports

// Shared across test files; not every item is used in each of them
#[allow(unused_imports)]
pub use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use hex;
#[allow(unused_imports)]
pub use lorawan_lib::directory::{DeviceDirectory, DeviceKeys, DeviceRecord, MemoryDirectory, OtaaOutcome};
#[allow(unused_imports)]
pub use lorawan_lib::error::LoraError;
#[allow(unused_imports)]
pub use lorawan_lib::mac::{DataFrame, JoinAcceptFrame, JoinRequestFrame, MacPayload, MessageType, encode_data_frame};
#[allow(unused_imports)]
pub use lorawan_lib::semtech::{self, GatewayFrame, Identifier, PullRespBody};
#[allow(unused_imports)]
pub use lorawan_lib::session::{SessionKey, SessionStore};
#[allow(unused_imports)]
pub use lorawan_lib::telemetry::{DownlinkMessage, MemoryTelemetry, Telemetry, TelemetryChannel, TelemetryHandle};
#[allow(unused_imports)]
pub use lorawan_lib::types::{AesKey, DevAddr, DevNonce, Eui64, NetId};
#[allow(unused_imports)]
pub use lorawan_lib::{MessageProcessor, ProcessorConfig};
#[allow(unused_imports)]
pub use std::sync::Arc;
#[allow(unused_imports)]
pub use std::time::Duration;

use async_trait::async_trait;

/// Key used by the captured reference frames
#[allow(dead_code)]
pub const TEST_KEY: &str = "2B7E151628AED2A6ABF7158809CF4F3C";

/// PUSH_DATA header: version 2, token 05DB, gateway AA555A0000000101
#[allow(dead_code)]
pub const PUSH_DATA_HEADER: &str = "0205DB00AA555A0000000101";

/// Captured Unconfirmed-Data-Up from DevAddr 0028B946, FCnt 55, payload "260:100"
#[allow(dead_code)]
pub const CAPTURED_UPLINK: &str = "QEa5KACANwAIXiRAODD6gSCHMSk=";

/// Captured Join-Request from DevEUI BE7A00000000888F, DevNonce 5511
#[allow(dead_code)]
pub const CAPTURED_JOIN: &str = "AEZIZ25pc2lSj4gAAAAAer5VEV5aL4c=";

#[allow(dead_code)]
pub const ABP_DEV_EUI: &str = "0004A30B001C0530";
#[allow(dead_code)]
pub const ABP_DEV_ADDR: &str = "0028B946";
#[allow(dead_code)]
pub const OTAA_DEV_EUI: &str = "BE7A00000000888F";
#[allow(dead_code)]
pub const OTAA_APP_EUI: &str = "526973696E674846";

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

#[allow(dead_code)]
pub fn test_key() -> AesKey {
    TEST_KEY.parse().expect("valid key")
}

/// rxpk entry carrying `phy`, as a concentrator would report it
#[allow(dead_code)]
pub fn rxpk_json(phy: &[u8], tmst: u32) -> String {
    format!(
        r#"{{"tmst":{},"chan":0,"rfch":1,"freq":868.100000,"stat":1,"modu":"LORA","datr":"SF12BW125","codr":"4/5","lsnr":11.0,"rssi":-17,"size":{},"data":"{}"}}"#,
        tmst,
        phy.len(),
        BASE64.encode(phy)
    )
}

/// PUSH_DATA datagram with a single rxpk
#[allow(dead_code)]
pub fn push_data(phy: &[u8]) -> Vec<u8> {
    push_data_with_body(&format!("{{\"rxpk\":[{}]}}", rxpk_json(phy, 286781788)))
}

#[allow(dead_code)]
pub fn push_data_with_body(body: &str) -> Vec<u8> {
    let mut datagram = hex::decode(PUSH_DATA_HEADER).expect("valid header");
    datagram.extend_from_slice(body.as_bytes());
    datagram
}

/// Signed uplink from the ABP test device
#[allow(dead_code)]
pub fn uplink(message_type: MessageType, fcnt: u16, payload: &[u8]) -> Bytes {
    let key = test_key();
    DataFrame::new(message_type, ABP_DEV_ADDR.parse().unwrap(), fcnt)
        .with_payload(8, payload, &key)
        .sign(&key)
        .encode()
}

/// Device provisioned with session keys (ABP)
#[allow(dead_code)]
pub fn abp_record() -> DeviceRecord {
    DeviceRecord {
        dev_eui: ABP_DEV_EUI.parse().unwrap(),
        dev_addr: Some(ABP_DEV_ADDR.parse().unwrap()),
        nwk_s_key: Some(test_key()),
        app_s_key: Some(test_key()),
        ..Default::default()
    }
}

/// Device that may join over the air
#[allow(dead_code)]
pub fn otaa_record() -> DeviceRecord {
    DeviceRecord {
        dev_eui: OTAA_DEV_EUI.parse().unwrap(),
        app_eui: Some(OTAA_APP_EUI.parse().unwrap()),
        app_key: Some(test_key()),
        primary_key: Some("device-primary-key".to_string()),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub struct Harness {
    pub processor: MessageProcessor,
    pub directory: Arc<MemoryDirectory>,
    pub telemetry: Arc<MemoryTelemetry>,
}

#[allow(dead_code)]
pub fn harness(records: impl IntoIterator<Item = DeviceRecord>) -> Harness {
    harness_with_config(records, ProcessorConfig::default())
}

#[allow(dead_code)]
pub fn harness_with_config(records: impl IntoIterator<Item = DeviceRecord>, config: ProcessorConfig) -> Harness {
    let directory = Arc::new(MemoryDirectory::from_records("000001".parse().unwrap(), records));
    let telemetry = Arc::new(MemoryTelemetry::new());
    let processor = MessageProcessor::new(config, directory.clone(), telemetry.clone());
    Harness {
        processor,
        directory,
        telemetry,
    }
}

/// Let fire-and-forget telemetry tasks run
#[allow(dead_code)]
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Unwrap the PHY payload of a PULL_RESP
#[allow(dead_code)]
pub fn pull_resp_payload(response: &[u8]) -> Bytes {
    let frame = semtech::decode(response).expect("valid gateway frame");
    assert_eq!(frame.identifier, Identifier::PullResp);
    let body: PullRespBody = serde_json::from_slice(&frame.body).expect("txpk body");
    body.txpk.payload().expect("base64 payload")
}

/// Directory whose backend is down; counts the calls it receives
#[allow(dead_code)]
#[derive(Default)]
pub struct UnavailableDirectory {
    pub calls: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl DeviceDirectory for UnavailableDirectory {
    async fn get_keys(&self, _dev_addr: &DevAddr) -> Result<Option<DeviceKeys>, LoraError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Err(LoraError::DirectoryUnavailable("connection refused".to_string()))
    }

    async fn perform_otaa(&self, _request: &JoinRequestFrame) -> Result<OtaaOutcome, LoraError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Err(LoraError::DirectoryUnavailable("connection refused".to_string()))
    }
}

/// In-memory directory that counts every call made to it
#[allow(dead_code)]
pub struct CountingDirectory {
    pub inner: MemoryDirectory,
    pub calls: std::sync::atomic::AtomicUsize,
}

#[allow(dead_code)]
impl CountingDirectory {
    pub fn new(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        Self {
            inner: MemoryDirectory::from_records("000001".parse().unwrap(), records),
            calls: Default::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceDirectory for CountingDirectory {
    async fn get_keys(&self, dev_addr: &DevAddr) -> Result<Option<DeviceKeys>, LoraError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.get_keys(dev_addr).await
    }

    async fn perform_otaa(&self, request: &JoinRequestFrame) -> Result<OtaaOutcome, LoraError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.perform_otaa(request).await
    }
}

/// Relay whose downlink poll never completes on its own
#[allow(dead_code)]
#[derive(Default)]
pub struct StalledTelemetry;

#[allow(dead_code)]
pub struct StalledChannel;

impl Telemetry for StalledTelemetry {
    fn open(&self, _dev_eui: &Eui64, _primary_key: Option<&str>) -> TelemetryHandle {
        Arc::new(StalledChannel)
    }
}

#[async_trait]
impl TelemetryChannel for StalledChannel {
    async fn send_uplink(&self, _message: serde_json::Value) -> Result<(), LoraError> {
        Ok(())
    }

    async fn poll_downlink(&self, _timeout: Duration) -> Option<DownlinkMessage> {
        std::future::pending().await
    }

    async fn update_counters(&self, _fcnt_up: u32, _fcnt_down: Option<u32>) -> Result<(), LoraError> {
        Ok(())
    }

    async fn complete_downlink(&self, _message: &DownlinkMessage) -> Result<(), LoraError> {
        Ok(())
    }
}
