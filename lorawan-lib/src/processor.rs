//! # Protocol orchestrator
//!
//! `MessageProcessor::handle_datagram` takes one UDP payload from a gateway
//! and returns the payload to send back (empty for "no response"):
//!
//! - PULL_DATA: PULL_ACK with the same token
//! - PUSH_DATA with a Join-Request: OTAA through the device directory, then
//!   a Join-Accept inside a PULL_RESP
//! - PUSH_DATA with a Data-Up: MIC check, frame-counter check, payload
//!   decryption and forwarding to telemetry, then either a PUSH_ACK or a
//!   Data-Down inside a PULL_RESP
//! - PUSH_DATA with only gateway status: PUSH_ACK
//! - TX_ACK: logged, no response
//!
//! Failures are scoped to the datagram or to the device; none is fatal. The
//! only suspension on the response path besides the directory is the bounded
//! downlink poll.

use crate::constants::{DEFAULT_TX_POWER, DOWNLINK_FPORT, JOIN_ACCEPT_DELAY_US, RX1_DELAY_US};
use crate::directory::{DeviceDirectory, OtaaOutcome};
use crate::error::LoraError;
use crate::mac::{DataFrame, JoinRequestFrame, MacPayload, MessageType, build_join_accept, encode_data_frame};
use crate::semtech::{self, GatewayFrame, Identifier, PushDataBody, Rxpk, TxAckBody, Txpk};
use crate::session::{DeviceSession, SessionGuard, SessionKey, SessionStore};
use crate::telemetry::{DownlinkMessage, Telemetry, TelemetryHandle};
use crate::types::{AesKey, DevAddr, Eui64};
use bytes::Bytes;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Upper bound for each downlink poll
    pub poll_timeout: Duration,
    /// Data downlink offset from the uplink timestamp (RX1)
    pub rx1_delay_us: u32,
    /// Join-Accept offset from the Join-Request timestamp
    pub join_accept_delay_us: u32,
    pub tx_power: u8,
    pub dl_settings: u8,
    pub rx_delay: u8,
    /// Answer a Confirmed-Data-Up with a Data-Down even when its counter is stale
    pub ack_stale_confirmed: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(10),
            rx1_delay_us: RX1_DELAY_US,
            join_accept_delay_us: JOIN_ACCEPT_DELAY_US,
            tx_power: DEFAULT_TX_POWER,
            dl_settings: 0,
            rx_delay: 1,
            ack_stale_confirmed: true,
        }
    }
}

pub struct MessageProcessor {
    config: ProcessorConfig,
    store: Arc<SessionStore>,
    directory: Arc<dyn DeviceDirectory>,
    telemetry: Arc<dyn Telemetry>,
}

impl MessageProcessor {
    pub fn new(config: ProcessorConfig, directory: Arc<dyn DeviceDirectory>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            config,
            store: Arc::new(SessionStore::new()),
            directory,
            telemetry,
        }
    }

    /// Share an existing session store
    pub fn with_store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Process one datagram. An empty result means nothing is sent back.
    pub async fn handle_datagram(&self, datagram: &[u8]) -> Bytes {
        let started = Instant::now();
        trace!("Datagram: {}", hex::encode(datagram));

        let response = match self.process(datagram).await {
            Ok(Some(response)) => response,
            Ok(None) => Bytes::new(),
            Err(e) => {
                warn!("Dropping datagram: {}", e);
                Bytes::new()
            }
        };

        debug!(elapsed = ?started.elapsed(), response_len = response.len(), "Datagram processed");
        response
    }

    async fn process(&self, datagram: &[u8]) -> Result<Option<Bytes>, LoraError> {
        let frame = semtech::decode(datagram)?;
        debug!(
            identifier = %frame.identifier,
            token = %hex::encode(frame.token),
            gateway = ?frame.gateway_eui,
            "Gateway frame"
        );

        match frame.identifier {
            Identifier::PullData => Ok(Some(GatewayFrame::ack(Identifier::PullAck, &frame).to_bytes())),
            Identifier::PushData => self.process_push_data(&frame).await,
            Identifier::TxAck => {
                let ack = TxAckBody::parse(&frame.body)?;
                match ack.txpk_ack.error.as_deref() {
                    _ if ack.is_accepted() => debug!(gateway = ?frame.gateway_eui, "Downlink accepted by gateway"),
                    Some(error) => warn!(gateway = ?frame.gateway_eui, "Downlink rejected by gateway: {}", error),
                    None => {}
                }
                Ok(None)
            }
            other => {
                debug!("Ignoring {} sent to the server", other);
                Ok(None)
            }
        }
    }

    async fn process_push_data(&self, frame: &GatewayFrame) -> Result<Option<Bytes>, LoraError> {
        let body = PushDataBody::parse(&frame.body)?;

        let Some(rxpk) = body.first_rxpk() else {
            if let Some(stat) = &body.stat {
                info!(gateway = ?frame.gateway_eui, "Gateway status: {}", stat);
            }
            return Ok(Some(GatewayFrame::ack(Identifier::PushAck, frame).to_bytes()));
        };
        if body.rxpk.len() > 1 {
            debug!("{} rxpk entries in datagram, only the first is processed", body.rxpk.len());
        }

        match MacPayload::try_from(rxpk.payload()?)? {
            MacPayload::JoinRequest(request) => self.process_join_request(rxpk, request).await,
            MacPayload::DataUplink(data) => self.process_data_uplink(frame, rxpk, data).await,
            other => {
                debug!("Ignoring uplink {}", other);
                Ok(None)
            }
        }
    }

    async fn process_join_request(&self, rxpk: &Rxpk, request: JoinRequestFrame) -> Result<Option<Bytes>, LoraError> {
        info!(
            dev_eui = %request.dev_eui,
            app_eui = %request.app_eui,
            dev_nonce = %request.dev_nonce,
            "Join-Request received"
        );

        // Held until the session is stored: one join per DevEUI at a time
        let mut guard = self.store.lock(SessionKey::DevEui(request.dev_eui)).await;

        if let Some(session) = guard.as_ref() {
            if !session.is_known_device {
                info!(dev_eui = %request.dev_eui, "Join-Request refused, device is not ours");
                return Ok(None);
            }
            if !session.is_join_valid && session.dev_nonce == Some(request.dev_nonce) {
                return Err(LoraError::ReplayedNonce);
            }
        }

        // The directory checks the MIC before it commits anything
        let otaa = match self.directory.perform_otaa(&request).await? {
            OtaaOutcome::Accepted(otaa) => otaa,
            OtaaOutcome::Rejected { is_our_device } => {
                info!(dev_eui = %request.dev_eui, is_our_device, "Join refused by directory");
                self.detach_session(&mut guard).await;
                *guard = Some(DeviceSession::rejected_join(&request, is_our_device));
                return Ok(None);
            }
            OtaaOutcome::InvalidMic => {
                self.detach_session(&mut guard).await;
                *guard = Some(DeviceSession::rejected_join(&request, true));
                return Err(LoraError::MicMismatch);
            }
        };

        let accept = build_join_accept(
            &otaa.net_id,
            &otaa.app_key,
            &otaa.dev_addr,
            &otaa.app_nonce,
            self.config.dl_settings,
            self.config.rx_delay,
        );
        let phy = accept.encode(&otaa.app_key)?;
        let txpk = Txpk::reply_to(rxpk, &phy, self.config.join_accept_delay_us, self.config.tx_power);
        let response = GatewayFrame::pull_resp(semtech::random_token(), txpk)?.to_bytes();

        let previous = guard.take();
        if let Some(old_addr) = previous.as_ref().and_then(|s| s.dev_addr) {
            if old_addr != otaa.dev_addr {
                self.store.unalias(old_addr, &guard);
            }
        }

        let dev_addr = otaa.dev_addr;
        let mut session = DeviceSession::joined(&request, otaa);
        session.telemetry = previous.and_then(|s| s.telemetry);
        *guard = Some(session);
        self.store.alias(dev_addr, &guard);

        info!(dev_eui = %request.dev_eui, %dev_addr, "Join-Accept sent");
        Ok(Some(response))
    }

    /// Move an earlier joined session out of the DevEUI slot into a slot of
    /// its own, so its DevAddr keeps working while the DevEUI slot records a
    /// refused join.
    async fn detach_session(&self, guard: &mut SessionGuard) {
        let Some(previous) = guard.take() else {
            return;
        };
        if let Some(dev_addr) = previous.dev_addr {
            self.store.unalias(dev_addr, guard);
            self.store.put(dev_addr, previous).await;
        }
    }

    async fn process_data_uplink(
        &self,
        frame: &GatewayFrame,
        rxpk: &Rxpk,
        data: DataFrame,
    ) -> Result<Option<Bytes>, LoraError> {
        let dev_addr = data.dev_addr;
        debug!(%dev_addr, fcnt = data.fcnt, fport = ?data.fport, "{} received", data.message_type());

        let mut guard = self.store.lock(SessionKey::DevAddr(dev_addr)).await;
        if guard.is_none() {
            debug!(%dev_addr, "Session not cached, asking directory");
            // An unavailable directory propagates here and nothing is cached
            *guard = Some(match self.directory.get_keys(&dev_addr).await? {
                Some(keys) => DeviceSession::from_keys(dev_addr, keys),
                None => DeviceSession::unknown(dev_addr),
            });
        }
        let Some(session) = guard.as_mut() else {
            return Ok(None);
        };

        if !session.is_known_device {
            debug!(%dev_addr, "Ignoring frame from unknown or untrusted device");
            return Ok(None);
        }
        let Some(nwk_s_key) = session.nwk_s_key else {
            warn!(%dev_addr, "No NwkSKey on record");
            return Ok(None);
        };

        if !data.verify_mic(&nwk_s_key) {
            warn!(%dev_addr, "MIC check failed, ignoring device from now on");
            session.mark_untrusted();
            return Err(LoraError::MicMismatch);
        }

        let dev_eui = session.dev_eui.unwrap_or_default();
        let channel = match &session.telemetry {
            Some(handle) => Arc::clone(handle),
            None => {
                let handle = self.telemetry.open(&dev_eui, session.primary_key.as_deref());
                session.telemetry = Some(Arc::clone(&handle));
                handle
            }
        };

        let poll_timeout = self.config.poll_timeout;
        let (first_poll, counter_check) = tokio::join!(poll_downlink(&channel, poll_timeout), async {
            session.check_fcnt(data.fcnt)
        });

        let fcnt_valid = match counter_check {
            Ok(()) => {
                debug!(%dev_addr, fcnt = data.fcnt, server = session.fcnt_up, "Valid frame counter");
                session.fcnt_up = u32::from(data.fcnt);
                let payload = match application_payload(&data, session.app_s_key.as_ref()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(%dev_addr, "{}", e);
                        None
                    }
                };
                let document = uplink_document(rxpk, &dev_eui, &data, payload);
                let uplink_channel = Arc::clone(&channel);
                tokio::spawn(async move {
                    if let Err(e) = uplink_channel.send_uplink(document).await {
                        warn!("Failed to forward uplink: {}", e);
                    }
                });
                true
            }
            Err(e) => {
                warn!(%dev_addr, "{}, skipping application payload", e);
                false
            }
        };

        let downlink = match first_poll {
            Some(message) => Some(message),
            None => poll_downlink(&channel, poll_timeout).await,
        };
        if let Some(message) = &downlink {
            debug!(%dev_addr, id = %message.id, "Pending downlink: {}", String::from_utf8_lossy(&message.payload));
        }

        let confirmed = data.is_confirmed();
        let ack_only = downlink.is_none() && (!confirmed || (!fcnt_valid && !self.config.ack_stale_confirmed));
        if ack_only {
            spawn_counter_update(&channel, session.fcnt_up, None);
            return Ok(Some(GatewayFrame::ack(Identifier::PushAck, frame).to_bytes()));
        }

        session.fcnt_down += 1;
        debug!(%dev_addr, fcnt_down = session.fcnt_down, "Down frame counter");
        spawn_counter_update(&channel, session.fcnt_up, Some(session.fcnt_down));

        let phy = build_downlink(
            dev_addr,
            session.fcnt_down,
            confirmed,
            downlink.as_ref(),
            &nwk_s_key,
            session.app_s_key.as_ref(),
        );
        let txpk = Txpk::reply_to(rxpk, &phy, self.config.rx1_delay_us, self.config.tx_power);
        let response = GatewayFrame::pull_resp(semtech::random_token(), txpk)?.to_bytes();

        if let Some(message) = downlink {
            let complete_channel = Arc::clone(&channel);
            tokio::spawn(async move {
                if let Err(e) = complete_channel.complete_downlink(&message).await {
                    warn!("Failed to complete downlink {}: {}", message.id, e);
                }
            });
        }

        info!(%dev_addr, fcnt_down = session.fcnt_down, "Downlink sent");
        Ok(Some(response))
    }
}

/// Race the collaborator's poll against our own timer
async fn poll_downlink(channel: &TelemetryHandle, timeout: Duration) -> Option<DownlinkMessage> {
    tokio::time::timeout(timeout, channel.poll_downlink(timeout))
        .await
        .ok()
        .flatten()
}

fn spawn_counter_update(channel: &TelemetryHandle, fcnt_up: u32, fcnt_down: Option<u32>) {
    let channel = Arc::clone(channel);
    tokio::spawn(async move {
        if let Err(e) = channel.update_counters(fcnt_up, fcnt_down).await {
            warn!("Failed to persist frame counters: {}", e);
        }
    });
}

/// Confirmed-Data-Down answering an uplink, optionally carrying `downlink`
fn build_downlink(
    dev_addr: DevAddr,
    fcnt_down: u32,
    ack: bool,
    downlink: Option<&DownlinkMessage>,
    nwk_s_key: &AesKey,
    app_s_key: Option<&AesKey>,
) -> Bytes {
    // Low 16 bits go on air
    let mut frame = DataFrame::new(MessageType::ConfirmedDataDown, dev_addr, fcnt_down as u16).with_ack(ack);
    match (downlink, app_s_key) {
        (Some(message), Some(app_s_key)) if !message.payload.is_empty() => {
            frame = frame.with_payload(DOWNLINK_FPORT, &message.payload, app_s_key);
        }
        (Some(_), None) => warn!(%dev_addr, "No AppSKey on record, downlink sent without payload"),
        _ => {}
    }
    encode_data_frame(&frame.sign(nwk_s_key))
}

/// Decrypt FRMPayload. Plaintext that parses as JSON is forwarded as is,
/// anything else as `{"value": "<text>"}`.
fn application_payload(data: &DataFrame, app_s_key: Option<&AesKey>) -> Result<Option<Value>, LoraError> {
    if data.frm_payload.is_empty() {
        return Ok(None);
    }
    if data.fport == Some(0) {
        return Err(LoraError::DecryptionFailure(
            "FPort 0 carries MAC commands, not application data".to_string(),
        ));
    }
    let app_s_key = app_s_key.ok_or_else(|| LoraError::DecryptionFailure("No AppSKey on record".to_string()))?;

    let plaintext = data.decrypt_payload(app_s_key);
    let text = String::from_utf8(plaintext)
        .map_err(|e| LoraError::DecryptionFailure(format!("Payload is not UTF-8: {}", e)))?;
    debug!(dev_addr = %data.dev_addr, "Decrypted payload: {}", text);

    Ok(Some(
        serde_json::from_str(&text).unwrap_or_else(|_| json!({ "value": text })),
    ))
}

/// Radio metadata of the uplink plus the decoded payload and device identity
fn uplink_document(rxpk: &Rxpk, dev_eui: &Eui64, data: &DataFrame, payload: Option<Value>) -> Value {
    let mut document = serde_json::to_value(rxpk).unwrap_or_else(|_| json!({}));
    if let Value::Object(fields) = &mut document {
        fields.insert("data".to_string(), payload.unwrap_or(Value::Null));
        fields.insert("EUI".to_string(), json!(dev_eui.to_string()));
        fields.insert("edgets".to_string(), json!(Utc::now().timestamp()));
        fields.insert("fport".to_string(), json!(data.fport));
        fields.insert("fcnt".to_string(), json!(data.fcnt));
    }
    document
}
