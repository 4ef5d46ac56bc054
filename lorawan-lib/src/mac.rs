//! # LoRaWAN MAC frame codec
//!
//! Turns a PHY payload into one of four typed frames and back:
//!
//! - **Join-Request** (uplink, fixed 23 bytes, MIC under the AppKey)
//! - **Join-Accept** (downlink, encrypted under the AppKey after its MIC)
//! - **Data uplink / downlink** (FHDR + optional FPort + FRMPayload, MIC
//!   under the NwkSKey, payload under the AppSKey)
//!
//! Classification reads the message type from the top three bits of the
//! MHDR; decoding then either yields a typed frame or fails. There is no
//! retry at this layer.

use crate::constants::{
    CF_LIST_SIZE, FHDR_SIZE, JOIN_ACCEPT_BODY_SIZE, JOIN_ACCEPT_FCNT, JOIN_REQUEST_SIZE, MIC_SIZE,
    MIN_DATA_FRAME_SIZE,
};
use crate::crypto;
use crate::error::LoraError;
use crate::types::{AesKey, AppNonce, DevAddr, DevNonce, Direction, Eui64, Mic, NetId};
use bytes::{BufMut, Bytes, BytesMut};
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};
use std::fmt;
use strum_macros::Display;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Message type carried in MHDR bits 7..5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    JoinRequest = 0,
    JoinAccept = 1,
    UnconfirmedDataUp = 2,
    UnconfirmedDataDown = 3,
    ConfirmedDataUp = 4,
    ConfirmedDataDown = 5,
    RejoinRequest = 6,
    #[num_enum(default)]
    Proprietary = 7,
}

impl MessageType {
    pub fn direction(&self) -> Direction {
        match self {
            MessageType::JoinAccept | MessageType::UnconfirmedDataDown | MessageType::ConfirmedDataDown => {
                Direction::Down
            }
            _ => Direction::Up,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(
            self,
            MessageType::UnconfirmedDataUp
                | MessageType::UnconfirmedDataDown
                | MessageType::ConfirmedDataUp
                | MessageType::ConfirmedDataDown
        )
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, MessageType::ConfirmedDataUp | MessageType::ConfirmedDataDown)
    }
}

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mhdr {
    pub major: B2,
    #[skip]
    unused: B3,
    pub mtype: B3,
}

impl Mhdr {
    pub fn for_type(message_type: MessageType) -> Self {
        Mhdr::new().with_mtype(message_type.into())
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from_primitive(self.mtype())
    }

    pub fn to_byte(&self) -> u8 {
        self.into_bytes()[0]
    }
}

/// Frame-control octet. Bit 4 is FPending on downlinks and ClassB on uplinks.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FCtrl {
    pub fopts_len: B4,
    pub fpending: bool,
    pub ack: bool,
    pub adr_ack_req: bool,
    pub adr: bool,
}

impl FCtrl {
    pub fn to_byte(&self) -> u8 {
        self.into_bytes()[0]
    }
}

/// Message type of a raw MHDR byte
pub fn classify(mhdr: u8) -> MessageType {
    Mhdr::from_bytes([mhdr]).message_type()
}

// --- Join-Request ---

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct JoinRequestRaw {
    mhdr: u8,
    app_eui: [u8; 8], // little-endian on air
    dev_eui: [u8; 8], // little-endian on air
    dev_nonce: [u8; 2],
    mic: [u8; 4],
}

/// A decoded Join-Request. EUIs are held in host order.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequestFrame {
    pub mhdr: Mhdr,
    pub app_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_nonce: DevNonce,
    pub mic: Mic,
    raw: Bytes,
}

impl JoinRequestFrame {
    /// Build a signed Join-Request, as an end-device would
    pub fn new(app_eui: Eui64, dev_eui: Eui64, dev_nonce: DevNonce, app_key: &AesKey) -> Self {
        let mut raw = JoinRequestRaw {
            mhdr: Mhdr::for_type(MessageType::JoinRequest).to_byte(),
            app_eui: app_eui.to_wire(),
            dev_eui: dev_eui.to_wire(),
            dev_nonce: dev_nonce.0,
            mic: [0; 4],
        };
        raw.mic = crypto::compute_mic(app_key, &[], &raw.as_bytes()[..JOIN_REQUEST_SIZE - MIC_SIZE]);

        Self {
            mhdr: Mhdr::from_bytes([raw.mhdr]),
            app_eui,
            dev_eui,
            dev_nonce,
            mic: raw.mic,
            raw: Bytes::copy_from_slice(raw.as_bytes()),
        }
    }

    /// MIC over `mhdr ‖ AppEUI ‖ DevEUI ‖ DevNonce`, with no B0 prefix
    pub fn verify_mic(&self, app_key: &AesKey) -> bool {
        crypto::verify_mic(app_key, &[], &self.raw)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }
}

impl TryFrom<Bytes> for JoinRequestFrame {
    type Error = LoraError;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        if bytes.len() < JOIN_REQUEST_SIZE {
            return Err(LoraError::truncated(JOIN_REQUEST_SIZE, bytes.len()));
        }
        let raw = JoinRequestRaw::ref_from_bytes(bytes.as_ref()).map_err(|_| {
            LoraError::MalformedFrame(format!(
                "Join-Request must be {} bytes, got {}",
                JOIN_REQUEST_SIZE,
                bytes.len()
            ))
        })?;

        let mhdr = Mhdr::from_bytes([raw.mhdr]);
        if mhdr.message_type() != MessageType::JoinRequest {
            return Err(LoraError::MalformedFrame(format!(
                "Expected Join-Request, got {}",
                mhdr.message_type()
            )));
        }

        Ok(Self {
            mhdr,
            app_eui: Eui64::from_wire(raw.app_eui),
            dev_eui: Eui64::from_wire(raw.dev_eui),
            dev_nonce: DevNonce::from_bytes(raw.dev_nonce),
            mic: raw.mic,
            raw: bytes.clone(),
        })
    }
}

pub fn decode_join_request(bytes: &[u8]) -> Result<JoinRequestFrame, LoraError> {
    JoinRequestFrame::try_from(Bytes::copy_from_slice(bytes))
}

// --- Data frames ---

/// A data frame in either direction. `frm_payload` is ciphertext.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub mhdr: Mhdr,
    pub dev_addr: DevAddr,
    pub fctrl: FCtrl,
    pub fcnt: u16,
    pub fopts: Bytes,
    pub fport: Option<u8>,
    pub frm_payload: Bytes,
    pub mic: Mic,
}

impl DataFrame {
    /// Empty, unsigned frame
    pub fn new(message_type: MessageType, dev_addr: DevAddr, fcnt: u16) -> Self {
        Self {
            mhdr: Mhdr::for_type(message_type),
            dev_addr,
            fctrl: FCtrl::new(),
            fcnt,
            fopts: Bytes::new(),
            fport: None,
            frm_payload: Bytes::new(),
            mic: [0; MIC_SIZE],
        }
    }

    pub fn with_ack(mut self, ack: bool) -> Self {
        self.fctrl.set_ack(ack);
        self
    }

    pub fn with_fopts(mut self, fopts: Bytes) -> Result<Self, LoraError> {
        if fopts.len() > 15 {
            return Err(LoraError::MalformedFrame(format!("FOpts too long: {} bytes", fopts.len())));
        }
        self.fctrl.set_fopts_len(fopts.len() as u8);
        self.fopts = fopts;
        Ok(self)
    }

    /// Attach `plaintext` on `fport`, encrypted under the AppSKey
    pub fn with_payload(mut self, fport: u8, plaintext: &[u8], app_s_key: &AesKey) -> Self {
        let ciphertext = crypto::cipher_payload(app_s_key, self.direction(), &self.dev_addr, self.fcnt, plaintext);
        self.fport = Some(fport);
        self.frm_payload = Bytes::from(ciphertext);
        self
    }

    /// Compute and store the MIC; call last
    pub fn sign(mut self, nwk_s_key: &AesKey) -> Self {
        self.mic = self.compute_mic(nwk_s_key);
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.mhdr.message_type()
    }

    pub fn direction(&self) -> Direction {
        self.message_type().direction()
    }

    pub fn is_confirmed(&self) -> bool {
        self.message_type().is_confirmed()
    }

    fn encode_without_mic(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(
            FHDR_SIZE + 1 + self.fopts.len() + 1 + self.frm_payload.len() + MIC_SIZE,
        );
        buf.put_u8(self.mhdr.to_byte());
        buf.put_slice(&self.dev_addr.to_wire());
        buf.put_u8(self.fctrl.to_byte());
        buf.put_u16_le(self.fcnt);
        buf.put_slice(&self.fopts);
        if let Some(fport) = self.fport {
            buf.put_u8(fport);
            buf.put_slice(&self.frm_payload);
        }
        buf
    }

    fn mic_block(&self, len: usize) -> [u8; 16] {
        crypto::mic_block(self.direction(), &self.dev_addr, self.fcnt, len)
    }

    pub fn compute_mic(&self, nwk_s_key: &AesKey) -> Mic {
        let message = self.encode_without_mic();
        crypto::compute_mic(nwk_s_key, &self.mic_block(message.len()), &message)
    }

    pub fn verify_mic(&self, nwk_s_key: &AesKey) -> bool {
        let frame = self.encode();
        crypto::verify_mic(nwk_s_key, &self.mic_block(frame.len() - MIC_SIZE), &frame)
    }

    /// Decrypt FRMPayload with the AppSKey
    pub fn decrypt_payload(&self, app_s_key: &AesKey) -> Vec<u8> {
        crypto::cipher_payload(app_s_key, self.direction(), &self.dev_addr, self.fcnt, &self.frm_payload)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = self.encode_without_mic();
        buf.put_slice(&self.mic);
        buf.freeze()
    }
}

impl TryFrom<Bytes> for DataFrame {
    type Error = LoraError;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        let len = bytes.len();
        if len < MIN_DATA_FRAME_SIZE {
            return Err(LoraError::truncated(MIN_DATA_FRAME_SIZE, len));
        }

        let mhdr = Mhdr::from_bytes([bytes[0]]);
        if !mhdr.message_type().is_data() {
            return Err(LoraError::MalformedFrame(format!(
                "Expected a data frame, got {}",
                mhdr.message_type()
            )));
        }

        let dev_addr = DevAddr::from_wire(bytes[1..5].try_into()?);
        let fctrl = FCtrl::from_bytes([bytes[5]]);
        let fcnt = u16::from_le_bytes([bytes[6], bytes[7]]);

        let fopts_end = FHDR_SIZE + 1 + fctrl.fopts_len() as usize;
        let payload_end = len - MIC_SIZE;
        if fopts_end > payload_end {
            return Err(LoraError::truncated(fopts_end + MIC_SIZE, len));
        }
        let fopts = bytes.slice(FHDR_SIZE + 1..fopts_end);

        let (fport, frm_payload) = if payload_end > fopts_end {
            (Some(bytes[fopts_end]), bytes.slice(fopts_end + 1..payload_end))
        } else {
            (None, Bytes::new())
        };

        let mic: Mic = bytes[payload_end..].try_into()?;

        Ok(Self {
            mhdr,
            dev_addr,
            fctrl,
            fcnt,
            fopts,
            fport,
            frm_payload,
            mic,
        })
    }
}

impl From<DataFrame> for Bytes {
    fn from(frame: DataFrame) -> Self {
        frame.encode()
    }
}

pub fn decode_data_frame(bytes: &[u8]) -> Result<DataFrame, LoraError> {
    DataFrame::try_from(Bytes::copy_from_slice(bytes))
}

/// Serialize a signed data frame
pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
    frame.encode()
}

// --- Join-Accept ---

/// A Join-Accept in cleartext form.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinAcceptFrame {
    pub app_nonce: AppNonce,
    pub net_id: NetId,
    pub dev_addr: DevAddr,
    pub dl_settings: u8,
    pub rx_delay: u8,
    pub cf_list: Option<[u8; CF_LIST_SIZE]>,
    pub mic: Mic,
}

impl JoinAcceptFrame {
    /// Unsigned Join-Accept; call `sign` before use
    pub fn new(app_nonce: AppNonce, net_id: NetId, dev_addr: DevAddr, dl_settings: u8, rx_delay: u8) -> Self {
        Self {
            app_nonce,
            net_id,
            dev_addr,
            dl_settings,
            rx_delay,
            cf_list: None,
            mic: [0; MIC_SIZE],
        }
    }

    pub fn mhdr(&self) -> Mhdr {
        Mhdr::for_type(MessageType::JoinAccept)
    }

    /// `AppNonce ‖ NetID ‖ DevAddr ‖ DLSettings ‖ RxDelay ‖ CFList?`, wire order
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(JOIN_ACCEPT_BODY_SIZE + CF_LIST_SIZE);
        body.extend_from_slice(&self.app_nonce.to_wire());
        body.extend_from_slice(&self.net_id.to_wire());
        body.extend_from_slice(&self.dev_addr.to_wire());
        body.push(self.dl_settings);
        body.push(self.rx_delay);
        if let Some(cf_list) = &self.cf_list {
            body.extend_from_slice(cf_list);
        }
        body
    }

    /// MHDR followed by the body: the bytes the MIC covers
    pub fn cleartext(&self) -> Vec<u8> {
        let mut cleartext = vec![self.mhdr().to_byte()];
        cleartext.extend_from_slice(&self.body());
        cleartext
    }

    pub fn compute_mic(&self, app_key: &AesKey) -> Mic {
        let cleartext = self.cleartext();
        let block0 = crypto::mic_block(Direction::Down, &self.dev_addr, JOIN_ACCEPT_FCNT, cleartext.len());
        crypto::compute_mic(app_key, &block0, &cleartext)
    }

    pub fn verify_mic(&self, app_key: &AesKey) -> bool {
        let mut frame = self.cleartext();
        frame.extend_from_slice(&self.mic);
        let block0 = crypto::mic_block(Direction::Down, &self.dev_addr, JOIN_ACCEPT_FCNT, frame.len() - MIC_SIZE);
        crypto::verify_mic(app_key, &block0, &frame)
    }

    pub fn sign(mut self, app_key: &AesKey) -> Self {
        self.mic = self.compute_mic(app_key);
        self
    }

    /// PHY payload: MHDR then `body ‖ MIC` encrypted under the AppKey.
    /// The MIC is always recomputed over the cleartext before encryption.
    pub fn encode(&self, app_key: &AesKey) -> Result<Bytes, LoraError> {
        let mic = self.compute_mic(app_key);
        let mut plaintext = self.body();
        plaintext.extend_from_slice(&mic);
        let encrypted = crypto::encrypt_join_accept(app_key, &plaintext)?;

        let mut buf = BytesMut::with_capacity(1 + encrypted.len());
        buf.put_u8(self.mhdr().to_byte());
        buf.put_slice(&encrypted);
        Ok(buf.freeze())
    }

    /// Decrypt a received Join-Accept (end-device side). The MIC is not checked.
    pub fn decode(bytes: &[u8], app_key: &AesKey) -> Result<Self, LoraError> {
        let short = 1 + JOIN_ACCEPT_BODY_SIZE + MIC_SIZE;
        let long = short + CF_LIST_SIZE;
        if bytes.len() < short {
            return Err(LoraError::truncated(short, bytes.len()));
        }
        if bytes.len() != short && bytes.len() != long {
            return Err(LoraError::MalformedFrame(format!(
                "Join-Accept must be {} or {} bytes, got {}",
                short,
                long,
                bytes.len()
            )));
        }
        if classify(bytes[0]) != MessageType::JoinAccept {
            return Err(LoraError::MalformedFrame(format!("Expected Join-Accept, got {}", classify(bytes[0]))));
        }

        let plain = crypto::decrypt_join_accept(app_key, &bytes[1..])?;
        let cf_list = if plain.len() == JOIN_ACCEPT_BODY_SIZE + CF_LIST_SIZE + MIC_SIZE {
            Some(plain[JOIN_ACCEPT_BODY_SIZE..JOIN_ACCEPT_BODY_SIZE + CF_LIST_SIZE].try_into()?)
        } else {
            None
        };

        Ok(Self {
            app_nonce: AppNonce::from_wire(plain[0..3].try_into()?),
            net_id: NetId::from_wire(plain[3..6].try_into()?),
            dev_addr: DevAddr::from_wire(plain[6..10].try_into()?),
            dl_settings: plain[10],
            rx_delay: plain[11],
            cf_list,
            mic: plain[plain.len() - MIC_SIZE..].try_into()?,
        })
    }
}

/// Assemble a signed Join-Accept. `encode` then encrypts it.
pub fn build_join_accept(
    net_id: &NetId,
    app_key: &AesKey,
    dev_addr: &DevAddr,
    app_nonce: &AppNonce,
    dl_settings: u8,
    rx_delay: u8,
) -> JoinAcceptFrame {
    JoinAcceptFrame::new(*app_nonce, *net_id, *dev_addr, dl_settings, rx_delay).sign(app_key)
}

// --- Tagged union ---

/// Any decoded MAC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum MacPayload {
    JoinRequest(JoinRequestFrame),
    JoinAccept(JoinAcceptFrame),
    DataUplink(DataFrame),
    DataDownlink(DataFrame),
}

impl MacPayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            MacPayload::JoinRequest(_) => MessageType::JoinRequest,
            MacPayload::JoinAccept(_) => MessageType::JoinAccept,
            MacPayload::DataUplink(frame) | MacPayload::DataDownlink(frame) => frame.message_type(),
        }
    }
}

impl TryFrom<Bytes> for MacPayload {
    type Error = LoraError;

    /// Join-Accepts cannot be decoded without the AppKey; use `JoinAcceptFrame::decode`.
    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        let first = *bytes.first().ok_or_else(|| LoraError::truncated(1, 0))?;
        let message_type = classify(first);

        match message_type {
            MessageType::JoinRequest => Ok(MacPayload::JoinRequest(JoinRequestFrame::try_from(bytes)?)),
            MessageType::UnconfirmedDataUp | MessageType::ConfirmedDataUp => {
                Ok(MacPayload::DataUplink(DataFrame::try_from(bytes)?))
            }
            MessageType::UnconfirmedDataDown | MessageType::ConfirmedDataDown => {
                Ok(MacPayload::DataDownlink(DataFrame::try_from(bytes)?))
            }
            other => Err(LoraError::MalformedFrame(format!("Unsupported message type {}", other))),
        }
    }
}

impl fmt::Display for MacPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacPayload::JoinRequest(frame) => write!(
                f,
                "JoinRequest app_eui={} dev_eui={} dev_nonce={}",
                frame.app_eui, frame.dev_eui, frame.dev_nonce
            ),
            MacPayload::JoinAccept(frame) => {
                write!(f, "JoinAccept dev_addr={} net_id={}", frame.dev_addr, frame.net_id)
            }
            MacPayload::DataUplink(frame) | MacPayload::DataDownlink(frame) => write!(
                f,
                "{} dev_addr={} fcnt={} fport={:?} payload={}B",
                frame.message_type(),
                frame.dev_addr,
                frame.fcnt,
                frame.fport,
                frame.frm_payload.len()
            ),
        }
    }
}
