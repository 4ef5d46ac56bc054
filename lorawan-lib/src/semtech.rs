//! # Semtech UDP Packet Forwarder Protocol
//!
//! Envelope exchanged between a radio concentrator and the network server:
//!
//! ```text
//! [version:1][token:2][identifier:1][gateway EUI:8]?[JSON body]?
//! ```
//!
//! The identifier decides whether the gateway EUI and the body are present.
//! Gateway-originated PUSH_DATA/PULL_DATA/TX_ACK carry the EUI; PUSH_DATA,
//! TX_ACK and the server's PULL_RESP carry a JSON body; PUSH_ACK and
//! PULL_ACK are token only.
//!
//! The JSON bodies are mapped onto `Rxpk` (uplink radio metadata) and
//! `Txpk` (downlink transmit request). Missing required fields surface as
//! `LoraError::MalformedFrame` at decode time, never later.

use crate::constants::{
    DEFAULT_CODING_RATE, GATEWAY_BODY_OFFSET, GATEWAY_EUI_SIZE, GATEWAY_HEADER_SIZE, PROTOCOL_VERSION,
};
use crate::error::LoraError;
use crate::types::Eui64;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Packet identifier (byte 3 of every frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Identifier {
    #[strum(to_string = "PUSH_DATA")]
    PushData = 0x00,
    #[strum(to_string = "PUSH_ACK")]
    PushAck = 0x01,
    #[strum(to_string = "PULL_DATA")]
    PullData = 0x02,
    #[strum(to_string = "PULL_RESP")]
    PullResp = 0x03,
    #[strum(to_string = "PULL_ACK")]
    PullAck = 0x04,
    #[strum(to_string = "TX_ACK")]
    TxAck = 0x05,
}

impl Identifier {
    /// Frames sent by the gateway carry its EUI after the header
    pub fn has_gateway_eui(&self) -> bool {
        matches!(self, Identifier::PushData | Identifier::PullData | Identifier::TxAck)
    }

    pub fn has_body(&self) -> bool {
        matches!(self, Identifier::PushData | Identifier::PullResp | Identifier::TxAck)
    }

    /// Minimum number of bytes a frame with this identifier occupies
    pub fn min_len(&self) -> usize {
        if self.has_gateway_eui() {
            GATEWAY_BODY_OFFSET
        } else {
            GATEWAY_HEADER_SIZE
        }
    }
}

/// A decoded gateway <-> server UDP frame.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayFrame {
    pub version: u8,
    pub token: [u8; 2],
    pub identifier: Identifier,
    pub gateway_eui: Option<Eui64>,
    pub body: Bytes,
}

impl GatewayFrame {
    /// Token-only acknowledgement (PUSH_ACK / PULL_ACK) echoing the request version and token
    pub fn ack(identifier: Identifier, request: &GatewayFrame) -> Self {
        Self {
            version: request.version,
            token: request.token,
            identifier,
            gateway_eui: None,
            body: Bytes::new(),
        }
    }

    /// PULL_RESP carrying a `txpk` transmit request
    pub fn pull_resp(token: [u8; 2], txpk: Txpk) -> Result<Self, LoraError> {
        let body = serde_json::to_vec(&PullRespBody { txpk })?;
        Ok(Self {
            version: PROTOCOL_VERSION,
            token,
            identifier: Identifier::PullResp,
            gateway_eui: None,
            body: Bytes::from(body),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let eui = if self.identifier.has_gateway_eui() {
            Some(self.gateway_eui.unwrap_or_default())
        } else {
            None
        };
        let body: &[u8] = if self.identifier.has_body() { &self.body } else { &[] };

        let mut buf = BytesMut::with_capacity(GATEWAY_BODY_OFFSET + body.len());
        buf.put_u8(self.version);
        buf.put_slice(&self.token);
        buf.put_u8(self.identifier.into());
        if let Some(eui) = eui {
            buf.put_slice(eui.as_bytes());
        }
        buf.put_slice(body);
        buf.freeze()
    }
}

impl TryFrom<Bytes> for GatewayFrame {
    type Error = LoraError;

    fn try_from(mut bytes: Bytes) -> Result<Self, Self::Error> {
        if bytes.remaining() < GATEWAY_HEADER_SIZE {
            return Err(LoraError::truncated(GATEWAY_HEADER_SIZE, bytes.len()));
        }
        let actual = bytes.len();
        let version = bytes.get_u8();
        let token = [bytes.get_u8(), bytes.get_u8()];
        let identifier_byte = bytes.get_u8();
        let identifier = Identifier::try_from(identifier_byte).map_err(|_| {
            LoraError::MalformedFrame(format!("Unknown identifier 0x{:02x}", identifier_byte))
        })?;

        if actual < identifier.min_len() {
            return Err(LoraError::truncated(identifier.min_len(), actual));
        }

        let gateway_eui = if identifier.has_gateway_eui() {
            let eui: [u8; GATEWAY_EUI_SIZE] = bytes.split_to(GATEWAY_EUI_SIZE).as_ref().try_into()?;
            Some(Eui64::from_bytes(eui))
        } else {
            None
        };

        let body = if identifier.has_body() { bytes } else { Bytes::new() };

        Ok(Self {
            version,
            token,
            identifier,
            gateway_eui,
            body,
        })
    }
}

impl From<GatewayFrame> for Bytes {
    fn from(frame: GatewayFrame) -> Self {
        frame.to_bytes()
    }
}

/// Parse a raw UDP datagram.
pub fn decode(bytes: &[u8]) -> Result<GatewayFrame, LoraError> {
    GatewayFrame::try_from(Bytes::copy_from_slice(bytes))
}

/// Build a server-originated frame (PUSH_ACK, PULL_ACK or PULL_RESP).
pub fn encode(identifier: Identifier, token: [u8; 2], body: &[u8]) -> Bytes {
    GatewayFrame {
        version: PROTOCOL_VERSION,
        token,
        identifier,
        gateway_eui: None,
        body: Bytes::copy_from_slice(body),
    }
    .to_bytes()
}

/// Fresh token for server-initiated downlinks
pub fn random_token() -> [u8; 2] {
    rand::random()
}

fn default_modulation() -> String {
    "LORA".to_string()
}

/// Radio metadata for one received packet (`rxpk` entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rxpk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmms: Option<u64>,
    /// Concentrator timestamp in microseconds
    pub tmst: u32,
    #[serde(default)]
    pub chan: u8,
    #[serde(default)]
    pub rfch: u8,
    /// Frequency in MHz
    pub freq: f64,
    #[serde(default)]
    pub stat: i8,
    #[serde(default = "default_modulation")]
    pub modu: String,
    /// Datarate identifier (e.g., "SF7BW125")
    pub datr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    #[serde(default)]
    pub rssi: i16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsnr: Option<f32>,
    pub size: u16,
    /// Base64 PHY payload
    pub data: String,
}

impl Rxpk {
    /// Base64-decode the PHY payload
    pub fn payload(&self) -> Result<Bytes, LoraError> {
        Ok(Bytes::from(BASE64.decode(self.data.as_bytes())?))
    }
}

/// PUSH_DATA JSON body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushDataBody {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rxpk: Vec<Rxpk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<serde_json::Value>,
}

impl PushDataBody {
    pub fn parse(body: &[u8]) -> Result<Self, LoraError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Only the first rxpk of a datagram is processed
    pub fn first_rxpk(&self) -> Option<&Rxpk> {
        self.rxpk.first()
    }
}

/// Downlink transmit request (`txpk`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Txpk {
    pub imme: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    pub freq: f64,
    pub rfch: u8,
    pub powe: u8,
    pub modu: String,
    pub datr: String,
    pub codr: String,
    pub ipol: bool,
    pub size: u16,
    pub data: String,
}

impl Txpk {
    /// Schedule `phy_payload` in the receive window opened by `rxpk`,
    /// `delay_us` after the uplink, on the same frequency and datarate.
    pub fn reply_to(rxpk: &Rxpk, phy_payload: &[u8], delay_us: u32, power: u8) -> Self {
        Self {
            imme: false,
            tmst: Some(rxpk.tmst.wrapping_add(delay_us)),
            freq: rxpk.freq,
            rfch: 0,
            powe: power,
            modu: rxpk.modu.clone(),
            datr: rxpk.datr.clone(),
            codr: rxpk
                .codr
                .clone()
                .unwrap_or_else(|| DEFAULT_CODING_RATE.to_string()),
            ipol: true,
            size: phy_payload.len() as u16,
            data: BASE64.encode(phy_payload),
        }
    }

    pub fn payload(&self) -> Result<Bytes, LoraError> {
        Ok(Bytes::from(BASE64.decode(self.data.as_bytes())?))
    }
}

/// PULL_RESP JSON body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRespBody {
    pub txpk: Txpk,
}

/// TX_ACK JSON body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxAckBody {
    #[serde(default)]
    pub txpk_ack: TxpkAck,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxpkAck {
    #[serde(default)]
    pub error: Option<String>,
}

impl TxAckBody {
    /// An empty body means the downlink was accepted
    pub fn parse(body: &[u8]) -> Result<Self, LoraError> {
        if body.iter().all(|b| b.is_ascii_whitespace() || *b == 0) {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(body)?)
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self.txpk_ack.error.as_deref(), None | Some("NONE"))
    }
}
