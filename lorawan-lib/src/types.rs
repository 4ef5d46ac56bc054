//! Fixed-size identifiers and keys used across the protocol core.
//!
//! Multi-byte LoRaWAN identifiers travel little-endian over the air but are
//! written, logged and looked up most-significant byte first. The newtypes
//! below always hold that host order; `to_wire`/`from_wire` convert at the
//! codec boundary. `DevNonce` is the exception: it is an opaque value that is
//! compared and fed to key derivation exactly as received.

use crate::error::LoraError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

macro_rules! hex_newtype {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const SIZE: usize = $len;

            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode_upper(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = LoraError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s.trim())?;
                let array: [u8; $len] = bytes.as_slice().try_into().map_err(|_| {
                    LoraError::InvalidHex(format!(
                        "{} needs {} bytes, got {}",
                        stringify!($name),
                        $len,
                        bytes.len()
                    ))
                })?;
                Ok(Self(array))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

macro_rules! wire_order {
    ($name:ident, $len:expr) => {
        impl $name {
            /// Byte order as transmitted over the air (little-endian)
            pub fn to_wire(&self) -> [u8; $len] {
                let mut bytes = self.0;
                bytes.reverse();
                bytes
            }

            /// Build from over-the-air (little-endian) bytes
            pub fn from_wire(mut wire: [u8; $len]) -> Self {
                wire.reverse();
                Self(wire)
            }
        }
    };
}

hex_newtype!(
    /// AES-128 key (AppKey, NwkSKey or AppSKey)
    AesKey,
    16
);
hex_newtype!(
    /// 64-bit extended unique identifier (DevEUI, AppEUI/JoinEUI, gateway EUI)
    Eui64,
    8
);
hex_newtype!(
    /// 32-bit device address assigned at join
    DevAddr,
    4
);
hex_newtype!(
    /// Join-Request nonce, kept in wire order
    DevNonce,
    2
);
hex_newtype!(
    /// 24-bit network identifier
    NetId,
    3
);
hex_newtype!(
    /// 24-bit server nonce carried in the Join-Accept
    AppNonce,
    3
);

wire_order!(Eui64, 8);
wire_order!(DevAddr, 4);
wire_order!(NetId, 3);
wire_order!(AppNonce, 3);

/// 4-byte Message Integrity Code
pub type Mic = [u8; 4];

/// Frame direction as encoded in MIC and keystream blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    Up = 0,
    Down = 1,
}

impl Direction {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_is_msb_first() {
        let addr: DevAddr = "0028B946".parse().unwrap();
        assert_eq!(addr.0, [0x00, 0x28, 0xB9, 0x46]);
        assert_eq!(addr.to_wire(), [0x46, 0xB9, 0x28, 0x00]);
        assert_eq!(DevAddr::from_wire(addr.to_wire()), addr);
        assert_eq!(addr.to_string(), "0028B946");
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        let err = "0102".parse::<Eui64>().unwrap_err();
        assert!(matches!(err, LoraError::InvalidHex(_)));
        assert!("zz".parse::<DevNonce>().is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let key: AesKey = "2B7E151628AED2A6ABF7158809CF4F3C".parse().unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"2B7E151628AED2A6ABF7158809CF4F3C\"");
        let back: AesKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
