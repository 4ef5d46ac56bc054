// Protocol constants for the Semtech packet forwarder and LoRaWAN MAC layer

/// Semtech UDP protocol version emitted by this server
pub const PROTOCOL_VERSION: u8 = 0x02;

/// Size of the version + token + identifier prefix (4 bytes)
pub const GATEWAY_HEADER_SIZE: usize = 4;

/// Size of the gateway EUI that follows the prefix on gateway-originated frames (8 bytes)
pub const GATEWAY_EUI_SIZE: usize = 8;

/// Offset of the JSON body on frames carrying a gateway EUI
pub const GATEWAY_BODY_OFFSET: usize = GATEWAY_HEADER_SIZE + GATEWAY_EUI_SIZE;

/// AES-128 block size
pub const BLOCK_SIZE: usize = 16;

/// Size of the Message Integrity Code trailing every MAC frame
pub const MIC_SIZE: usize = 4;

/// Join-Request: mhdr(1) + AppEUI(8) + DevEUI(8) + DevNonce(2) + MIC(4)
pub const JOIN_REQUEST_SIZE: usize = 23;

/// Smallest data frame: mhdr(1) + DevAddr(4) + FCtrl(1) + FCnt(2) + MIC(4)
pub const MIN_DATA_FRAME_SIZE: usize = 12;

/// FHDR without FOpts: DevAddr(4) + FCtrl(1) + FCnt(2)
pub const FHDR_SIZE: usize = 7;

/// Join-Accept without CFList: AppNonce(3) + NetID(3) + DevAddr(4) + DLSettings(1) + RxDelay(1)
pub const JOIN_ACCEPT_BODY_SIZE: usize = 12;

/// Optional channel-frequency list appended to a Join-Accept
pub const CF_LIST_SIZE: usize = 16;

/// First byte of the MIC block B0
pub const MIC_BLOCK_TAG: u8 = 0x49;

/// First byte of the keystream block A_i
pub const CIPHER_BLOCK_TAG: u8 = 0x01;

/// Key-derivation selector for the network session key
pub const NWK_S_KEY_SELECTOR: u8 = 0x01;

/// Key-derivation selector for the application session key
pub const APP_S_KEY_SELECTOR: u8 = 0x02;

/// Frame counter placed in the Join-Accept MIC block
pub const JOIN_ACCEPT_FCNT: u16 = 0x0001;

/// FPort used for application downlinks
pub const DOWNLINK_FPORT: u8 = 0x01;

/// Default downlink transmit power in dBm
pub const DEFAULT_TX_POWER: u8 = 14;

/// Default coding rate when the uplink did not report one
pub const DEFAULT_CODING_RATE: &str = "4/5";

/// Receive-window 1 delay for data downlinks (microseconds)
pub const RX1_DELAY_US: u32 = 1_000_000;

/// Join-Accept receive-window 1 delay (microseconds)
pub const JOIN_ACCEPT_DELAY_US: u32 = 5_000_000;
