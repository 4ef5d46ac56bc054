//! Cryptographic engine for LoRaWAN frames
//!
//! Pure functions over key material; nothing here holds state.
//!
//! # Primitives
//!
//! - MIC: AES-128-CMAC over `B0 ‖ message`, truncated to 4 bytes. Data frames
//!   and Join-Accepts prepend the 16-byte block `B0`; Join-Requests are
//!   authenticated over their raw header fields with no block prefix.
//! - Data-frame payload cipher: AES-128 as a keystream generator over the
//!   counter blocks `A_i`. Applying it twice restores the input.
//! - Join-Accept cipher: whole 16-byte blocks run directly through AES under
//!   the AppKey. The network side uses the decrypt primitive so an end-device
//!   only needs encrypt to recover the frame.
//! - Session keys: one AES block of `selector ‖ AppNonce ‖ NetID ‖ DevNonce ‖ pad`.
//!
//! # Block layout (`B0` and `A_i`)
//!
//! ```text
//! [tag][0x00 x4][dir][DevAddr LE x4][FCnt LE x2][0x00 x3][len | i]
//! ```

use crate::constants::{
    APP_S_KEY_SELECTOR, BLOCK_SIZE, CIPHER_BLOCK_TAG, MIC_BLOCK_TAG, MIC_SIZE, NWK_S_KEY_SELECTOR,
};
use crate::error::LoraError;
use crate::types::{AesKey, AppNonce, DevAddr, DevNonce, Direction, Mic, NetId};
use aes::{Aes128, Block};
use aes::cipher::{BlockDecrypt, BlockEncrypt, Key, KeyInit};
use cmac::{Cmac, Mac};

fn aes_key(key: &AesKey) -> &Key<Aes128> {
    Key::<Aes128>::from_slice(key.as_bytes())
}

fn counter_block(tag: u8, direction: Direction, dev_addr: &DevAddr, fcnt: u16, last: u8) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = tag;
    block[5] = direction.as_byte();
    block[6..10].copy_from_slice(&dev_addr.to_wire());
    block[10..12].copy_from_slice(&fcnt.to_le_bytes());
    block[15] = last;
    block
}

/// Build the MIC prefix block `B0`
///
/// # Arguments
/// * `direction` - Frame direction
/// * `dev_addr` - Device address (host order, written little-endian)
/// * `fcnt` - 16-bit frame counter
/// * `len` - Length of the authenticated message
pub fn mic_block(direction: Direction, dev_addr: &DevAddr, fcnt: u16, len: usize) -> [u8; BLOCK_SIZE] {
    counter_block(MIC_BLOCK_TAG, direction, dev_addr, fcnt, len as u8)
}

/// Build the keystream counter block `A_i` (indices start at 1)
pub fn cipher_block(direction: Direction, dev_addr: &DevAddr, fcnt: u16, index: u8) -> [u8; BLOCK_SIZE] {
    counter_block(CIPHER_BLOCK_TAG, direction, dev_addr, fcnt, index)
}

/// Compute a 4-byte MIC
///
/// # Arguments
/// * `key` - NwkSKey for data frames, AppKey for join frames
/// * `block0` - `B0` prefix, or an empty slice for Join-Requests
/// * `message` - Authenticated bytes (frame without its MIC)
///
/// # Returns
/// First 4 bytes of `AES-CMAC(key, block0 ‖ message)`
pub fn compute_mic(key: &AesKey, block0: &[u8], message: &[u8]) -> Mic {
    let mut mac = <Cmac<Aes128> as Mac>::new(aes_key(key));
    mac.update(block0);
    mac.update(message);
    let tag = mac.finalize().into_bytes();

    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&tag[..MIC_SIZE]);
    mic
}

/// Check the trailing 4-byte MIC of `frame` in constant time
///
/// Returns `false` for frames too short to carry a MIC.
pub fn verify_mic(key: &AesKey, block0: &[u8], frame: &[u8]) -> bool {
    if frame.len() < MIC_SIZE {
        return false;
    }
    let (message, mic) = frame.split_at(frame.len() - MIC_SIZE);

    let mut mac = <Cmac<Aes128> as Mac>::new(aes_key(key));
    mac.update(block0);
    mac.update(message);
    mac.verify_truncated_left(mic).is_ok()
}

/// Encrypt or decrypt a FRMPayload
///
/// Each 16-byte chunk of `data` is XORed with `AES(key, A_i)`; the final
/// partial chunk only consumes as many keystream bytes as it has.
pub fn cipher_payload(key: &AesKey, direction: Direction, dev_addr: &DevAddr, fcnt: u16, data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(aes_key(key));
    let mut output = data.to_vec();

    for (i, chunk) in output.chunks_mut(BLOCK_SIZE).enumerate() {
        let mut keystream = cipher_block(direction, dev_addr, fcnt, (i + 1) as u8);
        cipher.encrypt_block(Block::from_mut_slice(&mut keystream));
        for (byte, key_byte) in chunk.iter_mut().zip(keystream.iter()) {
            *byte ^= key_byte;
        }
    }

    output
}

fn check_block_aligned(data: &[u8]) -> Result<(), LoraError> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(LoraError::MalformedFrame(format!(
            "Join-Accept body must be a non-empty multiple of {} bytes, got {}",
            BLOCK_SIZE,
            data.len()
        )));
    }
    Ok(())
}

/// Encrypt a Join-Accept `body ‖ MIC` under the AppKey (network side)
pub fn encrypt_join_accept(app_key: &AesKey, data: &[u8]) -> Result<Vec<u8>, LoraError> {
    check_block_aligned(data)?;

    let cipher = Aes128::new(aes_key(app_key));
    let mut output = data.to_vec();
    for chunk in output.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(chunk.into());
    }
    Ok(output)
}

/// Recover a Join-Accept `body ‖ MIC` as an end-device does
pub fn decrypt_join_accept(app_key: &AesKey, data: &[u8]) -> Result<Vec<u8>, LoraError> {
    check_block_aligned(data)?;

    let cipher = Aes128::new(aes_key(app_key));
    let mut output = data.to_vec();
    for chunk in output.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(chunk.into());
    }
    Ok(output)
}

/// Derive one OTAA session key
///
/// # Arguments
/// * `selector` - `0x01` for NwkSKey, `0x02` for AppSKey
/// * `app_nonce`, `net_id` - Written in wire order, as in the Join-Accept
/// * `dev_nonce` - As received in the Join-Request
/// * `app_key` - Long-term device key
pub fn derive_session_key(
    selector: u8,
    app_nonce: &AppNonce,
    net_id: &NetId,
    dev_nonce: &DevNonce,
    app_key: &AesKey,
) -> AesKey {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = selector;
    block[1..4].copy_from_slice(&app_nonce.to_wire());
    block[4..7].copy_from_slice(&net_id.to_wire());
    block[7..9].copy_from_slice(dev_nonce.as_bytes());

    let cipher = Aes128::new(aes_key(app_key));
    cipher.encrypt_block(Block::from_mut_slice(&mut block));
    AesKey::from_bytes(block)
}

/// Derive `(NwkSKey, AppSKey)` for a join
pub fn derive_session_keys(
    app_nonce: &AppNonce,
    net_id: &NetId,
    dev_nonce: &DevNonce,
    app_key: &AesKey,
) -> (AesKey, AesKey) {
    (
        derive_session_key(NWK_S_KEY_SELECTOR, app_nonce, net_id, dev_nonce, app_key),
        derive_session_key(APP_S_KEY_SELECTOR, app_nonce, net_id, dev_nonce, app_key),
    )
}
