//! Client-to-server masking.

use crate::frame::MASKING_KEY_LEN;

/// XOR `data` in place with the repeating 4-byte masking key.
///
/// Masking is an involution: applying it twice restores the input.
pub fn apply_mask(data: &mut [u8], key: [u8; MASKING_KEY_LEN]) {
    for (octet, byte) in data.iter_mut().enumerate() {
        *byte ^= key[octet % MASKING_KEY_LEN];
    }
}

/// A fresh masking key for one outgoing frame.
pub fn random_masking_key() -> [u8; MASKING_KEY_LEN] {
    rand::random()
}
