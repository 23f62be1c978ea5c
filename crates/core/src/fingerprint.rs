//! Composite device fingerprint
//!
//! A device hash is SHA-256 over the highest-entropy signals the capture
//! script collects, in a fixed order. The inputs are joined with the ASCII
//! unit separator, which [`crate::extract::sanitize_text`] removes from every
//! text field, so distinct input tuples can never serialize to the same
//! byte string.

use sha2::{Digest, Sha256};

use crate::extract::{
    ExtractedPayload, AUDIO_HASH, CANVAS_HASH, FONT_LIST, WEBGL_RENDERER, WEBGL_SIGNATURE,
};

/// Fingerprint inputs in hashing order. Changing this list changes every hash.
pub const FINGERPRINT_INPUTS: [&str; 5] = [
    CANVAS_HASH,
    FONT_LIST,
    WEBGL_RENDERER,
    WEBGL_SIGNATURE,
    AUDIO_HASH,
];

const DELIMITER: char = '\u{1f}';

/// Compute the device hash for an extracted payload
///
/// Returns `None` when every input is blank: hits without a client script
/// must not share one spurious device.
pub fn device_hash(payload: &ExtractedPayload) -> Option<String> {
    let inputs = FINGERPRINT_INPUTS.map(|key| payload.text(key).map(str::trim).unwrap_or(""));
    hash_inputs(&inputs)
}

/// Hash an ordered tuple of fingerprint inputs
pub fn hash_inputs(inputs: &[&str]) -> Option<String> {
    if inputs.iter().all(|input| input.is_empty()) {
        return None;
    }

    let mut hasher = Sha256::new();
    for (i, input) in inputs.iter().enumerate() {
        if i > 0 {
            let mut buf = [0u8; 4];
            hasher.update(DELIMITER.encode_utf8(&mut buf).as_bytes());
        }
        hasher.update(input.as_bytes());
    }
    Some(hex::encode(hasher.finalize()))
}
