// ── PSK material helpers ──
//
// Appliance credentials come out of the vendor profile as urlsafe base64
// without padding. Everything the record layer needs -- AES key, MAC key,
// IV -- is derived from them here, once per session.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

/// Derived key material for one appliance in AES mode.
///
/// Deterministic from the PSK, so reconnecting derives the same keys;
/// the rolling MAC chains in [`crate::framing`] still restart from zero
/// on every new session.
#[derive(Clone)]
pub struct KeyMaterial {
    pub enc_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub iv: [u8; 16],
}

/// Decode urlsafe base64, tolerating the missing padding the profile
/// format uses (any trailing `=` is accepted too).
pub fn decode_b64(value: &str) -> Result<Vec<u8>, Error> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| Error::KeyMaterial(format!("base64: {e}")))
}

/// Encode bytes as urlsafe base64 without padding (nonce emission).
pub fn encode_b64(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Derive the AES and MAC keys plus the static IV from the
/// base64-encoded PSK and IV strings.
///
/// `enc_key = HMAC-SHA256(psk, "ENC")`, `mac_key = HMAC-SHA256(psk, "MAC")`.
pub fn derive_key_material(psk64: &str, iv64: &str) -> Result<KeyMaterial, Error> {
    let psk = decode_b64(psk64)?;
    let iv_bytes = decode_b64(iv64)?;
    let iv: [u8; 16] = iv_bytes
        .try_into()
        .map_err(|_| Error::KeyMaterial("IV must decode to 16 bytes".into()))?;

    Ok(KeyMaterial {
        enc_key: hmac_sha256(&psk, b"ENC"),
        mac_key: hmac_sha256(&psk, b"MAC"),
        iv,
    })
}

pub(crate) fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_without_padding() {
        // "hello" -> aGVsbG8 (unpadded form, would be aGVsbG8= padded)
        assert_eq!(decode_b64("aGVsbG8").unwrap(), b"hello");
        assert_eq!(decode_b64("aGVsbG8=").unwrap(), b"hello");
    }

    #[test]
    fn decode_urlsafe_alphabet() {
        // 0xfb 0xff uses '-' and '_' in the urlsafe alphabet
        assert_eq!(decode_b64("-_8").unwrap(), vec![0xfb, 0xff]);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_b64("not base64!").is_err());
    }

    #[test]
    fn round_trip_nonce() {
        let nonce = [7u8; 32];
        let encoded = encode_b64(&nonce);
        assert!(!encoded.contains('='));
        assert_eq!(decode_b64(&encoded).unwrap(), nonce);
    }

    #[test]
    fn key_material_shapes() {
        let psk64 = encode_b64(&[0x11; 32]);
        let iv64 = encode_b64(&[0x22; 16]);
        let material = derive_key_material(&psk64, &iv64).unwrap();
        assert_eq!(material.iv, [0x22; 16]);
        // ENC and MAC derivations must differ
        assert_ne!(material.enc_key, material.mac_key);
    }

    #[test]
    fn iv_length_enforced() {
        let psk64 = encode_b64(&[0x11; 32]);
        let iv64 = encode_b64(&[0x22; 8]);
        assert!(derive_key_material(&psk64, &iv64).is_err());
    }
}
