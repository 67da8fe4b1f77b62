// ── AES record layer ──
//
// In AES mode every WebSocket binary frame is one logical JSON record:
//
//   ciphertext = AES-256-CBC(enc_key, iv, padded_cleartext)
//   tag        = HMAC-SHA256(mac_key, iv || dir || last_tag || ciphertext)[0..16]
//   frame      = ciphertext || tag
//
// The direction byte ('E' for frames the client emits, 'C' for frames
// the appliance emits) prevents reflecting an outbound frame back as
// inbound. Each direction chains its previous tag into the next MAC, so
// frames only verify in emission order. The CBC IV is static per
// appliance; record-level freshness comes from the MAC chain.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::error::Error;
use crate::psk::{hmac_sha256, KeyMaterial};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const TAG_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
/// Shortest valid frame: one cipher block plus the truncated tag.
pub const MIN_FRAME_LEN: usize = BLOCK_LEN + TAG_LEN;

/// Direction tag on frames the client emits (`'E'`).
const DIR_CLIENT_TX: u8 = 0x45;
/// Direction tag on frames the appliance emits (`'C'`).
const DIR_APPLIANCE_TX: u8 = 0x43;

/// Encrypting half of one direction of the record layer.
///
/// Owns the rolling tx HMAC chain; every successful [`encrypt`]
/// advances it. Callers that share an encryptor across tasks must
/// serialise `encrypt + write` so ciphertext hits the socket in
/// MAC-chain order.
///
/// [`encrypt`]: FrameEncryptor::encrypt
pub struct FrameEncryptor {
    keys: KeyMaterial,
    direction: u8,
    last_hmac: [u8; TAG_LEN],
}

/// Decrypting half of one direction of the record layer.
///
/// The rx chain advances only on successfully verified frames; a bad
/// frame leaves the chain untouched so the next genuine frame still
/// verifies.
pub struct FrameDecryptor {
    keys: KeyMaterial,
    direction: u8,
    last_hmac: [u8; TAG_LEN],
}

/// Build the client-side pair: encrypt as `'E'`, verify inbound `'C'`.
pub fn client_pair(keys: KeyMaterial) -> (FrameEncryptor, FrameDecryptor) {
    (
        FrameEncryptor::new(keys.clone(), DIR_CLIENT_TX),
        FrameDecryptor::new(keys, DIR_APPLIANCE_TX),
    )
}

/// Build the appliance-side pair (the mirror image of [`client_pair`]).
/// Used by simulators and the in-process test appliance.
pub fn appliance_pair(keys: KeyMaterial) -> (FrameEncryptor, FrameDecryptor) {
    (
        FrameEncryptor::new(keys.clone(), DIR_APPLIANCE_TX),
        FrameDecryptor::new(keys, DIR_CLIENT_TX),
    )
}

impl FrameEncryptor {
    fn new(keys: KeyMaterial, direction: u8) -> Self {
        Self {
            keys,
            direction,
            last_hmac: [0; TAG_LEN],
        }
    }

    /// Encrypt one logical JSON record into one WebSocket binary payload.
    pub fn encrypt(&mut self, clear: &str) -> Vec<u8> {
        let padded = pad(clear.as_bytes());
        let cipher = Aes256CbcEnc::new(&self.keys.enc_key.into(), &self.keys.iv.into());
        let mut frame = cipher.encrypt_padded_vec_mut::<NoPadding>(&padded);

        let tag = self.chain_tag(&frame);
        self.last_hmac = tag;
        frame.extend_from_slice(&tag);
        frame
    }

    fn chain_tag(&self, ciphertext: &[u8]) -> [u8; TAG_LEN] {
        chain_tag(&self.keys, self.direction, &self.last_hmac, ciphertext)
    }
}

impl FrameDecryptor {
    fn new(keys: KeyMaterial, direction: u8) -> Self {
        Self {
            keys,
            direction,
            last_hmac: [0; TAG_LEN],
        }
    }

    /// Verify and decrypt one binary frame back into its JSON record.
    ///
    /// Any failure is a [`Error::Protocol`]; the caller drops the frame
    /// and the rx chain stays where it was.
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<String, Error> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }
        if frame.len() % BLOCK_LEN != 0 {
            return Err(Error::Protocol(format!(
                "frame length {} not a multiple of {BLOCK_LEN}",
                frame.len()
            )));
        }

        let (ciphertext, recv_tag) = frame.split_at(frame.len() - TAG_LEN);
        let calc = chain_tag(&self.keys, self.direction, &self.last_hmac, ciphertext);
        if !bool::from(calc.ct_eq(recv_tag)) {
            return Err(Error::Protocol("HMAC verification failed".into()));
        }

        // Chain advances only past this point.
        self.last_hmac
            .copy_from_slice(recv_tag);

        let cipher = Aes256CbcDec::new(&self.keys.enc_key.into(), &self.keys.iv.into());
        let padded = cipher
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| Error::Protocol("AES decryption failed".into()))?;
        let clear = unpad(&padded)?;

        String::from_utf8(clear.to_vec())
            .map_err(|e| Error::Protocol(format!("cleartext is not UTF-8: {e}")))
    }
}

fn chain_tag(
    keys: &KeyMaterial,
    direction: u8,
    last_hmac: &[u8; TAG_LEN],
    ciphertext: &[u8],
) -> [u8; TAG_LEN] {
    let mut input = Vec::with_capacity(16 + 1 + TAG_LEN + ciphertext.len());
    input.extend_from_slice(&keys.iv);
    input.push(direction);
    input.extend_from_slice(last_hmac);
    input.extend_from_slice(ciphertext);

    let digest = hmac_sha256(&keys.mac_key, &input);
    let mut tag = [0; TAG_LEN];
    tag.copy_from_slice(&digest[..TAG_LEN]);
    tag
}

// Not PKCS#7: the appliance expects `0x00 || random filler || pad_len`,
// with pad_len bumped past 1 so the marker byte always fits.
fn pad(clear: &[u8]) -> Vec<u8> {
    let mut pad_len = BLOCK_LEN - clear.len() % BLOCK_LEN;
    if pad_len == 1 {
        pad_len += BLOCK_LEN;
    }

    let mut out = Vec::with_capacity(clear.len() + pad_len);
    out.extend_from_slice(clear);
    out.push(0);
    let mut filler = vec![0u8; pad_len - 2];
    rand::rng().fill_bytes(&mut filler);
    out.extend_from_slice(&filler);
    out.push(pad_len as u8);
    out
}

fn unpad(padded: &[u8]) -> Result<&[u8], Error> {
    let pad_len = *padded.last().ok_or_else(|| {
        Error::Protocol("empty cleartext".into())
    })? as usize;
    if !(2..=2 * BLOCK_LEN).contains(&pad_len) || pad_len > padded.len() {
        return Err(Error::Protocol(format!("invalid pad length {pad_len}")));
    }
    Ok(&padded[..padded.len() - pad_len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psk::derive_key_material;

    fn material() -> KeyMaterial {
        let psk64 = crate::psk::encode_b64(&[0xa5; 32]);
        let iv64 = crate::psk::encode_b64(&[0x5a; 16]);
        derive_key_material(&psk64, &iv64).unwrap()
    }

    #[test]
    fn round_trip_between_peers() {
        let (mut client_tx, _) = client_pair(material());
        let (_, mut appliance_rx) = appliance_pair(material());

        for msg in ["{}", "{\"resource\":\"/ro/values\"}", "x"] {
            let frame = client_tx.encrypt(msg);
            assert_eq!(appliance_rx.decrypt(&frame).unwrap(), msg);
        }
    }

    #[test]
    fn padded_length_is_block_aligned() {
        for len in 0..64 {
            let clear = vec![b'a'; len];
            let padded = pad(&clear);
            assert_eq!(padded.len() % BLOCK_LEN, 0, "len {len}");
            let overhead = padded.len() - len;
            assert!((2..=2 * BLOCK_LEN + 1).contains(&overhead), "len {len}");
            assert_eq!(unpad(&padded).unwrap(), &clear[..]);
            assert_eq!(padded[len], 0, "marker byte after cleartext, len {len}");
        }
    }

    #[test]
    fn rejects_short_frame() {
        let (_, mut rx) = appliance_pair(material());
        assert!(matches!(rx.decrypt(&[0u8; 31]), Err(Error::Protocol(_))));
    }

    #[test]
    fn rejects_unaligned_frame() {
        let (_, mut rx) = appliance_pair(material());
        assert!(matches!(rx.decrypt(&[0u8; 33]), Err(Error::Protocol(_))));
    }

    #[test]
    fn mac_chain_binds_frame_order() {
        let (mut tx, _) = client_pair(material());
        let frame_a = tx.encrypt("{\"msgID\":1}");
        let frame_b = tx.encrypt("{\"msgID\":2}");

        // In-order peer accepts both.
        let (_, mut rx) = appliance_pair(material());
        assert!(rx.decrypt(&frame_a).is_ok());
        assert!(rx.decrypt(&frame_b).is_ok());

        // Out-of-order peer rejects B first, chain stays put, then
        // accepts A and B normally.
        let (_, mut rx) = appliance_pair(material());
        let before = rx.last_hmac;
        assert!(rx.decrypt(&frame_b).is_err());
        assert_eq!(rx.last_hmac, before, "failed verify must not advance the chain");
        assert!(rx.decrypt(&frame_a).is_ok());
        assert!(rx.decrypt(&frame_b).is_ok());
    }

    #[test]
    fn direction_tag_stops_reflection() {
        let (mut client_tx, mut client_rx) = client_pair(material());
        let frame = client_tx.encrypt("{\"resource\":\"/ro/values\"}");
        // A frame we sent, replayed back at us, must not verify.
        assert!(client_rx.decrypt(&frame).is_err());
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let (mut tx, _) = client_pair(material());
        let (_, mut rx) = appliance_pair(material());
        let mut frame = tx.encrypt("{\"sID\":7}");
        frame[0] ^= 0x80;
        assert!(rx.decrypt(&frame).is_err());
    }
}
