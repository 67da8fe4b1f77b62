// ── TLS-PSK transport context ──
//
// Newer appliances skip the AES record layer and instead run TLS 1.2
// with a PSK cipher suite and no certificates. rustls has no TLS 1.2
// PSK suites, so this goes through openssl, whose PSK client callback
// matches what the appliance firmware expects: identity written
// null-terminated, key bytes copied into the provided buffer.
//
// The identity and key are moved into the callback closure -- credentials
// stay scoped to the session that created the context.

use openssl::error::ErrorStack;
use openssl::ssl::{SslContext, SslMethod, SslVersion};

use crate::error::Error;

/// Build a TLS 1.2-pinned client context that authenticates with the
/// given PSK identity and key and offers `cipher_list` (normally `"PSK"`).
pub fn psk_context(identity: &str, key: Vec<u8>, cipher_list: &str) -> Result<SslContext, Error> {
    let mut builder = SslContext::builder(SslMethod::tls_client()).map_err(tls_err)?;
    builder
        .set_min_proto_version(Some(SslVersion::TLS1_2))
        .map_err(tls_err)?;
    builder
        .set_max_proto_version(Some(SslVersion::TLS1_2))
        .map_err(tls_err)?;
    builder.set_cipher_list(cipher_list).map_err(tls_err)?;

    let identity = identity.as_bytes().to_vec();
    builder.set_psk_client_callback(move |_ssl, _hint, identity_buf, psk_buf| {
        if identity.len() + 1 > identity_buf.len() || key.len() > psk_buf.len() {
            // Buffers are sized by openssl; running out means a
            // misconfigured identity/key. Returning 0 aborts the handshake.
            return Ok(0);
        }
        identity_buf[..identity.len()].copy_from_slice(&identity);
        identity_buf[identity.len()] = 0;
        psk_buf[..key.len()].copy_from_slice(&key);
        Ok(key.len())
    });

    Ok(builder.build())
}

fn tls_err(e: ErrorStack) -> Error {
    Error::Tls(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_builds_with_psk_ciphers() {
        psk_context("Client_identity", vec![0x42; 32], "PSK").unwrap();
    }

    #[test]
    fn bogus_cipher_list_is_rejected() {
        assert!(psk_context("Client_identity", vec![0x42; 32], "NOT-A-CIPHER").is_err());
    }
}
