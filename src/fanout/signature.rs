use anyhow::{anyhow, Result};
use base64::prelude::*;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Sign a webhook body with HMAC-SHA256, base64url without padding.
/// Receivers recompute the MAC over the raw body bytes.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|e| anyhow!("Failed to create HMAC: {}", e))?;
    mac.update(body);
    let signature = mac.finalize().into_bytes();
    Ok(BASE64_URL_SAFE_NO_PAD.encode(signature))
}

/// Verify a webhook signature in constant time.
pub fn verify(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    let Ok(provided) = BASE64_URL_SAFE_NO_PAD.decode(signature) else {
        return false;
    };

    use subtle::ConstantTimeEq;
    expected.ct_eq(&provided[..]).into()
}
