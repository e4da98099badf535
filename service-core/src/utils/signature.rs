use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

fn keyed_mac(secret: &str, payload: &str) -> anyhow::Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(payload.as_bytes());
    Ok(mac)
}

/// Hex-encoded HMAC-SHA256 of `payload`.
pub fn generate_signature(secret: &str, payload: &str) -> anyhow::Result<String> {
    Ok(hex::encode(keyed_mac(secret, payload)?.finalize().into_bytes()))
}

/// Check a hex-encoded HMAC-SHA256 signature in constant time. Signatures
/// that are not valid hex never match.
pub fn verify_signature(secret: &str, payload: &str, signature: &str) -> anyhow::Result<bool> {
    let Ok(provided) = hex::decode(signature) else {
        return Ok(false);
    };
    let expected = keyed_mac(secret, payload)?.finalize().into_bytes();

    Ok(expected.len() == provided.len() && bool::from(expected.as_slice().ct_eq(&provided)))
}
