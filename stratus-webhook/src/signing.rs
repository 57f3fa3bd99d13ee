//! HMAC-SHA256 payload signatures, hex encoded.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stratus_core::{CoreError, CoreResult};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_HEADER: &str = "X-Stratus-Event";
pub const DELIVERY_HEADER: &str = "X-Stratus-Delivery";
pub const SIGNATURE_HEADER: &str = "X-Stratus-Signature";

/// Hex HMAC-SHA256 of the raw payload bytes.
pub fn sign_payload(secret: &str, payload: &[u8]) -> CoreResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| CoreError::InternalError("HMAC key rejected".to_string()))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature. Accepts an optional `sha256=`
/// prefix.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);

    let Ok(provided) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    expected.as_slice().ct_eq(&provided).into()
}
