use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::models::Provider;

type HmacSha256 = Hmac<Sha256>;

pub const COINGATE_SIGNATURE_HEADER: &str = "x-coingate-signature";
pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
pub const YOOKASSA_SIGNATURE_HEADER: &str = "x-yookassa-signature";

/// Default allowed clock skew for timestamped signatures, in seconds
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Missing signature header {0}")]
    MissingHeader(String),

    #[error("Malformed signature header: {0}")]
    Malformed(String),

    #[error("Signature timestamp outside tolerance")]
    StaleTimestamp,

    #[error("Signature mismatch")]
    Mismatch,

    #[error("No webhook secret configured for {0}")]
    SecretNotConfigured(Provider),
}

/// Header that carries the signature for a provider
pub fn signature_header(provider: Provider) -> &'static str {
    match provider {
        Provider::Coingate => COINGATE_SIGNATURE_HEADER,
        Provider::Stripe => STRIPE_SIGNATURE_HEADER,
        Provider::Yookassa => YOOKASSA_SIGNATURE_HEADER,
    }
}

/// Verify an inbound webhook against the provider's signing scheme
///
/// * CoinGate / YooKassa: hex HMAC-SHA256 of the raw body
/// * Stripe: `t=<unix>,v1=<hex>` where the MAC covers `"{t}.{body}"`
///
/// The comparison runs in constant time via `Mac::verify_slice`.
pub fn verify(
    provider: Provider,
    raw_body: &[u8],
    headers: &HeaderMap,
    secret: &str,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    verify_at(
        provider,
        raw_body,
        headers,
        secret,
        tolerance_secs,
        chrono::Utc::now().timestamp(),
    )
}

/// Same as [`verify`] with an explicit current time
pub fn verify_at(
    provider: Provider,
    raw_body: &[u8],
    headers: &HeaderMap,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), SignatureError> {
    let header_name = signature_header(provider);
    let header = headers
        .get(header_name)
        .ok_or_else(|| SignatureError::MissingHeader(header_name.to_string()))?
        .to_str()
        .map_err(|_| SignatureError::Malformed("header is not ASCII".to_string()))?
        .trim();

    if header.is_empty() {
        return Err(SignatureError::MissingHeader(header_name.to_string()));
    }
    if secret.is_empty() {
        return Err(SignatureError::SecretNotConfigured(provider));
    }

    match provider {
        Provider::Coingate | Provider::Yookassa => verify_hex_mac(secret, raw_body, header),
        Provider::Stripe => verify_timestamped(secret, raw_body, header, tolerance_secs, now),
    }
}

fn verify_hex_mac(secret: &str, payload: &[u8], received_hex: &str) -> Result<(), SignatureError> {
    let received = hex::decode(received_hex)
        .map_err(|_| SignatureError::Malformed("signature is not hex".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::Malformed("invalid secret length".to_string()))?;
    mac.update(payload);
    mac.verify_slice(&received)
        .map_err(|_| SignatureError::Mismatch)
}

fn verify_timestamped(
    secret: &str,
    raw_body: &[u8],
    header: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',').map(str::trim) {
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = Some(t);
        } else if let Some(v1) = part.strip_prefix("v1=") {
            candidates.push(v1);
        }
    }

    let timestamp = timestamp.ok_or_else(|| SignatureError::Malformed("missing t=".to_string()))?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed("missing v1=".to_string()));
    }

    let sent_at: i64 = timestamp
        .parse()
        .map_err(|_| SignatureError::Malformed("timestamp is not an integer".to_string()))?;
    if (now - sent_at).abs() > tolerance_secs {
        return Err(SignatureError::StaleTimestamp);
    }

    let mut signed_payload = Vec::with_capacity(timestamp.len() + 1 + raw_body.len());
    signed_payload.extend_from_slice(timestamp.as_bytes());
    signed_payload.push(b'.');
    signed_payload.extend_from_slice(raw_body);

    // Stripe may send several v1 entries during secret rotation
    if candidates
        .into_iter()
        .any(|candidate| verify_hex_mac(secret, &signed_payload, candidate).is_ok())
    {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Hex HMAC-SHA256 of `payload`, the value CoinGate and YooKassa send
pub fn sign_hex(secret: &str, payload: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::Malformed("invalid secret length".to_string()))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Stripe-style `t=..,v1=..` header value for `payload` at `timestamp`
pub fn sign_timestamped(secret: &str, payload: &[u8], timestamp: i64) -> Result<String, SignatureError> {
    let mut signed = format!("{timestamp}.").into_bytes();
    signed.extend_from_slice(payload);
    Ok(format!("t={},v1={}", timestamp, sign_hex(secret, &signed)?))
}
