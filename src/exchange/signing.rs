//! HMAC-SHA256 request signing for the Pionex REST API.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Sorted `k=v&k=v` query string, the form the venue signs.
pub fn canonical_query(params: &[(&str, String)]) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Sign a request with HMAC-SHA256 (Pionex style).
/// Message is `METHOD + PATH + "?" + sorted query`, with the JSON body
/// appended for POST and DELETE. Returns hex-encoded signature.
pub fn sign_pionex(method: &str, path: &str, query: &str, body: Option<&str>, secret: &str) -> Result<String, String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| format!("HMAC error: {}", e))?;
    mac.update(method.to_uppercase().as_bytes());
    mac.update(path.as_bytes());
    mac.update(b"?");
    mac.update(query.as_bytes());
    if let Some(body) = body {
        mac.update(body.as_bytes());
    }
    Ok(hex::encode(mac.finalize().into_bytes()))
}
