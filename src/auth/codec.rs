// Bearer token decoding
// Reads structure and claims of a JWT-shaped token without verifying signatures

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Map, Value};

/// Decoded view of an access token
#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    pub subject: Option<String>,
    pub token_type: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining: Duration,
    pub is_expired: bool,
}

/// Decode one base64url segment into a JSON object.
/// Padding is tolerated since some issuers emit it.
fn decode_segment(segment: &str) -> Option<Map<String, Value>> {
    let bytes = URL_SAFE_NO_PAD.decode(segment.trim_end_matches('=')).ok()?;
    match serde_json::from_slice::<Value>(&bytes).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Split into exactly three non-empty segments
fn segments(token: &str) -> Option<[&str; 3]> {
    let mut parts = token.split('.');
    let header = parts.next()?;
    let payload = parts.next()?;
    let signature = parts.next()?;
    if parts.next().is_some() || [header, payload, signature].iter().any(|s| s.is_empty()) {
        return None;
    }
    Some([header, payload, signature])
}

/// Claims of a structurally valid token
pub fn claims(token: &str) -> Option<Map<String, Value>> {
    let [header, payload, _] = segments(token)?;
    decode_segment(header)?;
    decode_segment(payload)
}

/// Three non-empty segments whose header and payload decode as JSON objects
pub fn is_structurally_valid(token: &str) -> bool {
    claims(token).is_some()
}

/// Absolute expiry from the numeric `exp` claim
pub fn expiry(token: &str) -> Option<DateTime<Utc>> {
    let exp = claims(token)?.get("exp")?.as_f64()?;
    if !exp.is_finite() {
        return None;
    }
    Utc.timestamp_opt(exp.trunc() as i64, 0).single()
}

/// Expired once `now >= exp - buffer`; unknown expiry counts as expired
pub fn is_expired(token: &str, buffer: Duration) -> bool {
    is_expired_at(token, buffer, Utc::now())
}

pub fn is_expired_at(token: &str, buffer: Duration, now: DateTime<Utc>) -> bool {
    match expiry(token) {
        Some(exp) => now >= exp - buffer,
        None => true,
    }
}

/// Best-effort identity: `sub`, then `user_id`
pub fn subject(token: &str) -> Option<String> {
    let claims = claims(token)?;
    ["sub", "user_id"].iter().find_map(|key| match claims.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// The `type` claim some issuers use to tell access from refresh tokens
pub fn token_type(token: &str) -> Option<String> {
    claims(token)?
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Time left before expiry, clamped at zero
pub fn remaining(token: &str) -> Duration {
    expiry(token)
        .map(|exp| (exp - Utc::now()).max(Duration::zero()))
        .unwrap_or_else(Duration::zero)
}

/// Everything the codec can tell about a token, or `None` when malformed
pub fn inspect(token: &str) -> Option<TokenInfo> {
    if !is_structurally_valid(token) {
        return None;
    }
    Some(TokenInfo {
        subject: subject(token),
        token_type: token_type(token),
        expires_at: expiry(token),
        remaining: remaining(token),
        is_expired: is_expired(token, Duration::zero()),
    })
}

/// Build an unsigned token for tests and local tooling
#[cfg(any(test, feature = "test-utils"))]
pub fn encode_unsigned(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.c2lnbmF0dXJl", header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn token_expiring_in(secs: i64) -> String {
        encode_unsigned(&json!({
            "sub": "user-42",
            "type": "access",
            "exp": (Utc::now() + Duration::seconds(secs)).timestamp(),
        }))
    }

    #[test]
    fn test_valid_token_decodes() {
        let token = token_expiring_in(600);
        assert!(is_structurally_valid(&token));
        assert_eq!(subject(&token).as_deref(), Some("user-42"));
        assert_eq!(token_type(&token).as_deref(), Some("access"));

        let remaining = remaining(&token).num_seconds();
        assert!((595..=600).contains(&remaining));
    }

    #[test]
    fn test_structural_rejections() {
        let good = token_expiring_in(600);
        let [header, payload, _] = segments(&good).unwrap();

        assert!(!is_structurally_valid(""));
        assert!(!is_structurally_valid("only.two"));
        assert!(!is_structurally_valid(&format!("{}.{}.", header, payload)));
        assert!(!is_structurally_valid(&format!("{}..sig", header)));
        assert!(!is_structurally_valid(&format!("{}.{}.sig.extra", header, payload)));
        assert!(!is_structurally_valid(&format!("{}.bm90IGpzb24.sig", header)));
        // JSON that is not an object
        let array = URL_SAFE_NO_PAD.encode("[1,2]");
        assert!(!is_structurally_valid(&format!("{}.{}.sig", header, array)));
    }

    #[test]
    fn test_padded_segments_accepted() {
        let header = base64::engine::general_purpose::URL_SAFE.encode(r#"{"alg":"none"}"#);
        let payload = base64::engine::general_purpose::URL_SAFE.encode(r#"{"exp":4102444800}"#);
        let token = format!("{}.{}.sig", header, payload);
        assert!(is_structurally_valid(&token));
        assert_eq!(expiry(&token).unwrap().timestamp(), 4102444800);
    }

    #[test]
    fn test_expiry_with_buffer() {
        let token = token_expiring_in(600);
        assert!(!is_expired(&token, Duration::zero()));
        assert!(!is_expired(&token, Duration::seconds(300)));
        assert!(is_expired(&token, Duration::seconds(601)));

        let past = token_expiring_in(-60);
        assert!(is_expired(&past, Duration::zero()));
        assert_eq!(remaining(&past), Duration::zero());
    }

    #[test]
    fn test_expiry_boundary_is_expired() {
        let exp = Utc.timestamp_opt(2_000_000_000, 0).unwrap();
        let token = encode_unsigned(&json!({ "exp": exp.timestamp() }));
        assert!(is_expired_at(&token, Duration::zero(), exp));
        assert!(!is_expired_at(&token, Duration::zero(), exp - Duration::seconds(1)));
        assert!(is_expired_at(&token, Duration::seconds(300), exp - Duration::seconds(300)));
    }

    #[test]
    fn test_missing_exp_fails_closed() {
        let token = encode_unsigned(&json!({ "sub": "user-42" }));
        assert!(is_structurally_valid(&token));
        assert_eq!(expiry(&token), None);
        assert!(is_expired(&token, Duration::zero()));

        let textual = encode_unsigned(&json!({ "exp": "tomorrow" }));
        assert!(is_expired(&textual, Duration::zero()));
    }

    #[test]
    fn test_subject_fallback_to_user_id() {
        let token = encode_unsigned(&json!({ "user_id": 7, "exp": 4102444800u64 }));
        assert_eq!(subject(&token).as_deref(), Some("7"));

        let anonymous = encode_unsigned(&json!({ "exp": 4102444800u64 }));
        assert_eq!(subject(&anonymous), None);
    }

    #[test]
    fn test_inspect() {
        let info = inspect(&token_expiring_in(600)).unwrap();
        assert_eq!(info.subject.as_deref(), Some("user-42"));
        assert!(!info.is_expired);
        assert!(info.expires_at.is_some());

        assert_eq!(inspect("garbage"), None);
    }

    proptest! {
        #[test]
        fn prop_not_three_segments_fails_closed(s in "[A-Za-z0-9_\\-]{0,40}(\\.[A-Za-z0-9_\\-]{0,40}){0,1}") {
            prop_assert!(!is_structurally_valid(&s));
            prop_assert!(is_expired(&s, Duration::zero()));
        }

        #[test]
        fn prop_undecodable_payload_fails_closed(payload in "[!@#$%^&*()]{1,20}") {
            let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
            let token = format!("{}.{}.sig", header, payload);
            prop_assert!(!is_structurally_valid(&token));
            prop_assert!(is_expired(&token, Duration::zero()));
        }

        #[test]
        fn prop_arbitrary_strings_never_panic(s in "\\PC*") {
            let valid = is_structurally_valid(&s);
            if !valid {
                prop_assert!(is_expired(&s, Duration::zero()));
            }
        }
    }
}
