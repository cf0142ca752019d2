//! Offline classification of a scanned code against the station's cached
//! keys and revocation list.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{ParsedQr, ScanResult};
use crate::qr;

/// Ed25519 verification keys indexed by kid.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: HashMap<String, VerifyingKey>,
    default_kid: Option<String>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kid: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(kid.into(), key);
    }

    /// Key used for codes that carry no kid.
    pub fn with_default_kid(mut self, kid: impl Into<String>) -> Self {
        self.default_kid = Some(kid.into());
        self
    }

    /// Build from `(kid, base64url public key)` pairs.
    pub fn from_encoded<'a, I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut ring = Self::new();
        for (kid, encoded) in entries {
            let bytes = qr::decode_signature(encoded)
                .map_err(|_| Error::InvalidKey { kid: kid.to_string() })?;
            let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes
                .try_into()
                .map_err(|_| Error::InvalidKey { kid: kid.to_string() })?;
            let key = VerifyingKey::from_bytes(&bytes)
                .map_err(|_| Error::InvalidKey { kid: kid.to_string() })?;
            ring.insert(kid, key);
        }
        Ok(ring)
    }

    pub fn select(&self, kid: &str) -> Option<&VerifyingKey> {
        if kid.is_empty() {
            return self.default_kid.as_deref().and_then(|d| self.keys.get(d));
        }
        self.keys.get(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Everything the classifier needs from the device.
pub struct ValidationContext<'a> {
    pub now: DateTime<Utc>,
    pub max_clock_skew: Duration,
    pub revoked: &'a HashSet<i64>,
    pub keys: &'a KeyRing,
}

impl<'a> ValidationContext<'a> {
    pub fn new(
        now: DateTime<Utc>,
        max_clock_skew_minutes: i64,
        revoked: &'a HashSet<i64>,
        keys: &'a KeyRing,
    ) -> Self {
        Self {
            now,
            max_clock_skew: Duration::try_minutes(max_clock_skew_minutes.max(0)).unwrap_or(Duration::MAX),
            revoked,
            keys,
        }
    }
}

/// The signature covers the payload segment exactly as it appears in the code.
pub fn verify_signature(parsed: &ParsedQr, key: &VerifyingKey) -> bool {
    let Ok(signature) = Signature::from_slice(&parsed.signature_bytes) else {
        return false;
    };
    key.verify(parsed.raw_payload_base64.as_bytes(), &signature).is_ok()
}

/// RFC 3339, or a legacy ISO-8601 date-time without offset taken as UTC.
fn parse_bound(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Verdict for one scan. `None` means the code could not be decoded.
pub fn classify(parsed: Option<&ParsedQr>, ctx: &ValidationContext<'_>) -> ScanResult {
    let Some(parsed) = parsed else {
        return ScanResult::FormatError;
    };
    let payload = &parsed.payload;

    let Some(key) = ctx.keys.select(&payload.kid) else {
        debug!(kid = %payload.kid, auth_id = payload.auth_id, "no verification key for kid");
        return ScanResult::Invalid;
    };
    if !verify_signature(parsed, key) {
        debug!(auth_id = payload.auth_id, "signature verification failed");
        return ScanResult::Invalid;
    }

    if ctx.revoked.contains(&payload.auth_id) {
        return ScanResult::Revoked;
    }

    let (Some(valid_from), Some(valid_to)) =
        (parse_bound(&payload.valid_from), parse_bound(&payload.valid_to))
    else {
        debug!(auth_id = payload.auth_id, "validity window is not ISO-8601");
        return ScanResult::FormatError;
    };

    let earliest = valid_from
        .checked_sub_signed(ctx.max_clock_skew)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let latest = valid_to
        .checked_add_signed(ctx.max_clock_skew)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    if ctx.now < earliest || ctx.now > latest {
        return ScanResult::Expired;
    }

    ScanResult::Valid
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use chrono::TimeZone;
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::{json, Value};

    pub(crate) fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    pub(crate) fn sign_code(key: &SigningKey, payload: &Value) -> String {
        let segment = URL_SAFE_NO_PAD.encode(payload.to_string());
        let signature = key.sign(segment.as_bytes());
        format!("{}.{}", segment, URL_SAFE_NO_PAD.encode(signature.to_bytes()))
    }

    pub(crate) fn ring(key: &SigningKey) -> KeyRing {
        let mut ring = KeyRing::new();
        ring.insert("k1", key.verifying_key());
        ring
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn payload() -> Value {
        json!({"a": 123, "o": 456, "u": "A-101", "f": 1700000000, "t": 1700003600, "k": "k1"})
    }

    #[test]
    fn test_valid_signed_code() {
        let key = signing_key();
        let keys = ring(&key);
        let revoked = HashSet::new();
        let parsed = qr::parse(&sign_code(&key, &payload())).unwrap();

        let ctx = ValidationContext::new(at(1700001000), 5, &revoked, &keys);
        assert_eq!(classify(Some(&parsed), &ctx), ScanResult::Valid);
    }

    #[test]
    fn test_format_error_when_unparsed() {
        let keys = KeyRing::new();
        let revoked = HashSet::new();
        let ctx = ValidationContext::new(at(0), 5, &revoked, &keys);
        assert_eq!(classify(None, &ctx), ScanResult::FormatError);
    }

    #[test]
    fn test_invalid_signature_or_unknown_kid() {
        let key = signing_key();
        let keys = ring(&key);
        let revoked = HashSet::new();
        let ctx = ValidationContext::new(at(1700001000), 5, &revoked, &keys);

        // payload swapped after signing
        let mut parsed = qr::parse(&sign_code(&key, &payload())).unwrap();
        let forged = json!({"a": 124, "o": 456, "f": 1700000000, "t": 1700003600, "k": "k1"});
        parsed.raw_payload_base64 = URL_SAFE_NO_PAD.encode(forged.to_string());
        assert_eq!(classify(Some(&parsed), &ctx), ScanResult::Invalid);

        // signed by someone else
        let stranger = SigningKey::from_bytes(&[9u8; 32]);
        let parsed = qr::parse(&sign_code(&stranger, &payload())).unwrap();
        assert_eq!(classify(Some(&parsed), &ctx), ScanResult::Invalid);

        // kid not in the ring
        let mut other_kid = payload();
        other_kid["k"] = json!("k9");
        let parsed = qr::parse(&sign_code(&key, &other_kid)).unwrap();
        assert_eq!(classify(Some(&parsed), &ctx), ScanResult::Invalid);

        // signature of the wrong length
        let truncated = qr::parse(
            "eyJhIjoxMjMsIm8iOjQ1NiwidSI6IkEtMTAxIiwiZiI6MTcwMDAwMDAwMCwidCI6MTcwMDAwMzYwMCwiayI6ImsxIn0.c2lnbmF0dXJlYnl0ZXM",
        )
        .unwrap();
        assert_eq!(classify(Some(&truncated), &ctx), ScanResult::Invalid);
    }

    #[test]
    fn test_default_kid_for_codes_without_kid() {
        let key = signing_key();
        let keys = ring(&key).with_default_kid("k1");
        let revoked = HashSet::new();
        let ctx = ValidationContext::new(at(1700001000), 5, &revoked, &keys);

        let mut no_kid = payload();
        no_kid.as_object_mut().unwrap().remove("k");
        let parsed = qr::parse(&sign_code(&key, &no_kid)).unwrap();
        assert_eq!(classify(Some(&parsed), &ctx), ScanResult::Valid);

        let without_default = ring(&key);
        let ctx = ValidationContext::new(at(1700001000), 5, &revoked, &without_default);
        assert_eq!(classify(Some(&parsed), &ctx), ScanResult::Invalid);
    }

    #[test]
    fn test_revoked() {
        let key = signing_key();
        let keys = ring(&key);
        let revoked: HashSet<i64> = [123].into_iter().collect();
        let parsed = qr::parse(&sign_code(&key, &payload())).unwrap();

        let ctx = ValidationContext::new(at(1700001000), 5, &revoked, &keys);
        assert_eq!(classify(Some(&parsed), &ctx), ScanResult::Revoked);
    }

    #[test]
    fn test_expiry_respects_clock_skew() {
        let key = signing_key();
        let keys = ring(&key);
        let revoked = HashSet::new();
        let parsed = qr::parse(&sign_code(&key, &payload())).unwrap();
        let check = |now: i64| {
            let ctx = ValidationContext::new(at(now), 5, &revoked, &keys);
            classify(Some(&parsed), &ctx)
        };

        assert_eq!(check(1700000000 - 300), ScanResult::Valid);
        assert_eq!(check(1700000000 - 301), ScanResult::Expired);
        assert_eq!(check(1700003600 + 300), ScanResult::Valid);
        assert_eq!(check(1700003600 + 301), ScanResult::Expired);
    }

    #[test]
    fn test_legacy_window_that_is_not_rfc3339() {
        let key = signing_key();
        let keys = ring(&key);
        let revoked = HashSet::new();
        let legacy = json!({"authId": 5, "orgId": 6, "validFrom": "yesterday", "validTo": "tomorrow", "kid": "k1"});
        let parsed = qr::parse(&sign_code(&key, &legacy)).unwrap();

        let ctx = ValidationContext::new(at(1700001000), 5, &revoked, &keys);
        assert_eq!(classify(Some(&parsed), &ctx), ScanResult::FormatError);
    }

    #[test]
    fn test_extreme_clock_skew_does_not_overflow() {
        let key = signing_key();
        let keys = ring(&key);
        let revoked = HashSet::new();
        let parsed = qr::parse(&sign_code(&key, &payload())).unwrap();

        let huge = ValidationContext::new(at(1700001000), 1_000_000_000_000, &revoked, &keys);
        assert_eq!(classify(Some(&parsed), &huge), ScanResult::Valid);
        let huge = ValidationContext::new(at(0), i64::MAX, &revoked, &keys);
        assert_eq!(classify(Some(&parsed), &huge), ScanResult::Valid);

        // negative skew never narrows the window
        let negative = ValidationContext::new(at(1700001000), -30, &revoked, &keys);
        assert_eq!(negative.max_clock_skew, Duration::zero());
        assert_eq!(classify(Some(&parsed), &negative), ScanResult::Valid);
        let negative = ValidationContext::new(at(1700000000), -30, &revoked, &keys);
        assert_eq!(classify(Some(&parsed), &negative), ScanResult::Valid);
    }

    #[test]
    fn test_legacy_window_without_offset_is_utc() {
        let key = signing_key();
        let keys = ring(&key);
        let revoked = HashSet::new();
        let legacy = json!({
            "authId": 5, "orgId": 6, "kid": "k1",
            "validFrom": "2024-05-01T08:00:00", "validTo": "2024-05-01T20:00:00.500"
        });
        let parsed = qr::parse(&sign_code(&key, &legacy)).unwrap();
        let check = |now: DateTime<Utc>| {
            let ctx = ValidationContext::new(now, 5, &revoked, &keys);
            classify(Some(&parsed), &ctx)
        };

        assert_eq!(check(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()), ScanResult::Valid);
        assert_eq!(check(Utc.with_ymd_and_hms(2024, 5, 1, 7, 54, 0).unwrap()), ScanResult::Expired);
        assert_eq!(check(Utc.with_ymd_and_hms(2024, 5, 1, 20, 5, 0).unwrap()), ScanResult::Valid);
        assert_eq!(check(Utc.with_ymd_and_hms(2024, 5, 1, 20, 6, 0).unwrap()), ScanResult::Expired);
    }

    #[test]
    fn test_key_ring_from_encoded() {
        let key = signing_key();
        let encoded = URL_SAFE_NO_PAD.encode(key.verifying_key().to_bytes());
        let ring = KeyRing::from_encoded([("k1", encoded.as_str())]).unwrap();
        assert_eq!(ring.len(), 1);
        assert!(ring.select("k1").is_some());
        assert!(ring.select("").is_none());

        assert!(KeyRing::from_encoded([("bad", "c2hvcnQ")]).is_err());
    }
}
