//! Decoder for signed visitor-authorization QR codes.
//!
//! Wire format: `<base64url payload>.<base64url signature>`. The payload is a
//! UTF-8 JSON object using either single-letter keys (current issuers, to keep
//! the code small) or long-form keys (codes issued before the compact format).
//! Decoding is total: every failure becomes [`UnparseableQr`], with the reason
//! logged at debug level.

use base64::{
    alphabet,
    engine::{GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::models::{ParsedQr, QrPayload};

const SEPARATOR: char = '.';

// Standard alphabet after the url-safe characters are translated back.
// Non-zero trailing bits are accepted, as browsers' atob does.
const PADDED: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// The scanned string is not a usable authorization code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unparseable QR code")]
pub struct UnparseableQr;

#[derive(Debug, Error)]
enum ParseFailure {
    #[error("no '.' separator")]
    MissingSeparator,
    #[error("empty {0} segment")]
    EmptySegment(&'static str),
    #[error("invalid base64 in {segment} segment: {source}")]
    Base64 {
        segment: &'static str,
        source: base64::DecodeError,
    },
    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("field {0} has an unexpected type")]
    WrongType(&'static str),
    #[error("timestamp in {0} is out of range")]
    TimestampRange(&'static str),
    #[error("required field {0} missing")]
    MissingRequired(&'static str),
}

/// Decode a scanned QR string into its payload and detached signature.
pub fn parse(raw: &str) -> Result<ParsedQr, UnparseableQr> {
    decode(raw).map_err(|reason| {
        debug!(%reason, len = raw.len(), "rejected QR code");
        UnparseableQr
    })
}

fn decode(raw: &str) -> Result<ParsedQr, ParseFailure> {
    let (payload_segment, signature_segment) = raw
        .rsplit_once(SEPARATOR)
        .ok_or(ParseFailure::MissingSeparator)?;
    if payload_segment.is_empty() {
        return Err(ParseFailure::EmptySegment("payload"));
    }
    if signature_segment.is_empty() {
        return Err(ParseFailure::EmptySegment("signature"));
    }

    let payload_bytes = decode_base64url(payload_segment)
        .map_err(|source| ParseFailure::Base64 { segment: "payload", source })?;
    let json = std::str::from_utf8(&payload_bytes)?;
    let record = match serde_json::from_str::<Value>(json)? {
        Value::Object(map) => map,
        _ => return Err(ParseFailure::NotAnObject),
    };
    let payload = normalize(&record)?;

    let signature_bytes = decode_signature(signature_segment)
        .map_err(|source| ParseFailure::Base64 { segment: "signature", source })?;

    Ok(ParsedQr {
        payload,
        signature_bytes,
        raw_payload_base64: payload_segment.to_string(),
    })
}

/// Raw bytes of the detached signature segment.
pub fn decode_signature(segment: &str) -> Result<Vec<u8>, base64::DecodeError> {
    decode_base64url(segment)
}

fn decode_base64url(segment: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let mut standard: String = segment
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    while standard.len() % 4 != 0 {
        standard.push('=');
    }
    PADDED.decode(standard)
}

/// A validity bound as found in the payload, before conversion to ISO-8601.
#[derive(Debug, Clone, PartialEq)]
enum ValidityBound {
    EpochSeconds(f64),
    Iso(String),
    Missing,
}

impl ValidityBound {
    fn resolve(record: &Map<String, Value>, short: &str, legacy: &str) -> Self {
        if let Some(Value::Number(n)) = record.get(short) {
            if let Some(secs) = n.as_f64() {
                return ValidityBound::EpochSeconds(secs);
            }
        }
        match record.get(legacy) {
            Some(Value::String(s)) => ValidityBound::Iso(s.clone()),
            _ => ValidityBound::Missing,
        }
    }

    fn into_iso(self, field: &'static str) -> Result<String, ParseFailure> {
        match self {
            ValidityBound::EpochSeconds(secs) => {
                let millis = secs * 1000.0;
                if !millis.is_finite() || millis.abs() > i64::MAX as f64 {
                    return Err(ParseFailure::TimestampRange(field));
                }
                DateTime::<Utc>::from_timestamp_millis(millis.trunc() as i64)
                    .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
                    .ok_or(ParseFailure::TimestampRange(field))
            }
            ValidityBound::Iso(s) => Ok(s),
            ValidityBound::Missing => Ok(String::new()),
        }
    }
}

/// First present, non-null value of the short key, then the legacy key.
fn lookup<'a>(record: &'a Map<String, Value>, short: &str, legacy: &str) -> Option<&'a Value> {
    [short, legacy]
        .into_iter()
        .filter_map(|key| record.get(key))
        .find(|value| !value.is_null())
}

fn id_field(
    record: &Map<String, Value>,
    short: &str,
    legacy: &'static str,
) -> Result<i64, ParseFailure> {
    match lookup(record, short, legacy) {
        None => Ok(0),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            })
            .ok_or(ParseFailure::WrongType(legacy)),
        Some(_) => Err(ParseFailure::WrongType(legacy)),
    }
}

fn optional_text_field(
    record: &Map<String, Value>,
    short: &str,
    legacy: &'static str,
) -> Result<Option<String>, ParseFailure> {
    match lookup(record, short, legacy) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(ParseFailure::WrongType(legacy)),
    }
}

fn text_field(
    record: &Map<String, Value>,
    short: &str,
    legacy: &'static str,
) -> Result<String, ParseFailure> {
    Ok(optional_text_field(record, short, legacy)?.unwrap_or_default())
}

/// Map a decoded record onto the canonical payload and check required fields.
fn normalize(record: &Map<String, Value>) -> Result<QrPayload, ParseFailure> {
    let payload = QrPayload {
        auth_id: id_field(record, "a", "authId")?,
        org_id: id_field(record, "o", "orgId")?,
        unit_code: text_field(record, "u", "unitCode")?,
        person_name: text_field(record, "n", "personName")?,
        person_doc: text_field(record, "d", "personDoc")?,
        service_type: text_field(record, "s", "serviceType")?,
        valid_from: ValidityBound::resolve(record, "f", "validFrom").into_iso("validFrom")?,
        valid_to: ValidityBound::resolve(record, "t", "validTo").into_iso("validTo")?,
        vehicle_plate: optional_text_field(record, "p", "vehiclePlate")?,
        vehicle_type: optional_text_field(record, "y", "vehicleType")?,
        vehicle_color: optional_text_field(record, "c", "vehicleColor")?,
        // issuers never emit a compact issue time
        issued_at: match record.get("issuedAt") {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        },
        kid: text_field(record, "k", "kid")?,
    };

    // 0 doubles as the "absent" default for ids
    if payload.auth_id == 0 {
        return Err(ParseFailure::MissingRequired("authId"));
    }
    if payload.org_id == 0 {
        return Err(ParseFailure::MissingRequired("orgId"));
    }
    if payload.valid_from.is_empty() {
        return Err(ParseFailure::MissingRequired("validFrom"));
    }
    if payload.valid_to.is_empty() {
        return Err(ParseFailure::MissingRequired("validTo"));
    }

    Ok(payload)
}
