use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Canonical visitor authorization carried by a QR code, after short and
/// legacy keys have been resolved.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub auth_id: i64,
    pub org_id: i64,
    pub unit_code: String,
    pub person_name: String,
    pub person_doc: String,
    pub service_type: String,
    pub valid_from: String, // ISO-8601
    pub valid_to: String,   // ISO-8601
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_plate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_color: Option<String>,
    pub issued_at: String,
    pub kid: String,
}

/// A decoded QR code: the payload plus the detached signature and the exact
/// payload segment it was computed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQr {
    pub payload: QrPayload,
    pub signature_bytes: Vec<u8>,
    pub raw_payload_base64: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessAction {
    Entry,
    Exit,
}

/// Verdict of a single scan.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanResult {
    Valid,
    Invalid,
    Expired,
    Revoked,
    FormatError,
}

impl ScanResult {
    pub fn grants_access(self) -> bool {
        self == ScanResult::Valid
    }
}

impl fmt::Display for ScanResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanResult::Valid => "VALID",
            ScanResult::Invalid => "INVALID",
            ScanResult::Expired => "EXPIRED",
            ScanResult::Revoked => "REVOKED",
            ScanResult::FormatError => "FORMAT_ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    Synced,
}

/// Record of one scan at the gate. Only `sync_status` and `synced_at`
/// change after creation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessEvent {
    pub id: Uuid,
    pub action: AccessAction,
    pub scan_result: ScanResult,
    pub offline_validated: bool,
    pub sync_status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    pub scanned_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl AccessEvent {
    /// New event for a scan; identity fields are copied from the payload when
    /// the code could be decoded.
    pub fn new(
        action: AccessAction,
        scan_result: ScanResult,
        payload: Option<&QrPayload>,
        offline_validated: bool,
        operator: Option<String>,
        scanned_at: DateTime<Utc>,
    ) -> Self {
        let sync_status = if offline_validated {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };
        Self {
            id: Uuid::new_v4(),
            action,
            scan_result,
            offline_validated,
            sync_status,
            auth_id: payload.map(|p| p.auth_id),
            org_id: payload.map(|p| p.org_id),
            unit_code: payload.map(|p| p.unit_code.clone()),
            person_name: payload.map(|p| p.person_name.clone()),
            operator,
            scanned_at,
            synced_at: if offline_validated { None } else { Some(scanned_at) },
        }
    }
}

/// Doorman account allowed to use the station API.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Operator {
    pub username: String,
    pub password_hash: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OperatorClaims {
    pub sub: String, // username
    pub exp: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enums_use_wire_names() {
        assert_eq!(serde_json::to_string(&ScanResult::FormatError).unwrap(), "\"FORMAT_ERROR\"");
        assert_eq!(serde_json::to_string(&AccessAction::Entry).unwrap(), "\"ENTRY\"");
        assert_eq!(serde_json::to_string(&SyncStatus::Pending).unwrap(), "\"PENDING\"");
        assert_eq!(ScanResult::Revoked.to_string(), "REVOKED");
    }

    #[test]
    fn test_offline_event_starts_pending() {
        let event = AccessEvent::new(
            AccessAction::Entry,
            ScanResult::Valid,
            None,
            true,
            Some("porter".to_string()),
            Utc::now(),
        );
        assert_eq!(event.sync_status, SyncStatus::Pending);
        assert!(event.synced_at.is_none());
        assert!(event.auth_id.is_none());

        let online = AccessEvent::new(AccessAction::Exit, ScanResult::Valid, None, false, None, Utc::now());
        assert_eq!(online.sync_status, SyncStatus::Synced);
    }
}
