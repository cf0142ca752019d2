//! Scan-to-validate-to-sync workflow of a gate station.
//!
//! A scan is validated online when the platform is reachable and offline
//! otherwise. Offline verdicts are recorded as PENDING events and uploaded by
//! [`EntryService::sync_pending`] once the backend is back.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::backend::AuthorizationBackend;
use crate::error::{Error, Result};
use crate::models::{AccessAction, AccessEvent, ParsedQr, ScanResult, SyncStatus};
use crate::qr;
use crate::storage::Storage;
use crate::verify::{classify, KeyRing, ValidationContext};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub acknowledged: usize,
}

#[derive(Clone)]
pub struct EntryService {
    storage: Storage,
    keys: Arc<KeyRing>,
    backend: Option<Arc<dyn AuthorizationBackend>>,
    max_clock_skew_minutes: i64,
    event_retention: Duration,
}

impl EntryService {
    pub fn new(storage: Storage, keys: KeyRing, max_clock_skew_minutes: i64) -> Self {
        Self {
            storage,
            keys: Arc::new(keys),
            backend: None,
            max_clock_skew_minutes,
            event_retention: Duration::days(30),
        }
    }

    /// How long SYNCED events are kept after their sync.
    pub fn with_event_retention(mut self, retention: Duration) -> Self {
        self.event_retention = retention;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn AuthorizationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Decode and classify with local data only.
    pub fn validate_offline(
        &self,
        raw: &str,
        now: DateTime<Utc>,
    ) -> Result<(Option<ParsedQr>, ScanResult)> {
        let parsed = qr::parse(raw).ok();
        let revoked = self.storage.revoked_ids()?;
        let ctx = ValidationContext::new(now, self.max_clock_skew_minutes, &revoked, &self.keys);
        let result = classify(parsed.as_ref(), &ctx);
        Ok((parsed, result))
    }

    /// Validate a scanned code and persist the resulting event.
    #[instrument(skip(self, raw))]
    pub async fn scan(
        &self,
        raw: &str,
        action: AccessAction,
        operator: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<AccessEvent> {
        if let Some(backend) = &self.backend {
            match backend.validate(raw, action).await {
                Ok(result) => {
                    let parsed = qr::parse(raw).ok();
                    let event = AccessEvent::new(
                        action,
                        result,
                        parsed.as_ref().map(|p| &p.payload),
                        false,
                        operator,
                        now,
                    );
                    self.storage.record_event(&event)?;
                    info!(event_id = %event.id, result = %event.scan_result, "validated online");
                    return Ok(event);
                }
                Err(e) => warn!(error = %e, "online validation failed, falling back to offline"),
            }
        }

        let (parsed, result) = self.validate_offline(raw, now)?;
        let event = AccessEvent::new(
            action,
            result,
            parsed.as_ref().map(|p| &p.payload),
            true,
            operator,
            now,
        );
        self.storage.record_event(&event)?;
        info!(event_id = %event.id, result = %event.scan_result, "validated offline");
        Ok(event)
    }

    /// Upload PENDING events and mark the acknowledged ones SYNCED. SYNCED
    /// events past the retention period are pruned first.
    #[instrument(skip(self))]
    pub async fn sync_pending(&self, now: DateTime<Utc>) -> Result<SyncReport> {
        let backend = self.backend.as_ref().ok_or(Error::BackendUnavailable)?;
        if let Some(cutoff) = now.checked_sub_signed(self.event_retention) {
            let pruned = self.storage.prune_synced(cutoff)?;
            if pruned > 0 {
                info!(pruned, "pruned synced access events");
            }
        }
        let pending = self.storage.list_events(Some(SyncStatus::Pending))?;
        if pending.is_empty() {
            return Ok(SyncReport { pushed: 0, acknowledged: 0 });
        }

        let acknowledged = backend.push_events(&pending).await?;
        let flipped = self.storage.mark_synced(&acknowledged, now)?;
        if flipped < pending.len() {
            warn!(pending = pending.len(), acknowledged = flipped, "backend left events unacknowledged");
        }
        info!(pushed = pending.len(), acknowledged = flipped, "synced access events");
        Ok(SyncReport {
            pushed: pending.len(),
            acknowledged: flipped,
        })
    }

    /// Replace the cached revocation list with the backend's.
    pub async fn refresh_revocations(&self) -> Result<usize> {
        let backend = self.backend.as_ref().ok_or(Error::BackendUnavailable)?;
        let ids = backend.fetch_revocations().await?;
        self.storage.replace_revocations(&ids)?;
        info!(count = ids.len(), "revocation list refreshed");
        Ok(ids.len())
    }
}
