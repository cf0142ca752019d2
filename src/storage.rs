use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sled::Db;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{AccessEvent, Operator, SyncStatus};

const PRESENT: &[u8] = &[];

/// Local station store. Cheap to clone; all clones share the same Sled trees.
#[derive(Clone)]
pub struct Storage {
    db: Db,
    // Trees:
    // - access_events: scan records awaiting (or done with) backend sync
    // - revocations: authorization ids revoked by the platform, keyed big-endian
    // - operators: doorman accounts for the station API
    event_tree: sled::Tree,
    revocation_tree: sled::Tree,
    operator_tree: sled::Tree,
}

impl Storage {
    /// Open or create the Sled database at the given path
    pub fn open(path: &str) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database removed on drop
    pub fn open_temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self> {
        let event_tree = db.open_tree("access_events")?;
        let revocation_tree = db.open_tree("revocations")?;
        let operator_tree = db.open_tree("operators")?;
        Ok(Self {
            db,
            event_tree,
            revocation_tree,
            operator_tree,
        })
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    // --- Access events ---

    pub fn record_event(&self, event: &AccessEvent) -> Result<()> {
        let json_bytes = serde_json::to_vec(event)?;
        self.event_tree.insert(event.id.as_bytes(), json_bytes)?;
        Ok(())
    }

    pub fn get_event(&self, id: Uuid) -> Result<AccessEvent> {
        match self.event_tree.get(id.as_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(Error::NotFound(format!("access event {id}"))),
        }
    }

    /// Events in scan order, optionally only those with the given status.
    pub fn list_events(&self, status: Option<SyncStatus>) -> Result<Vec<AccessEvent>> {
        let mut events = vec![];
        for item in self.event_tree.iter() {
            let (_, value) = item?;
            let event: AccessEvent = serde_json::from_slice(&value)?;
            if status.map_or(true, |s| event.sync_status == s) {
                events.push(event);
            }
        }
        events.sort_by_key(|e| e.scanned_at);
        Ok(events)
    }

    /// Flip the given events from PENDING to SYNCED. Unknown ids and events
    /// already synced are left alone. Returns how many changed.
    pub fn mark_synced(&self, ids: &[Uuid], synced_at: DateTime<Utc>) -> Result<usize> {
        let mut flipped = 0;
        for id in ids {
            let Some(bytes) = self.event_tree.get(id.as_bytes())? else {
                continue;
            };
            let mut event: AccessEvent = serde_json::from_slice(&bytes)?;
            if event.sync_status != SyncStatus::Pending {
                continue;
            }
            event.sync_status = SyncStatus::Synced;
            event.synced_at = Some(synced_at);
            let updated = serde_json::to_vec(&event)?;
            // skip if another writer touched the record in between
            if self
                .event_tree
                .compare_and_swap(id.as_bytes(), Some(bytes), Some(updated))?
                .is_ok()
            {
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    /// Delete SYNCED events synced before `cutoff`. PENDING events are never
    /// removed. Returns how many were deleted.
    pub fn prune_synced(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut batch = sled::Batch::default();
        let mut pruned = 0;
        for item in self.event_tree.iter() {
            let (key, value) = item?;
            let event: AccessEvent = serde_json::from_slice(&value)?;
            let expired = event.sync_status == SyncStatus::Synced
                && event.synced_at.is_some_and(|at| at < cutoff);
            if expired {
                batch.remove(key);
                pruned += 1;
            }
        }
        self.event_tree.apply_batch(batch)?;
        Ok(pruned)
    }

    // --- Revocations ---

    pub fn revoked_ids(&self) -> Result<HashSet<i64>> {
        let mut ids = HashSet::new();
        for key in self.revocation_tree.iter().keys() {
            let key = key?;
            let bytes: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| Error::Storage(sled::Error::Unsupported("malformed revocation key".to_string())))?;
            ids.insert(i64::from_be_bytes(bytes));
        }
        Ok(ids)
    }

    pub fn add_revocation(&self, auth_id: i64) -> Result<()> {
        self.revocation_tree.insert(auth_id.to_be_bytes(), PRESENT)?;
        Ok(())
    }

    /// Replace the whole cached revocation list.
    pub fn replace_revocations(&self, ids: &[i64]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for key in self.revocation_tree.iter().keys() {
            batch.remove(key?);
        }
        for id in ids {
            batch.insert(id.to_be_bytes().to_vec(), PRESENT);
        }
        self.revocation_tree.apply_batch(batch)?;
        Ok(())
    }

    // --- Operators ---

    pub fn create_operator(&self, operator: Operator) -> Result<()> {
        let json_bytes = serde_json::to_vec(&operator)?;
        let outcome = self.operator_tree.compare_and_swap(
            operator.username.as_bytes(),
            None as Option<&[u8]>,
            Some(json_bytes),
        )?;
        outcome.map_err(|_| Error::Conflict(format!("operator {}", operator.username)))
    }

    pub fn get_operator(&self, username: &str) -> Result<Option<Operator>> {
        match self.operator_tree.get(username.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}
