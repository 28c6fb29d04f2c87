use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::construct::{Changeset, DataOrigin, LayerId, TimeThreshold};
use crate::error::Result;
use crate::persist::TemporalStore;

/// Hands out one changeset per (layer, origin) for the lifetime of a logical
/// write. Nothing is persisted until a changeset is first requested.
pub struct ChangesetProxy {
    user: String,
    time: TimeThreshold,
    timestamp: DateTime<Utc>,
    origin: DataOrigin,
    store: Arc<dyn TemporalStore>,
    changesets: Mutex<HashMap<(LayerId, DataOrigin), Changeset>>,
}

impl ChangesetProxy {
    pub fn new(
        user: impl Into<String>,
        time: TimeThreshold,
        origin: DataOrigin,
        store: Arc<dyn TemporalStore>,
    ) -> Self {
        Self {
            user: user.into(),
            time,
            timestamp: time.resolve(),
            origin,
            store,
            changesets: Mutex::new(HashMap::new()),
        }
    }
    pub fn user(&self) -> &str {
        &self.user
    }
    pub fn time(&self) -> TimeThreshold {
        self.time
    }
    /// The instant every record written through this proxy is stamped with.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    pub fn origin(&self) -> DataOrigin {
        self.origin
    }

    pub async fn get_changeset(&self, layer: &str) -> Result<Changeset> {
        self.get_changeset_for(layer, self.origin).await
    }

    pub async fn get_changeset_for(&self, layer: &str, origin: DataOrigin) -> Result<Changeset> {
        let key = (layer.to_owned(), origin);
        // held across the store write so concurrent callers share one allocation
        let mut changesets = self.changesets.lock().await;
        if let Some(existing) = changesets.get(&key) {
            return Ok(existing.clone());
        }
        let changeset = Changeset {
            id: Uuid::new_v4(),
            user: self.user.clone(),
            layer: layer.to_owned(),
            origin,
            timestamp: self.timestamp,
        };
        self.store.create_changeset(&changeset).await?;
        info!(
            changeset = %changeset.id,
            layer = %changeset.layer,
            user = %changeset.user,
            "created changeset"
        );
        changesets.insert(key, changeset.clone());
        Ok(changeset)
    }

    /// Changesets allocated so far.
    pub async fn allocated(&self) -> Vec<Changeset> {
        self.changesets.lock().await.values().cloned().collect()
    }
}
