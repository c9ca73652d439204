//! Background recording of API key usage.
//!
//! Validation never waits on the `last_used_at` write. Events go through a
//! bounded channel to a single worker task; a full channel or a failed write
//! is logged and dropped.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::db::Db;
use crate::types::ApiKeyId;

/// Default number of pending usage events before new ones are dropped.
pub const DEFAULT_USAGE_QUEUE: usize = 1024;

/// Handle for submitting usage events. Cheap to clone.
#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::Sender<ApiKeyId>,
}

impl UsageRecorder {
    /// Spawn the worker task and return a handle to it.
    ///
    /// The worker exits once every handle has been dropped.
    pub fn spawn(db: Db, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<ApiKeyId>(capacity);

        tokio::spawn(async move {
            while let Some(key_id) = rx.recv().await {
                if let Err(e) = touch_api_key(&db, &key_id).await {
                    warn!(key_id = %key_id, error = %e, "Failed to record API key usage");
                }
            }
            debug!("Usage recorder stopped");
        });

        Self { tx }
    }

    /// Queue a usage event. Never blocks and never fails the caller.
    pub fn record(&self, key_id: ApiKeyId) {
        if let Err(e) = self.tx.try_send(key_id) {
            warn!(error = %e, "Dropping API key usage event");
        }
    }
}

async fn touch_api_key(db: &Db, key_id: &ApiKeyId) -> surrealdb::Result<()> {
    db.query("UPDATE api_key SET last_used_at = time::now() WHERE key_id = $key_id")
        .bind(("key_id", key_id.clone()))
        .await?
        .check()?;
    Ok(())
}
