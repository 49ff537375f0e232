//! Label name to ID resolution with on-demand creation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::GmailError;
use crate::gmail::client::GmailApi;

/// Gmail system labels. Their IDs are their uppercase names.
pub const SYSTEM_LABELS: [&str; 6] = ["INBOX", "SPAM", "TRASH", "UNREAD", "STARRED", "IMPORTANT"];

/// If `name` is a system label, its ID.
pub fn system_label_id(name: &str) -> Option<&'static str> {
    let upper = name.trim().to_uppercase();
    SYSTEM_LABELS.iter().copied().find(|l| *l == upper)
}

#[derive(Default)]
struct LabelCache {
    loaded: bool,
    /// Lowercased name to label ID.
    by_name: HashMap<String, String>,
}

/// Caches `lower(name) -> id` so each cycle makes at most one
/// `labels.list` call plus one `labels.create` per new label. The poller
/// invalidates it at the start of every cycle.
pub struct LabelManager {
    gmail: Arc<dyn GmailApi>,
    cache: Mutex<LabelCache>,
}

impl LabelManager {
    pub fn new(gmail: Arc<dyn GmailApi>) -> Self {
        Self {
            gmail,
            cache: Mutex::new(LabelCache::default()),
        }
    }

    /// Reload every label from Gmail.
    pub async fn refresh(&self) -> Result<usize, GmailError> {
        let labels = self.gmail.list_labels().await?;
        let mut cache = self.cache.lock().await;
        cache.by_name = labels
            .into_iter()
            .map(|l| (l.name.to_lowercase(), l.id))
            .collect();
        cache.loaded = true;
        debug!(count = cache.by_name.len(), "Label cache refreshed");
        Ok(cache.by_name.len())
    }

    /// Drop the cache; the next lookup reloads it from Gmail. Labels deleted
    /// or recreated in Gmail since the last load otherwise keep stale IDs.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.lock().await;
        cache.loaded = false;
        cache.by_name.clear();
    }

    /// Cached ID for `name` without creating anything.
    pub async fn lookup(&self, name: &str) -> Option<String> {
        if let Some(id) = system_label_id(name) {
            return Some(id.to_string());
        }
        self.ensure_loaded().await;
        let cache = self.cache.lock().await;
        cache.by_name.get(&name.trim().to_lowercase()).cloned()
    }

    /// ID for `name`, creating the label if it does not exist.
    ///
    /// Returns `None` when the label can be neither found nor created; the
    /// caller skips the message and retries it next cycle.
    pub async fn get_or_create(&self, name: &str) -> Option<String> {
        let clean = name.trim();
        if clean.is_empty() {
            return None;
        }
        if let Some(id) = self.lookup(clean).await {
            return Some(id);
        }

        info!(label = %clean, "Creating new label");
        match self.gmail.create_label(clean).await {
            Ok(label) => {
                self.cache
                    .lock()
                    .await
                    .by_name
                    .insert(clean.to_lowercase(), label.id.clone());
                Some(label.id)
            }
            Err(GmailError::Conflict(_)) => {
                // Created elsewhere since the last refresh.
                debug!(label = %clean, "Label already exists, refreshing cache");
                if let Err(e) = self.refresh().await {
                    warn!(label = %clean, error = %e, "Label refresh after conflict failed");
                    return None;
                }
                self.cache
                    .lock()
                    .await
                    .by_name
                    .get(&clean.to_lowercase())
                    .cloned()
            }
            Err(e) => {
                warn!(label = %clean, error = %e, "Failed to create label");
                None
            }
        }
    }

    async fn ensure_loaded(&self) {
        if self.cache.lock().await.loaded {
            return;
        }
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "Failed to fetch labels");
        }
    }
}
