//! Inbox poller. One cycle lists, routes, batch-applies and records.
//!
//! Messages are processed sequentially. Per-message failures are logged and
//! counted; only a failed `messages.list` (or ledger read) aborts a cycle.
//!
//! The routing decision for every message is written twice: once to the
//! `activity` tracing target (picked up by the rolling activity log when
//! enabled) and once to the `activity_log` table for the dashboard.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MailConfig;
use crate::error::PipelineError;
use crate::gmail::{GmailApi, LabelManager};
use crate::pipeline::executor::{ActionExecutor, BatchPlan};
use crate::pipeline::router::HybridRouter;
use crate::pipeline::types::{Action, ClassificationResult, EmailMessage};
use crate::store::{ActivityEntry, ActivityStatus, Database, ProcessedRecord};

/// Settings key holding the JSON of the last [`CycleReport`].
pub const LAST_CYCLE_KEY: &str = "last_cycle_report";

/// Activity entries, and ledger rows of messages moved out of the inbox,
/// older than this are pruned after each cycle.
const RETENTION_DAYS: u32 = 30;

/// `messages.list` fetches this many times `batch_size`, so messages kept in
/// the inbox by a final decision do not starve newer ones.
const LIST_WINDOW_FACTOR: u32 = 5;

/// Gmail's `maxResults` ceiling for one listing.
const LIST_WINDOW_MAX: u32 = 500;

/// Tally of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Message refs returned by the inbox query.
    pub fetched: usize,
    pub labeled: usize,
    pub deleted: usize,
    /// Final decision to leave the message in the inbox.
    pub ignored: usize,
    /// No decision this cycle (LLM unavailable or AI mode off).
    pub deferred: usize,
    /// Already in the ledger or already carrying the routed label.
    pub skipped: usize,
    pub failed: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Query and batch limits for a poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerSettings {
    pub query: String,
    pub batch_size: u32,
}

impl PollerSettings {
    pub fn from_config(config: &MailConfig) -> Self {
        Self {
            query: config.query.clone(),
            batch_size: config.batch_size,
        }
    }

    fn list_window(&self) -> u32 {
        self.batch_size
            .max(1)
            .saturating_mul(LIST_WINDOW_FACTOR)
            .min(LIST_WINDOW_MAX)
    }
}

/// A decision that waits on the batch plan.
struct Planned {
    message: EmailMessage,
    result: ClassificationResult,
}

pub struct InboxPoller {
    gmail: Arc<dyn GmailApi>,
    labels: LabelManager,
    executor: ActionExecutor,
    router: RwLock<Arc<HybridRouter>>,
    db: Arc<dyn Database>,
    settings: PollerSettings,
    cycle_lock: Mutex<()>,
    running: AtomicBool,
    last_report: Mutex<Option<CycleReport>>,
}

impl InboxPoller {
    pub fn new(
        gmail: Arc<dyn GmailApi>,
        router: HybridRouter,
        db: Arc<dyn Database>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            labels: LabelManager::new(Arc::clone(&gmail)),
            executor: ActionExecutor::new(Arc::clone(&gmail)),
            gmail,
            router: RwLock::new(Arc::new(router)),
            db,
            settings,
            cycle_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            last_report: Mutex::new(None),
        }
    }

    /// Replace the router. A cycle in progress keeps the router it started with.
    pub async fn swap_router(&self, router: HybridRouter) {
        *self.router.write().await = Arc::new(router);
        info!("Router updated");
    }

    pub async fn router(&self) -> Arc<HybridRouter> {
        Arc::clone(&*self.router.read().await)
    }

    /// Whether a cycle is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Last completed cycle, falling back to the persisted copy after a restart.
    pub async fn last_report(&self) -> Option<CycleReport> {
        if let Some(report) = self.last_report.lock().await.clone() {
            return Some(report);
        }
        match self.db.get_setting(LAST_CYCLE_KEY).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read last cycle report");
                None
            }
        }
    }

    /// Run one cycle. Cycles never overlap; a second caller waits.
    pub async fn run_cycle(&self) -> Result<CycleReport, PipelineError> {
        let _guard = self.cycle_lock.lock().await;
        self.running.store(true, Ordering::Relaxed);
        let result = self.cycle().await;
        self.running.store(false, Ordering::Relaxed);

        let report = result?;
        self.persist_report(&report).await;

        match self.db.prune_activity(RETENTION_DAYS).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Old activity pruned"),
            Err(e) => warn!(error = %e, "Activity prune failed"),
        }
        match self.db.prune_processed(RETENTION_DAYS).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Old ledger rows pruned"),
            Err(e) => warn!(error = %e, "Ledger prune failed"),
        }
        Ok(report)
    }

    async fn cycle(&self) -> Result<CycleReport, PipelineError> {
        let router = self.router().await;
        let mut report = CycleReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let refs = self
            .gmail
            .list_messages(&self.settings.query, self.settings.list_window())
            .await
            .map_err(PipelineError::Fetch)?;
        report.fetched = refs.len();
        debug!(count = refs.len(), query = %self.settings.query, "Inbox listed");
        self.labels.invalidate().await;

        let mut plan = BatchPlan::new();
        let mut planned: Vec<Planned> = Vec::new();
        // Only decided messages count toward `batch_size`.
        let mut handled: u32 = 0;

        for message_ref in refs {
            if handled >= self.settings.batch_size {
                break;
            }

            if self.db.is_processed(&message_ref.id).await? {
                report.skipped += 1;
                continue;
            }

            let message = match self.gmail.get_message_metadata(&message_ref.id).await {
                Ok(message) => message,
                Err(source) => {
                    let err = PipelineError::Message {
                        id: message_ref.id.clone(),
                        source,
                    };
                    warn!("{err}");
                    handled += 1;
                    report.failed += 1;
                    continue;
                }
            };

            let result = router.route(&message).await;
            if result.is_final() {
                handled += 1;
            }

            match &result.action {
                Action::Delete => {
                    plan.add_trash(&message.id);
                    planned.push(Planned { message, result });
                }
                Action::Label { name } => {
                    let Some(label_id) = self.labels.get_or_create(name).await else {
                        let failed = with_reason(&result, "label could not be resolved");
                        self.record(&message, &failed, ActivityStatus::Failed).await;
                        report.failed += 1;
                        continue;
                    };
                    if message.has_label(&label_id) {
                        debug!(id = %message.id, label = %name, "Already labeled, skipping");
                        self.mark_processed(&message.id, &result).await;
                        report.skipped += 1;
                        continue;
                    }
                    if plan.add_move(&label_id, name, &message.id) {
                        planned.push(Planned { message, result });
                    } else {
                        self.record(&message, &result, ActivityStatus::Ignored).await;
                        self.mark_processed(&message.id, &result).await;
                        report.ignored += 1;
                    }
                }
                Action::Ignore if result.is_final() => {
                    self.record(&message, &result, ActivityStatus::Ignored).await;
                    self.mark_processed(&message.id, &result).await;
                    report.ignored += 1;
                }
                Action::Ignore => {
                    report.deferred += 1;
                    if self.already_deferred(&message.id).await {
                        debug!(id = %message.id, "Still deferred");
                        continue;
                    }
                    self.record(&message, &result, ActivityStatus::Deferred).await;
                }
            }
        }

        if !plan.is_empty() {
            let outcome = self.executor.execute(&plan).await;
            for Planned { message, result } in planned {
                if let Some(err) = outcome.failure(&message.id) {
                    let failed = with_reason(&result, err);
                    self.record(&message, &failed, ActivityStatus::Failed).await;
                    report.failed += 1;
                    continue;
                }
                self.record(&message, &result, ActivityStatus::Applied).await;
                self.mark_processed(&message.id, &result).await;
                match result.action {
                    Action::Delete => report.deleted += 1,
                    _ => report.labeled += 1,
                }
            }
        }

        report.finished_at = Some(Utc::now());
        info!(
            fetched = report.fetched,
            labeled = report.labeled,
            deleted = report.deleted,
            ignored = report.ignored,
            deferred = report.deferred,
            skipped = report.skipped,
            failed = report.failed,
            "Cycle complete"
        );
        Ok(report)
    }

    async fn record(
        &self,
        message: &EmailMessage,
        result: &ClassificationResult,
        status: ActivityStatus,
    ) {
        info!(
            target: "activity",
            id = %message.id,
            sender = %message.sender,
            subject = %message.subject,
            action = result.action.kind(),
            label = result.action.label_name().unwrap_or("-"),
            source = result.source.as_str(),
            status = status.as_str(),
            "{}",
            result.reason
        );
        let entry = ActivityEntry::new(message, result, status);
        if let Err(e) = self.db.record_activity(&entry).await {
            warn!(id = %message.id, error = %e, "Failed to record activity");
        }
    }

    /// Whether the newest activity row for the message is already a deferral.
    async fn already_deferred(&self, message_id: &str) -> bool {
        match self.db.latest_status(message_id).await {
            Ok(status) => status == Some(ActivityStatus::Deferred),
            Err(e) => {
                warn!(id = %message_id, error = %e, "Failed to read activity status");
                false
            }
        }
    }

    async fn mark_processed(&self, message_id: &str, result: &ClassificationResult) {
        if let Err(e) = self
            .db
            .mark_processed(&ProcessedRecord::new(message_id, result))
            .await
        {
            warn!(id = %message_id, error = %e, "Failed to mark message processed");
        }
    }

    async fn persist_report(&self, report: &CycleReport) {
        *self.last_report.lock().await = Some(report.clone());
        match serde_json::to_string(report) {
            Ok(json) => {
                if let Err(e) = self.db.set_setting(LAST_CYCLE_KEY, &json).await {
                    warn!(error = %e, "Failed to persist cycle report");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize cycle report"),
        }
    }
}

fn with_reason(result: &ClassificationResult, detail: &str) -> ClassificationResult {
    ClassificationResult {
        reason: format!("{} ({detail})", result.reason),
        ..result.clone()
    }
}

/// Spawn the polling loop.
///
/// Runs a cycle immediately, then every `interval` or whenever `trigger` is
/// notified. Returns a `JoinHandle` and a shutdown flag; set the flag and
/// notify the trigger to stop promptly.
pub fn spawn_poller(
    poller: Arc<InboxPoller>,
    interval: Duration,
    trigger: Arc<Notify>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Inbox poller started, polling every {}s", interval.as_secs());

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = trigger.notified() => {
                    debug!("Cycle triggered on demand");
                }
            }

            if shutdown.load(Ordering::Relaxed) {
                info!("Inbox poller shutting down");
                return;
            }

            if let Err(e) = poller.run_cycle().await {
                error!("Cycle failed: {e}");
            }
        }
    });

    (handle, shutdown_flag)
}
