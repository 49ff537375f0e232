//! REST endpoints for status, settings, activity and manual runs.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::{EnvOverrides, KillListEntry, LabelRules, MailConfig};
use crate::llm::{LlmConfig, create_provider};
use crate::pipeline::poller::InboxPoller;
use crate::pipeline::router::HybridRouter;
use crate::store::Database;

/// Default and maximum page size for `/api/activity`.
const DEFAULT_ACTIVITY_LIMIT: usize = 50;
const MAX_ACTIVITY_LIMIT: usize = 500;

/// State shared across handlers.
#[derive(Clone)]
pub struct DashboardState {
    /// Settings as saved in `config.json`, without environment overrides.
    pub config: Arc<RwLock<MailConfig>>,
    /// Applied when rebuilding the router; never saved.
    pub overrides: EnvOverrides,
    /// Where `PUT /api/config` persists settings.
    pub config_path: PathBuf,
    pub poller: Arc<InboxPoller>,
    pub db: Arc<dyn Database>,
    /// Wakes the polling loop for an immediate cycle.
    pub trigger: Arc<Notify>,
}

/// Build the dashboard router.
pub fn dashboard_routes(state: DashboardState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(get_status))
        .route("/api/config", get(get_config).put(put_config))
        .route("/api/activity", get(list_activity))
        .route("/api/run", post(trigger_run))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_json(
    status: StatusCode,
    message: impl std::fmt::Display,
) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message.to_string() })))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "calm-mail"
    }))
}

// ── Status ──────────────────────────────────────────────────────────────

async fn get_status(State(state): State<DashboardState>) -> impl IntoResponse {
    let router = state.poller.router().await;
    let last_cycle = state.poller.last_report().await;

    let processed = match state.db.processed_count().await {
        Ok(n) => n,
        Err(e) => return error_json(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    let last_24h = match state.db.activity_counts(Utc::now() - Duration::hours(24)).await {
        Ok(counts) => counts,
        Err(e) => return error_json(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "running": state.poller.is_running(),
            "ai_enabled": router.ai_enabled(),
            "model": router.model_name(),
            "rules": router.rules().rule_count(),
            "kill_list": router.rules().kill_count(),
            "processed": processed,
            "last_24h": last_24h,
            "last_cycle": last_cycle,
        })),
    )
}

// ── Config ──────────────────────────────────────────────────────────────

/// Settings as shown to the dashboard.
#[derive(Debug, Serialize)]
struct ConfigView<'a> {
    model: &'a str,
    ai_enabled: bool,
    allow_new_labels: bool,
    fixed_labels: &'a [String],
    label_rules: &'a LabelRules,
    blacklist_domains: &'a [String],
    kill_list: &'a [KillListEntry],
    query: &'a str,
    batch_size: u32,
    poll_interval_secs: u64,
}

impl<'a> From<&'a MailConfig> for ConfigView<'a> {
    fn from(config: &'a MailConfig) -> Self {
        Self {
            model: &config.model,
            ai_enabled: config.ai_enabled,
            allow_new_labels: config.allow_new_labels,
            fixed_labels: &config.fixed_labels,
            label_rules: &config.label_rules,
            blacklist_domains: &config.blacklist_domains,
            kill_list: &config.kill_list,
            query: &config.query,
            batch_size: config.batch_size,
            poll_interval_secs: config.poll_interval_secs,
        }
    }
}

/// Editable settings. Omitted fields keep their current value.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigUpdate {
    model: Option<String>,
    ai_enabled: Option<bool>,
    allow_new_labels: Option<bool>,
    fixed_labels: Option<Vec<String>>,
    label_rules: Option<LabelRules>,
    blacklist_domains: Option<Vec<String>>,
    kill_list: Option<Vec<KillListEntry>>,
}

impl ConfigUpdate {
    fn apply(self, config: &mut MailConfig) {
        if let Some(model) = self.model {
            config.model = model.trim().to_string();
        }
        if let Some(enabled) = self.ai_enabled {
            config.ai_enabled = enabled;
        }
        if let Some(allow) = self.allow_new_labels {
            config.allow_new_labels = allow;
        }
        if let Some(labels) = self.fixed_labels {
            config.fixed_labels = labels
                .into_iter()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect();
        }
        if let Some(rules) = self.label_rules {
            config.label_rules = rules;
        }
        if let Some(domains) = self.blacklist_domains {
            config.blacklist_domains = domains;
        }
        if let Some(kill_list) = self.kill_list {
            config.kill_list = kill_list;
        }
        for label in &config.fixed_labels {
            config.label_rules.ensure_label(label);
        }
    }
}

async fn get_config(State(state): State<DashboardState>) -> impl IntoResponse {
    let config = state.config.read().await;
    Json(serde_json::json!(ConfigView::from(&*config)))
}

async fn put_config(
    State(state): State<DashboardState>,
    Json(update): Json<ConfigUpdate>,
) -> impl IntoResponse {
    // Held until the router is swapped so concurrent updates apply in order.
    let mut config = state.config.write().await;
    let mut candidate = config.clone();
    update.apply(&mut candidate);
    let effective = state.overrides.apply(&candidate);

    if let Err(e) = effective.validate() {
        return error_json(StatusCode::BAD_REQUEST, e);
    }

    let llm = if effective.ai_enabled {
        match create_provider(&LlmConfig::from_mail_config(&effective)) {
            Ok(llm) => Some(llm),
            Err(e) => return error_json(StatusCode::BAD_REQUEST, e),
        }
    } else {
        None
    };

    let router = match HybridRouter::from_config(&effective, llm) {
        Ok(router) => router,
        Err(e) => return error_json(StatusCode::BAD_REQUEST, e),
    };

    if let Err(e) = candidate.save(&state.config_path) {
        warn!(error = %e, "Failed to save configuration");
        return error_json(StatusCode::INTERNAL_SERVER_ERROR, e);
    }

    *config = candidate;
    state.poller.swap_router(router).await;
    info!(
        rules = config.label_rules.len(),
        kill_list = config.kill_list_entries().len(),
        ai_enabled = config.ai_enabled,
        "Configuration updated from dashboard"
    );

    (StatusCode::OK, Json(serde_json::json!(ConfigView::from(&*config))))
}

// ── Activity ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ActivityQuery {
    limit: Option<usize>,
}

async fn list_activity(
    State(state): State<DashboardState>,
    Query(query): Query<ActivityQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
        .clamp(1, MAX_ACTIVITY_LIMIT);

    match state.db.recent_activity(limit).await {
        Ok(entries) => (StatusCode::OK, Json(serde_json::json!(entries))),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

// ── Manual run ──────────────────────────────────────────────────────────

async fn trigger_run(State(state): State<DashboardState>) -> impl IntoResponse {
    state.trigger.notify_one();
    info!("Cycle requested from dashboard");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "queued" })),
    )
}
