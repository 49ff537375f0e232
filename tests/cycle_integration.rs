//! End-to-end cycle tests against fake Gmail and Ollama servers.
//!
//! Both fakes are axum apps on random localhost ports; the real
//! `GmailClient` and `OllamaProvider` talk to them over HTTP.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use calm_mail::config::MailConfig;
use calm_mail::gmail::{GmailClient, StaticToken};
use calm_mail::llm::{LlmConfig, create_provider};
use calm_mail::pipeline::poller::{InboxPoller, PollerSettings};
use calm_mail::pipeline::router::HybridRouter;
use calm_mail::store::{ActivityStatus, Database, LibSqlBackend};

// ── Fake Gmail ──────────────────────────────────────────────────────────

struct FakeMessage {
    id: String,
    from: String,
    subject: String,
    labels: Vec<String>,
}

struct Mailbox {
    messages: Vec<FakeMessage>,
    /// (id, name, type)
    labels: Vec<(String, String, String)>,
    batch_calls: usize,
    next_label: usize,
}

type SharedMailbox = Arc<Mutex<Mailbox>>;

impl Mailbox {
    fn new() -> Self {
        let labels = ["INBOX", "SPAM", "TRASH", "UNREAD", "IMPORTANT", "STARRED"]
            .into_iter()
            .map(|id| (id.to_string(), id.to_string(), "system".to_string()))
            .collect();
        Self {
            messages: Vec::new(),
            labels,
            batch_calls: 0,
            next_label: 0,
        }
    }

    fn deliver(&mut self, id: &str, from: &str, subject: &str) {
        self.messages.push(FakeMessage {
            id: id.to_string(),
            from: from.to_string(),
            subject: subject.to_string(),
            labels: vec!["INBOX".into(), "UNREAD".into()],
        });
    }

    fn labels_of(&self, id: &str) -> Vec<String> {
        self.messages
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.labels.clone())
            .unwrap_or_default()
    }

    fn label_named(&self, name: &str) -> Option<String> {
        self.labels
            .iter()
            .find(|(_, n, _)| n.eq_ignore_ascii_case(name))
            .map(|(id, _, _)| id.clone())
    }
}

async fn list_messages(
    State(mailbox): State<SharedMailbox>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<Value> {
    let max: usize = q
        .get("maxResults")
        .and_then(|v| v.parse().ok())
        .unwrap_or(100);
    let mailbox = mailbox.lock().unwrap();
    let refs: Vec<Value> = mailbox
        .messages
        .iter()
        .filter(|m| m.labels.iter().any(|l| l == "INBOX"))
        .take(max)
        .map(|m| json!({"id": m.id, "threadId": format!("t-{}", m.id)}))
        .collect();
    Json(json!({"messages": refs, "resultSizeEstimate": refs.len()}))
}

async fn get_message(State(mailbox): State<SharedMailbox>, Path(id): Path<String>) -> Response {
    let mailbox = mailbox.lock().unwrap();
    match mailbox.messages.iter().find(|m| m.id == id) {
        Some(m) => Json(json!({
            "id": m.id,
            "threadId": format!("t-{}", m.id),
            "labelIds": m.labels,
            "snippet": "Your statement is ready &amp; waiting",
            "internalDate": "1700000000000",
            "payload": {"headers": [
                {"name": "From", "value": m.from},
                {"name": "Subject", "value": m.subject}
            ]}
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"code": 404, "message": "Requested entity was not found."}})),
        )
            .into_response(),
    }
}

async fn list_labels(State(mailbox): State<SharedMailbox>) -> Json<Value> {
    let mailbox = mailbox.lock().unwrap();
    let labels: Vec<Value> = mailbox
        .labels
        .iter()
        .map(|(id, name, kind)| json!({"id": id, "name": name, "type": kind}))
        .collect();
    Json(json!({"labels": labels}))
}

async fn create_label(State(mailbox): State<SharedMailbox>, Json(body): Json<Value>) -> Response {
    let name = body["name"].as_str().unwrap_or_default().to_string();
    let mut mailbox = mailbox.lock().unwrap();
    if mailbox.label_named(&name).is_some() {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": {"code": 409, "message": "Label name exists or conflicts"}})),
        )
            .into_response();
    }
    mailbox.next_label += 1;
    let id = format!("Label_{}", mailbox.next_label);
    mailbox.labels.push((id.clone(), name.clone(), "user".into()));
    Json(json!({"id": id, "name": name, "type": "user"})).into_response()
}

async fn batch_modify(State(mailbox): State<SharedMailbox>, Json(body): Json<Value>) -> StatusCode {
    let strings = |key: &str| -> Vec<String> {
        body[key]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default()
    };
    let (ids, add, remove) = (strings("ids"), strings("addLabelIds"), strings("removeLabelIds"));

    let mut mailbox = mailbox.lock().unwrap();
    mailbox.batch_calls += 1;
    for message in mailbox.messages.iter_mut().filter(|m| ids.contains(&m.id)) {
        message.labels.retain(|l| !remove.contains(l));
        for label in &add {
            if !message.labels.contains(label) {
                message.labels.push(label.clone());
            }
        }
    }
    StatusCode::NO_CONTENT
}

fn fake_gmail(mailbox: SharedMailbox) -> Router {
    Router::new()
        .route("/users/me/messages", get(list_messages))
        .route("/users/me/messages/batchModify", post(batch_modify))
        .route("/users/me/messages/{id}", get(get_message))
        .route("/users/me/labels", get(list_labels).post(create_label))
        .with_state(mailbox)
}

// ── Fake Ollama ─────────────────────────────────────────────────────────

/// Answers `Finance` for anything mentioning power.com, `INBOX` otherwise.
fn fake_ollama(calls: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route(
            "/api/chat",
            post(
                |State(calls): State<Arc<AtomicUsize>>, Json(body): Json<Value>| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let prompt = body["messages"]
                        .as_array()
                        .and_then(|m| m.last())
                        .and_then(|m| m["content"].as_str())
                        .unwrap_or_default()
                        .to_string();
                    let category = if prompt.contains("power.com") {
                        "Finance"
                    } else {
                        "INBOX"
                    };
                    let content = json!({"reasoning": "fake", "category": category}).to_string();
                    Json(json!({
                        "model": body["model"],
                        "message": {"role": "assistant", "content": content},
                        "done": true,
                        "done_reason": "stop",
                        "prompt_eval_count": 20,
                        "eval_count": 8
                    }))
                },
            ),
        )
        .route(
            "/api/tags",
            get(|| async { Json(json!({"models": [{"name": "qwen3:8b"}]})) }),
        )
        .with_state(calls)
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// A URL with nothing listening.
fn dead_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

// ── Harness ─────────────────────────────────────────────────────────────

fn config(ollama_url: &str) -> MailConfig {
    let mut config = MailConfig {
        ollama_url: ollama_url.to_string(),
        ..Default::default()
    };
    config.label_rules.set("Family", vec!["mom@family.net".into()]);
    config
}

fn router_for(config: &MailConfig) -> HybridRouter {
    let llm = create_provider(&LlmConfig::from_mail_config(config)).unwrap();
    HybridRouter::from_config(config, Some(llm)).unwrap()
}

async fn start_poller(
    mailbox: &SharedMailbox,
    config: &MailConfig,
) -> (InboxPoller, Arc<LibSqlBackend>) {
    let gmail_url = serve(fake_gmail(Arc::clone(mailbox))).await;
    let gmail =
        GmailClient::with_base_url(Arc::new(StaticToken::new("test-token")), gmail_url).unwrap();
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let poller = InboxPoller::new(
        Arc::new(gmail),
        router_for(config),
        db.clone(),
        PollerSettings::from_config(config),
    );
    (poller, db)
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn cycle_routes_rules_kill_list_and_llm() {
    let mailbox: SharedMailbox = Arc::new(Mutex::new(Mailbox::new()));
    {
        let mut mb = mailbox.lock().unwrap();
        mb.deliver("m1", "Mom <mom@family.net>", "Dinner Sunday?");
        mb.deliver("m2", "Quora Digest <digest@quora.com>", "Top stories");
        mb.deliver("m3", "Power Co <billing@power.com>", "Your bill");
        mb.deliver("m4", "Pal <friend@pals.org>", "Catch up");
    }
    let llm_calls = Arc::new(AtomicUsize::new(0));
    let ollama_url = serve(fake_ollama(llm_calls.clone())).await;
    let (poller, db) = start_poller(&mailbox, &config(&ollama_url)).await;

    let report = poller.run_cycle().await.unwrap();
    assert_eq!(report.fetched, 4);
    assert_eq!(report.labeled, 2);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.ignored, 1);
    assert_eq!(report.failed, 0);
    // Only the two messages no rule or kill entry matched reach the LLM.
    assert_eq!(llm_calls.load(Ordering::SeqCst), 2);

    {
        let mb = mailbox.lock().unwrap();
        let family = mb.label_named("Family").unwrap();
        let finance = mb.label_named("Finance").unwrap();

        let m1 = mb.labels_of("m1");
        assert!(m1.contains(&family));
        assert!(!m1.contains(&"INBOX".to_string()));

        let m2 = mb.labels_of("m2");
        assert!(m2.contains(&"TRASH".to_string()));
        assert!(!m2.contains(&"UNREAD".to_string()));

        assert!(mb.labels_of("m3").contains(&finance));
        assert!(mb.labels_of("m4").contains(&"INBOX".to_string()));
    }

    let activity = db.recent_activity(10).await.unwrap();
    assert_eq!(activity.len(), 4);
    let m3 = activity.iter().find(|a| a.message_id == "m3").unwrap();
    assert_eq!(m3.label.as_deref(), Some("Finance"));
    assert_eq!(m3.sender, "billing@power.com");
    assert_eq!(m3.status, ActivityStatus::Applied);

    // Second pass: nothing new to do.
    let batches = mailbox.lock().unwrap().batch_calls;
    let report = poller.run_cycle().await.unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.labeled + report.deleted + report.ignored, 0);
    assert_eq!(mailbox.lock().unwrap().batch_calls, batches);
    assert_eq!(llm_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn llm_outage_leaves_messages_for_next_cycle() {
    let mailbox: SharedMailbox = Arc::new(Mutex::new(Mailbox::new()));
    {
        let mut mb = mailbox.lock().unwrap();
        mb.deliver("m1", "billing@power.com", "Your bill");
        mb.deliver("m2", "mom@family.net", "Hi");
    }
    let (poller, db) = start_poller(&mailbox, &config(&dead_url())).await;

    let report = poller.run_cycle().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.labeled, 1);
    assert!(!db.is_processed("m1").await.unwrap());
    assert!(mailbox.lock().unwrap().labels_of("m1").contains(&"INBOX".to_string()));

    // Endpoint comes back; the dashboard would swap in a fresh router.
    let llm_calls = Arc::new(AtomicUsize::new(0));
    let ollama_url = serve(fake_ollama(llm_calls.clone())).await;
    poller.swap_router(router_for(&config(&ollama_url))).await;

    let report = poller.run_cycle().await.unwrap();
    assert_eq!(report.labeled, 1);
    assert_eq!(llm_calls.load(Ordering::SeqCst), 1);
    assert!(db.is_processed("m1").await.unwrap());

    let mb = mailbox.lock().unwrap();
    let finance = mb.label_named("Finance").unwrap();
    assert!(mb.labels_of("m1").contains(&finance));
}

#[tokio::test]
async fn existing_user_label_is_reused() {
    let mailbox: SharedMailbox = Arc::new(Mutex::new(Mailbox::new()));
    {
        let mut mb = mailbox.lock().unwrap();
        mb.labels
            .push(("Label_42".into(), "family".into(), "user".into()));
        mb.deliver("m1", "mom@family.net", "Hi");
    }
    let (poller, _db) = start_poller(&mailbox, &config(&dead_url())).await;

    let report = poller.run_cycle().await.unwrap();
    assert_eq!(report.labeled, 1);

    let mb = mailbox.lock().unwrap();
    assert_eq!(mb.next_label, 0, "no label should be created");
    assert!(mb.labels_of("m1").contains(&"Label_42".to_string()));
}
