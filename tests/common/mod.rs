//! Shared fixtures: a temporary store, an in-memory mailbox and a scripted NLU service.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mailfacts::config::AppConfig;
use mailfacts::gmail::{GmailMessage, HistoryPage, MailProvider, ProviderError, TokenGrant};
use mailfacts::models::{FilterType, NewFact, NewMessage, Operator, QueryBuilder, StoredMessage};
use mailfacts::schema::messages;
use mailfacts::nlu::{CompletionRequest, NluError, NluService};
use mailfacts::{Database, Pipeline};
use serde_json::Value;
use tempfile::TempDir;

pub const VAULT_KEY: &str = "0123456789abcdef0123456789abcdef";

pub fn test_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.vault.key = VAULT_KEY.to_string();
    config.database.path = dir.path().join("mailfacts.db").to_string_lossy().into_owned();
    config.sync.fetch_batch_size = 2;
    config
}

/// Store plus pipeline sharing one SQLite file
pub fn pipeline(dir: &TempDir, provider: Arc<FakeProvider>, nlu: Arc<FakeNlu>) -> (Database, Pipeline) {
    let config = test_config(dir);
    let db = Database::new(&config.database).expect("open store");
    let pipeline = Pipeline::new(db.clone(), provider, nlu, config).expect("build pipeline");
    (db, pipeline)
}

pub fn register(pipeline: &Pipeline, user_id: &str) {
    pipeline
        .register_user(user_id, "access-token", "refresh-token", Some(Utc::now() + Duration::hours(1)))
        .expect("register user");
}

pub fn gmail_message(id: &str, history_id: u64, subject: &str) -> GmailMessage {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "threadId": format!("thread-{id}"),
        "historyId": history_id.to_string(),
        "internalDate": "1772000000000",
        "snippet": subject,
        "labelIds": ["INBOX"],
        "sizeEstimate": 1024,
        "payload": {
            "mimeType": "text/plain",
            "headers": [
                {"name": "From", "value": "Shop <orders@shop.example>"},
                {"name": "To", "value": "me@example.com"},
                {"name": "Subject", "value": subject}
            ],
            "body": {"data": "VGhhbmtzIGZvciB5b3VyIG9yZGVy", "size": 21}
        }
    }))
    .expect("valid message fixture")
}

pub fn new_message(user_id: &str, provider_id: &str, subject: &str, timestamp: DateTime<Utc>) -> NewMessage {
    NewMessage {
        user_id: user_id.to_string(),
        provider_message_id: provider_id.to_string(),
        thread_id: String::new(),
        history_id: String::new(),
        sender: "orders@shop.example".to_string(),
        recipient: "me@example.com".to_string(),
        subject: subject.to_string(),
        body: format!("{subject} body"),
        snippet: String::new(),
        timestamp,
        labels: vec!["INBOX".to_string()],
        has_attachments: false,
        size_estimate: 0,
    }
}

/// Insert a message and store `facts` for it at `created_at`
pub fn seed_facts(
    db: &Database,
    user_id: &str,
    provider_id: &str,
    facts: &[NewFact],
    created_at: DateTime<Utc>,
) -> StoredMessage {
    db.insert_message(&new_message(user_id, provider_id, provider_id, created_at), created_at)
        .expect("insert message");
    let mut query = QueryBuilder::new();
    query.add_filter(messages::USER_ID, Operator::Equal, FilterType::Text(user_id.to_string()));
    query.add_filter(
        messages::PROVIDER_MESSAGE_ID,
        Operator::Equal,
        FilterType::Text(provider_id.to_string()),
    );
    let (_, mut rows) = db.query_messages(&query).expect("find message");
    let message = rows.remove(0);
    db.complete_extraction(&message, facts, created_at).expect("store facts");
    message
}

/// In-memory mailbox
#[derive(Default)]
pub struct FakeProvider {
    pub messages: Mutex<HashMap<String, GmailMessage>>,
    /// Page returned for any cursor; `None` means the cursor has expired
    pub history: Mutex<Option<HistoryPage>>,
    /// Ids returned by date-bounded listing
    pub listed: Mutex<Vec<String>>,
    pub refresh_rejected: bool,
    pub calls: AtomicUsize,
}

impl FakeProvider {
    pub fn with_messages(messages: Vec<GmailMessage>) -> Self {
        let listed = messages.iter().map(|m| m.id.clone()).collect();
        let provider = Self {
            listed: Mutex::new(listed),
            ..Self::default()
        };
        provider.add(messages);
        provider
    }

    pub fn add(&self, messages: Vec<GmailMessage>) {
        let mut store = self.messages.lock().unwrap();
        for message in messages {
            store.insert(message.id.clone(), message);
        }
    }

    pub fn set_history(&self, ids: &[&str], cursor: &str) {
        *self.history.lock().unwrap() = Some(HistoryPage {
            message_ids: ids.iter().map(|id| (*id).to_string()).collect(),
            cursor: Some(cursor.to_string()),
        });
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailProvider for FakeProvider {
    async fn refresh_access_token(&self, _refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.refresh_rejected {
            return Err(ProviderError::AuthRejected("HTTP 400: invalid_grant".to_string()));
        }
        Ok(TokenGrant {
            access_token: "refreshed-token".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }

    async fn list_history(
        &self,
        _access_token: &str,
        _cursor: &str,
        _max_results: u32,
    ) -> Result<HistoryPage, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.history.lock().unwrap().clone().ok_or(ProviderError::CursorExpired)
    }

    async fn list_messages_after(
        &self,
        _access_token: &str,
        _after: DateTime<Utc>,
        _max_results: u32,
    ) -> Result<Vec<String>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.listed.lock().unwrap().clone())
    }

    async fn get_message(&self, _access_token: &str, id: &str) -> Result<GmailMessage, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.messages
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::Api {
                status: 404,
                message: format!("message {id} not found"),
            })
    }
}

type JsonHandler = Box<dyn Fn(&CompletionRequest) -> Result<Value, NluError> + Send + Sync>;
type TextHandler = Box<dyn Fn(&CompletionRequest) -> Result<String, NluError> + Send + Sync>;

/// NLU service answering from closures and recording every request
pub struct FakeNlu {
    json: JsonHandler,
    text: TextHandler,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl Default for FakeNlu {
    fn default() -> Self {
        Self {
            json: Box::new(|_| Err(NluError::Network("no json handler".to_string()))),
            text: Box::new(|_| Err(NluError::Network("no text handler".to_string()))),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl FakeNlu {
    pub fn on_json(
        mut self,
        handler: impl Fn(&CompletionRequest) -> Result<Value, NluError> + Send + Sync + 'static,
    ) -> Self {
        self.json = Box::new(handler);
        self
    }

    pub fn on_text(
        mut self,
        handler: impl Fn(&CompletionRequest) -> Result<String, NluError> + Send + Sync + 'static,
    ) -> Self {
        self.text = Box::new(handler);
        self
    }

    pub fn recorded(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl NluService for FakeNlu {
    async fn complete_json(&self, request: CompletionRequest) -> Result<Value, NluError> {
        let response = (self.json)(&request);
        self.requests.lock().unwrap().push(request);
        response
    }

    async fn complete_text(&self, request: CompletionRequest) -> Result<String, NluError> {
        let response = (self.text)(&request);
        self.requests.lock().unwrap().push(request);
        response
    }
}
