//! Shared fakes for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};

use hubsync::adapter::{GenericAdapter, ServiceAdapter};
use hubsync::cache::{CacheScope, CacheStore};
use hubsync::clock::ManualClock;
use hubsync::error::{Error, Result};
use hubsync::hub::{Hub, Stores};
use hubsync::index::EventIndex;
use hubsync::jobs::{JobsConfig, QueueConfig};
use hubsync::model::{ChatId, EventId, MessageId, MessageRecord};
use hubsync::outbound::ExternalService;
use hubsync::storage::Storage;
use hubsync::transport::{ChatTransport, OutgoingMessage};

pub const SERVICE: &str = "trello";

// ---------------------------------------------------------------------------
// Chat transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Send {
        chat: ChatId,
        id: MessageId,
        message: OutgoingMessage,
    },
    Edit {
        chat: ChatId,
        id: MessageId,
        message: OutgoingMessage,
    },
}

/// Records every send and edit; ids start at 100.
pub struct RecordingTransport {
    next_id: AtomicI64,
    log: Mutex<Vec<Sent>>,
    down: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(100),
            log: Mutex::new(Vec::new()),
            down: AtomicBool::new(false),
        }
    }

    /// While down, every call fails with a transient error.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn log(&self) -> Vec<Sent> {
        self.log.lock().unwrap().clone()
    }

    pub fn sends(&self) -> Vec<OutgoingMessage> {
        self.log()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Send { message, .. } => Some(message),
                Sent::Edit { .. } => None,
            })
            .collect()
    }

    pub fn edits(&self) -> Vec<(MessageId, OutgoingMessage)> {
        self.log()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Edit { id, message, .. } => Some((id, message)),
                Sent::Send { .. } => None,
            })
            .collect()
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::TransientUpstream("chat unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send(&self, chat: ChatId, message: &OutgoingMessage) -> Result<MessageId> {
        self.check()?;
        let id = MessageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.log.lock().unwrap().push(Sent::Send {
            chat,
            id,
            message: message.clone(),
        });
        Ok(id)
    }

    async fn edit(&self, chat: ChatId, message: MessageId, update: &OutgoingMessage) -> Result<()> {
        self.check()?;
        self.log.lock().unwrap().push(Sent::Edit {
            chat,
            id: message,
            message: update.clone(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// External service
// ---------------------------------------------------------------------------

/// One recorded outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub token: String,
    pub target: String,
    pub detail: String,
}

/// A scripted result for the next call of an operation.
pub enum Step {
    Ok(Value),
    Transient,
    AuthInvalid,
    NotFound,
    /// Succeed after sleeping.
    Slow(Duration),
}

/// Scripted `ExternalService`: each operation pops its next step and
/// succeeds once the script runs dry.
pub struct FakeService {
    name: String,
    script: Mutex<HashMap<&'static str, VecDeque<Step>>>,
    calls: Mutex<Vec<Call>>,
    entities: Mutex<HashMap<String, Value>>,
    fetches: AtomicUsize,
}

impl FakeService {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            entities: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn script(&self, op: &'static str, steps: impl IntoIterator<Item = Step>) {
        self.script.lock().unwrap().entry(op).or_default().extend(steps);
    }

    pub fn put_entity(&self, id: &str, fields: Value) {
        self.entities.lock().unwrap().insert(id.to_string(), fields);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, op: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn step(&self, call: Call) -> Result<Value> {
        let op = call.op;
        self.calls.lock().unwrap().push(call);
        let step = self.script.lock().unwrap().get_mut(op).and_then(VecDeque::pop_front);
        match step {
            None => Ok(json!({ "ok": true })),
            Some(Step::Ok(value)) => Ok(value),
            Some(Step::Transient) => Err(Error::TransientUpstream(format!("{op}: 503"))),
            Some(Step::AuthInvalid) => Err(Error::AuthInvalid {
                service: self.name.clone(),
                message: "token revoked".into(),
            }),
            Some(Step::NotFound) => Err(Error::NotFound(format!("{op} target"))),
            Some(Step::Slow(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(json!({ "ok": true, "slow": true }))
            }
        }
    }
}

#[async_trait]
impl ExternalService for FakeService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_entity(&self, entity: &EventId) -> Result<Value> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.entities
            .lock()
            .unwrap()
            .get(entity.as_str())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("entity {entity}")))
    }

    async fn post_comment(&self, token: &str, target: &str, text: &str) -> Result<Value> {
        self.step(Call {
            op: "post_comment",
            token: token.into(),
            target: target.into(),
            detail: text.into(),
        })
        .await
    }

    async fn attach_file(&self, token: &str, target: &str, name: &str, url: &str) -> Result<Value> {
        self.step(Call {
            op: "attach_file",
            token: token.into(),
            target: target.into(),
            detail: format!("{name} {url}"),
        })
        .await
    }

    async fn subscribe_webhook(&self, token: &str, target: &str, callback_url: &str) -> Result<Value> {
        self.step(Call {
            op: "subscribe_webhook",
            token: token.into(),
            target: target.into(),
            detail: callback_url.into(),
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Stores that can be taken down
// ---------------------------------------------------------------------------

/// Wraps a real store; fails every call with `StoreUnavailable` while down.
pub struct Flaky<S: ?Sized> {
    inner: Arc<S>,
    down: AtomicBool,
}

impl<S: ?Sized> Flaky<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EventIndex for Flaky<dyn EventIndex> {
    async fn save_message(&self, record: &MessageRecord) -> Result<()> {
        self.check()?;
        self.inner.save_message(record).await
    }

    async fn record_event(&self, chat: ChatId, event_id: &EventId, message: MessageId) -> Result<()> {
        self.check()?;
        self.inner.record_event(chat, event_id, message).await
    }

    async fn find_message_by_event_id(&self, chat: ChatId, event_id: &EventId) -> Result<Option<MessageRecord>> {
        self.check()?;
        self.inner.find_message_by_event_id(chat, event_id).await
    }

    async fn get_message(&self, chat: ChatId, message: MessageId) -> Result<Option<MessageRecord>> {
        self.check()?;
        self.inner.get_message(chat, message).await
    }

    async fn append_event_ids(&self, chat: ChatId, message: MessageId, ids: &[EventId]) -> Result<()> {
        self.check()?;
        self.inner.append_event_ids(chat, message, ids).await
    }

    async fn event_ids_for(&self, chat: ChatId, message: MessageId) -> Result<Vec<EventId>> {
        self.check()?;
        self.inner.event_ids_for(chat, message).await
    }
}

#[async_trait]
impl CacheStore for Flaky<dyn CacheStore> {
    async fn get(&self, scope: &CacheScope, key: &str) -> Result<Option<Value>> {
        self.check()?;
        self.inner.get(scope, key).await
    }

    async fn set(&self, scope: &CacheScope, key: &str, value: Value, ttl: Duration) -> Result<()> {
        self.check()?;
        self.inner.set(scope, key, value, ttl).await
    }

    async fn set_if_absent(&self, scope: &CacheScope, key: &str, value: Value, ttl: Duration) -> Result<bool> {
        self.check()?;
        self.inner.set_if_absent(scope, key, value, ttl).await
    }

    async fn invalidate(&self, scope: &CacheScope, key: &str) -> Result<()> {
        self.check()?;
        self.inner.invalidate(scope, key).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// 2024-05-01 10:00:00 UTC
pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

/// A hub on in-memory SQLite with a manual clock, a recording transport and
/// one fake service. Index and cache can be taken down independently.
pub struct TestHub {
    pub hub: Hub,
    pub storage: Arc<Storage>,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<RecordingTransport>,
    pub service: Arc<FakeService>,
    pub index: Arc<Flaky<dyn EventIndex>>,
    pub cache: Arc<Flaky<dyn CacheStore>>,
}

impl TestHub {
    pub fn new() -> Self {
        Self::with_jobs_config(JobsConfig::default())
    }

    /// Handler pool and retry overrides from TOML.
    pub fn with_jobs_toml(toml: &str) -> Self {
        Self::with_jobs_config(JobsConfig::from_toml(toml).unwrap())
    }

    pub fn with_jobs_config(jobs: JobsConfig) -> Self {
        Self::build(jobs, Arc::new(GenericAdapter::new(SERVICE)))
    }

    /// A hub whose webhooks are rendered by `adapter`.
    pub fn with_adapter(adapter: Arc<dyn ServiceAdapter>) -> Self {
        Self::build(JobsConfig::default(), adapter)
    }

    fn build(jobs: JobsConfig, adapter: Arc<dyn ServiceAdapter>) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let storage = Arc::new(Storage::in_memory().unwrap().with_clock(clock.clone()));
        let index = Arc::new(Flaky::<dyn EventIndex>::new(storage.clone()));
        let cache = Arc::new(Flaky::<dyn CacheStore>::new(storage.clone()));
        let transport = Arc::new(RecordingTransport::new());
        let service = Arc::new(FakeService::new(SERVICE));

        let hub = Hub::builder()
            .stores(Stores {
                index: index.clone(),
                cache: cache.clone(),
                jobs: storage.clone(),
            })
            .clock(clock.clone())
            .transport(transport.clone())
            .service(service.clone())
            .adapter(adapter)
            .jobs_config(jobs)
            .queue_config(QueueConfig {
                poll_interval: Duration::from_millis(20),
                batch_size: 64,
            })
            .public_url("https://hub.example")
            .build()
            .unwrap();

        Self {
            hub,
            storage,
            clock,
            transport,
            service,
            index,
            cache,
        }
    }

    pub fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }
}

/// A canonical-JSON webhook body.
pub fn webhook(action_id: &str, kind: &str, entity: &str, actor: &str, payload: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "action_id": action_id,
        "kind": kind,
        "entity": entity,
        "actor": actor,
        "payload": payload,
    }))
    .unwrap()
}
