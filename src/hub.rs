//! Wiring: builds the job queue, reply router and sync engine on top of one
//! storage backend.
//!
//! The queue is built before the engine because the engine enqueues work,
//! yet `sync_event` jobs call back into the engine. The handler gets a
//! late-bound weak slot that is filled once the engine exists.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use secrecy::ExposeSecret;
use tracing::info;

use crate::adapter::{COMMENT_REPLY, GenericAdapter, ServiceAdapter};
use crate::cache::CacheStore;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::config::secrets::redact_url;
use crate::db::Db;
use crate::engine::reply::ReplyRouter;
use crate::engine::{EngineConfig, EngineDeps, EngineSlot, SYNC_EVENT, SyncEngine, SyncEventJob};
use crate::error::{Error, Result};
use crate::index::EventIndex;
use crate::jobs::{HandlerRegistry, HandlerSpec, JobQueue, JobStore, JobsConfig, QueueConfig};
use crate::outbound::handlers::{AttachFile, Outbound, PostComment, SubscribeWebhook};
use crate::outbound::replies::{ATTACH_REPLY, AttachReply, CommentReply};
use crate::outbound::{ATTACH_FILE, ExternalService, HttpService, POST_COMMENT, SUBSCRIBE_WEBHOOK, ServiceDirectory};
use crate::storage::Storage;
use crate::transport::{ChatTransport, LogTransport};

/// Per-request ceiling for upstream HTTP calls.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

/// The three persistence seams, usually backed by one store.
#[derive(Clone)]
pub struct Stores {
    pub index: Arc<dyn EventIndex>,
    pub cache: Arc<dyn CacheStore>,
    pub jobs: Arc<dyn JobStore>,
}

impl Stores {
    pub fn sqlite(storage: Storage) -> Self {
        let storage = Arc::new(storage);
        Self {
            index: storage.clone(),
            cache: storage.clone(),
            jobs: storage,
        }
    }

    pub fn postgres(db: Db) -> Self {
        let db = Arc::new(db);
        Self {
            index: db.clone(),
            cache: db.clone(),
            jobs: db,
        }
    }

    /// Postgres when a database URL is configured, SQLite otherwise.
    pub async fn open(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        match &config.database_url {
            Some(url) => {
                info!(database = %redact_url(url), "using postgres backend");
                let db = Db::connect(url.expose_secret()).await?.with_clock(clock);
                db.migrate().await?;
                Ok(Self::postgres(db))
            }
            None => {
                info!(path = %config.sqlite_path.display(), "using sqlite backend");
                Ok(Self::sqlite(Storage::open(&config.sqlite_path)?.with_clock(clock)))
            }
        }
    }
}

/// A wired hub: the engine and the queue it shares with the outbound handlers.
#[derive(Clone)]
pub struct Hub {
    engine: Arc<SyncEngine>,
    queue: JobQueue,
}

impl Hub {
    pub fn builder() -> HubBuilder {
        HubBuilder::default()
    }

    /// Build a hub from environment configuration: one HTTP client and one
    /// canonical-JSON adapter per configured service, log-only chat transport.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let stores = Stores::open(config, clock.clone()).await?;

        let mut builder = Hub::builder()
            .stores(stores)
            .clock(clock)
            .engine_config(config.engine())
            .public_url(&config.public_url);
        if let Some(path) = &config.jobs_config {
            builder = builder.jobs_config(JobsConfig::load(path)?);
        }
        for service in &config.services {
            let client = HttpService::new(&service.name, &service.api_base, service.token.clone(), UPSTREAM_TIMEOUT)?;
            builder = builder
                .service(Arc::new(client))
                .adapter(Arc::new(GenericAdapter::new(&service.name)));
        }
        builder.build()
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }
}

pub struct HubBuilder {
    stores: Option<Stores>,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn ChatTransport>,
    services: ServiceDirectory,
    adapters: Vec<Arc<dyn ServiceAdapter>>,
    jobs_config: JobsConfig,
    engine_config: EngineConfig,
    queue_config: QueueConfig,
    public_url: String,
}

impl Default for HubBuilder {
    fn default() -> Self {
        Self {
            stores: None,
            clock: Arc::new(SystemClock),
            transport: Arc::new(LogTransport::new()),
            services: ServiceDirectory::new(),
            adapters: Vec::new(),
            jobs_config: JobsConfig::default(),
            engine_config: EngineConfig::default(),
            queue_config: QueueConfig::default(),
            public_url: "http://localhost:8080".to_string(),
        }
    }
}

impl HubBuilder {
    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ChatTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn service(mut self, service: Arc<dyn ExternalService>) -> Self {
        self.services.insert(service);
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn ServiceAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn jobs_config(mut self, config: JobsConfig) -> Self {
        self.jobs_config = config;
        self
    }

    pub fn engine_config(mut self, config: EngineConfig) -> Self {
        self.engine_config = config;
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue_config = config;
        self
    }

    pub fn public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into();
        self
    }

    pub fn build(self) -> Result<Hub> {
        let stores = self
            .stores
            .ok_or_else(|| Error::Config("hub needs a storage backend".to_string()))?;
        let services = Arc::new(self.services);

        let outbound = Outbound {
            services: services.clone(),
            cache: stores.cache.clone(),
            transport: self.transport.clone(),
            public_url: self.public_url,
            dedup_ttl: self.engine_config.dedup_ttl,
        };
        let slot: EngineSlot = Arc::new(OnceLock::new());

        let mut registry = HandlerRegistry::with_overrides(self.jobs_config);
        registry
            .register(POST_COMMENT, Arc::new(PostComment(outbound.clone())), HandlerSpec::default())
            .register(ATTACH_FILE, Arc::new(AttachFile(outbound.clone())), HandlerSpec::default())
            // Providers reject concurrent registrations for the same callback.
            .register(
                SUBSCRIBE_WEBHOOK,
                Arc::new(SubscribeWebhook(outbound)),
                HandlerSpec::default().pool_size(1),
            )
            .register(SYNC_EVENT, Arc::new(SyncEventJob::new(slot.clone())), HandlerSpec::default());

        let queue = JobQueue::new(
            stores.jobs.clone(),
            Arc::new(registry),
            self.clock.clone(),
            self.queue_config,
        );

        let mut replies = ReplyRouter::new();
        replies
            .register(
                COMMENT_REPLY,
                Arc::new(CommentReply {
                    queue: queue.clone(),
                    transport: self.transport.clone(),
                    timeout: self.engine_config.sync_call_timeout,
                }),
            )
            .register(ATTACH_REPLY, Arc::new(AttachReply { queue: queue.clone() }));

        let deps = EngineDeps {
            index: stores.index,
            cache: stores.cache,
            transport: self.transport,
            queue: queue.clone(),
            services,
            clock: self.clock,
        };
        let mut engine = SyncEngine::new(deps, self.engine_config).with_replies(replies);
        for adapter in self.adapters {
            info!(service = adapter.namespace(), "registered webhook adapter");
            engine = engine.with_adapter(adapter);
        }
        let engine = Arc::new(engine);
        // Fresh slot; cannot already be set.
        let _ = slot.set(Arc::downgrade(&engine));

        Ok(Hub { engine, queue })
    }
}
