//! Execution engine: routing, coordination, scheduling.
//!
//! [`Engine`] wires the components together. Everything is shared behind
//! `Arc`, so the parts can be handed to separate tasks.

pub mod coordinator;
pub mod retry;
pub mod router;
pub mod scheduler;

pub use coordinator::Coordinator;
pub use retry::{Backoff, RetryPolicy};
pub use router::Router;
pub use scheduler::{Scheduler, Tick};

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::ledger::TaskLedger;
use crate::model::{IdGenerator, UuidV7Generator};
use crate::registry::JobRegistry;
use crate::resolver::{ConnectionResolver, InMemoryCredentials};
use crate::store::{MemoryStore, Store};
use crate::worker::{JobHandler, LocalWorker, Worker};

pub struct Engine {
    store: Arc<dyn Store>,
    registry: Arc<JobRegistry>,
    ledger: Arc<TaskLedger>,
    coordinator: Arc<Coordinator>,
    router: Arc<Router>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(Arc::clone(&self.router), Arc::clone(&self.coordinator))
    }
}

/// Assembles an [`Engine`]. Anything left unset falls back to the in-memory
/// implementation.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn Store>>,
    registry: Option<Arc<JobRegistry>>,
    resolver: Option<Arc<dyn ConnectionResolver>>,
    ids: Option<Arc<dyn IdGenerator>>,
    worker: Option<Arc<dyn Worker>>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl EngineBuilder {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            registry: None,
            resolver: None,
            ids: None,
            worker: None,
            handlers: HashMap::new(),
        }
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: Arc<JobRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ConnectionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Use an external worker instead of the in-process one. Handlers
    /// registered with [`EngineBuilder::handler`] are then ignored.
    pub fn worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Run `job_id` in-process with `handler`.
    pub fn handler(mut self, job_id: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_id.into(), handler);
        self
    }

    pub fn build(self) -> Engine {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(JobRegistry::empty()));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(InMemoryCredentials::new()));
        let ids = self.ids.unwrap_or_else(|| Arc::new(UuidV7Generator));

        let ledger = Arc::new(
            TaskLedger::new(Arc::clone(&store), Arc::clone(&ids))
                .with_lease(self.config.task_lease, self.config.task_poll_interval),
        );
        let worker = match self.worker {
            Some(worker) => worker,
            None => {
                let local = self
                    .handlers
                    .into_iter()
                    .fold(LocalWorker::new(Arc::clone(&ledger)), |w, (job, handler)| {
                        w.with_handler(job, handler)
                    });
                Arc::new(local)
            }
        };

        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            resolver,
            Arc::clone(&ledger),
            worker,
            Arc::clone(&ids),
            self.config.clone(),
        ));
        let router = Arc::new(Router::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&coordinator),
            ids,
            self.config,
        ));

        Engine {
            store,
            registry,
            ledger,
            coordinator,
            router,
        }
    }
}
