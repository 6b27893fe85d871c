pub mod http;
pub mod router;
pub mod server;
pub mod subsystems;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tally_core::{ChatClient, GenerativeBackend, SearchClient, TallyConfig};
use tally_eval::{
    EvaluationRunner, EvaluationStore, IngestionEvaluator, RagEvaluator,
};

use subsystems::pipeline::QueryPipeline;

/// Shared state behind both the IPC and HTTP servers.
pub struct AppState {
    pub pool: PgPool,
    pub config: TallyConfig,
    pub pipeline: Arc<QueryPipeline>,
    pub runner: Arc<EvaluationRunner>,
    pub store: EvaluationStore,
    /// Cancellation handles for in-flight batch runs, keyed by run id.
    pub cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl AppState {
    /// Wire the pipeline and evaluation engine from explicit backends.
    /// Tests pass scripted backends here; `from_config` builds the real ones.
    pub fn new(
        pool: PgPool,
        config: TallyConfig,
        llm: Arc<dyn GenerativeBackend>,
        judge: Arc<dyn GenerativeBackend>,
        search: Option<SearchClient>,
    ) -> Arc<Self> {
        let pipeline = Arc::new(QueryPipeline::new(
            pool.clone(),
            llm,
            search,
            config.query.clone(),
        ));

        let store = EvaluationStore::new(pool.clone());
        let runner = Arc::new(EvaluationRunner::new(
            store.clone(),
            RagEvaluator::new(judge.clone()),
            IngestionEvaluator::new(judge),
            pipeline.clone(),
            config.evaluation.clone(),
        ));

        Arc::new(Self {
            pool,
            config,
            pipeline,
            runner,
            store,
            cancellations: Mutex::new(HashMap::new()),
        })
    }

    /// Build real model/search clients from configuration. The search tool
    /// is optional: a missing key degrades to database-only answers.
    pub fn from_config(pool: PgPool, config: TallyConfig) -> anyhow::Result<Arc<Self>> {
        let llm: Arc<dyn GenerativeBackend> = Arc::new(ChatClient::new(&config.llm)?);
        let judge: Arc<dyn GenerativeBackend> = Arc::new(ChatClient::new(&config.judge)?);

        let search = if config.search.enabled {
            match SearchClient::new(&config.search) {
                Ok(client) => Some(client),
                Err(e) => {
                    tracing::warn!(error = %e, "Search tool disabled");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self::new(pool, config, llm, judge, search))
    }

    pub fn register_cancellation(&self, run_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancellations
            .lock()
            .expect("cancellation registry poisoned")
            .insert(run_id, token.clone());
        token
    }

    pub fn take_cancellation(&self, run_id: Uuid) -> Option<CancellationToken> {
        self.cancellations
            .lock()
            .expect("cancellation registry poisoned")
            .remove(&run_id)
    }

    pub fn clear_cancellation(&self, run_id: Uuid) {
        self.cancellations
            .lock()
            .expect("cancellation registry poisoned")
            .remove(&run_id);
    }
}
