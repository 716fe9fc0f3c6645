//! Shared client context.
//!
//! One explicit bundle of every external client the pipeline touches,
//! constructed once at startup and passed by reference into each worker.
//! Lifecycle is `init → run → teardown`; teardown runs on every exit path
//! (graceful or cancelled) from the binary.

use anyhow::Context as _;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::object_store::ObjectStore;
use crate::router::ErrorRouter;
use crate::store::Store;
use crate::vector_index::VectorIndex;

pub struct AppContext {
    pub config: Config,
    pub store: Store,
    pub object_store: ObjectStore,
    pub vector_index: VectorIndex,
    pub embedder: Embedder,
    pub router: ErrorRouter,
    /// Cloneable multiplexed Redis connection, shared by the consumer,
    /// the DLQ publisher, and reclaim bookkeeping.
    pub redis: redis::aio::ConnectionManager,
}

impl AppContext {
    pub async fn init(config: Config) -> anyhow::Result<Self> {
        let store = Store::connect(&config.database_url, config.processing.max_parallel_jobs)
            .await
            .context("connecting to the relational store")?;

        let client = redis::Client::open(config.redis.url.as_str())
            .context("parsing REDIS_URL")?;
        let redis = redis::aio::ConnectionManager::new(client)
            .await
            .context("connecting to the broker")?;

        let object_store = ObjectStore::new(config.object_store.clone())?;
        let vector_index = VectorIndex::new(config.vector.clone())?;
        let embedder = Embedder::new(config.embedding.clone())?;
        let router = ErrorRouter::new(
            config.redis.dlq_stream.clone(),
            config.processing.max_retries,
        );

        Ok(Self {
            config,
            store,
            object_store,
            vector_index,
            embedder,
            router,
            redis,
        })
    }

    pub async fn teardown(&self) {
        self.store.pool().close().await;
    }
}
