pub mod azure;
pub mod memory;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{ Duration, Instant };
use log::{ info, debug };

use crate::config::PipelineConfig;
use crate::datasource::DataSourceConnection;
use crate::error::{ PipelineError, Result };
use crate::indexer::{ Indexer, IndexerRunState, IndexerStatus, RunMarker };
use crate::query::{ QueryRequest, SearchHit };
use crate::schema::IndexSchema;
use crate::skillset::Skillset;

pub use azure::AzureSearchService;
pub use memory::{ EntityRecognizer, Gazetteer, InMemorySearchService, NoEntities };

/// A managed search service. Every definition call is an idempotent create-or-update
/// keyed by the resource name and returns the definition as stored.
#[async_trait]
pub trait SearchService: Send + Sync {
    async fn upsert_index(&self, index: &IndexSchema) -> Result<IndexSchema>;

    async fn upsert_data_source(&self, data_source: &DataSourceConnection) -> Result<DataSourceConnection>;

    async fn upsert_skillset(&self, skillset: &Skillset) -> Result<Skillset>;

    /// Creating an indexer also starts its first run.
    async fn upsert_indexer(&self, indexer: &Indexer) -> Result<Indexer>;

    async fn run_indexer(&self, name: &str) -> Result<()>;

    async fn indexer_status(&self, name: &str) -> Result<IndexerStatus>;

    /// Ranked hits for one query. An index without matches yields an empty vector.
    async fn search(&self, index: &str, request: &QueryRequest) -> Result<Vec<SearchHit>>;

    async fn count_documents(&self, index: &str) -> Result<usize>;
}

pub fn create_search_service(config: &PipelineConfig) -> Result<Arc<dyn SearchService>> {
    info!("Creating search service client for {}", config.search.endpoint);
    let service = AzureSearchService::new(&config.search)?;
    Ok(Arc::new(service))
}

/// Polls the indexer until its latest run reaches a terminal state. Ingestion is
/// asynchronous on the service side, so freshly provisioned data is only queryable
/// after this returns a successful state.
pub async fn wait_for_indexer(
    service: &dyn SearchService,
    name: &str,
    max_failed_items: i32,
    poll_interval: Duration,
    timeout: Duration
) -> Result<IndexerRunState> {
    poll_indexer(service, name, max_failed_items, None, poll_interval, timeout).await
}

/// Starts a run and waits for that run, not an earlier one, to finish. The service keeps
/// reporting the previous execution for a while after a run is requested.
pub async fn run_indexer_and_wait(
    service: &dyn SearchService,
    name: &str,
    max_failed_items: i32,
    poll_interval: Duration,
    timeout: Duration
) -> Result<IndexerRunState> {
    let marker = service.indexer_status(name).await?.marker();
    service.run_indexer(name).await?;
    poll_indexer(service, name, max_failed_items, Some(marker), poll_interval, timeout).await
}

async fn poll_indexer(
    service: &dyn SearchService,
    name: &str,
    max_failed_items: i32,
    since: Option<RunMarker>,
    poll_interval: Duration,
    timeout: Duration
) -> Result<IndexerRunState> {
    let started = Instant::now();
    loop {
        let status = service.indexer_status(name).await?;
        let fresh = since.as_ref().map_or(true, |marker| status.has_run_since(marker));
        let state = status.run_state(max_failed_items);
        if fresh {
            debug!("Indexer '{}' is {:?}", name, state);
            if state.is_terminal() {
                info!("Indexer '{}' finished as {:?}", name, state);
                return Ok(state);
            }
        } else {
            debug!("Indexer '{}' still reports the previous run", name);
        }
        if started.elapsed() + poll_interval > timeout {
            return Err(PipelineError::Timeout {
                indexer: name.to_string(),
                waited: started.elapsed(),
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}
