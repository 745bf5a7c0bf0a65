pub mod config;
pub mod error;
pub mod schema;
pub mod datasource;
pub mod skillset;
pub mod indexer;
pub mod query;
pub mod service;
pub mod pipeline;
pub mod chat;
pub use config::PipelineConfig;
pub use error::{ PipelineError, ResourceKind, Result };
pub use query::{ QueryExecutor, QueryOptions, QueryRequest, SearchHit };
pub use service::{ create_search_service, run_indexer_and_wait, wait_for_indexer, AzureSearchService, InMemorySearchService, SearchService };
pub use pipeline::{ provision, ProvisionedPipeline, Provisioner };
pub use chat::{ Assistant, AzureOpenAiChat, CompletionModel, Conversation };
