//! Provisioning, ingestion and retrieval against the in-memory search service.

use std::collections::HashMap;
use std::sync::{ Arc, Mutex };
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use grounded_search::chat::{ Assistant, ChatMessage, CompletionModel, Conversation, Role };
use grounded_search::indexer::IndexerRunState;
use grounded_search::query::{ QueryOptions, QueryRequest };
use grounded_search::service::Gazetteer;
use grounded_search::skillset::Skillset;
use grounded_search::datasource::DataSourceConnection;
use grounded_search::indexer::{ Indexer, IndexingSchedule };
use grounded_search::schema::IndexSchema;
use grounded_search::{
    provision,
    run_indexer_and_wait,
    InMemorySearchService,
    PipelineConfig,
    PipelineError,
    QueryExecutor,
    ResourceKind,
    SearchService,
};

const CONTAINER: &str = "docs";
const PHILHARMONIC: &str = "The New York Philharmonic premiered West Side Story Suite in 1961";

fn config_with(overrides: &[(&str, &str)]) -> PipelineConfig {
    let mut vars: HashMap<String, String> = [
        ("AZURE_SEARCH_SERVICE", "https://example-search.search.windows.net"),
        ("AZURE_SEARCH_API_KEY", "search-key"),
        ("AZURE_OPENAI_ENDPOINT", "https://example-openai.openai.azure.com"),
        ("AZURE_STORAGE_CONNECTION", "DefaultEndpointsProtocol=https;AccountName=a;AccountKey=k"),
        ("AZURE_STORAGE_CONTAINER_NAME", CONTAINER),
        ("AZURE_AI_COGNITIVE_SERVICES_KEY", "cs-key"),
        ("SEARCH_INDEXER_MAX_FAILED_ITEMS", "0"),
    ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }
    PipelineConfig::from_lookup(|key| vars.get(key).cloned()).unwrap()
}

fn config() -> PipelineConfig {
    config_with(&[])
}

fn service() -> Arc<InMemorySearchService> {
    Arc::new(InMemorySearchService::new().with_recognizer(Gazetteer::new().with("Location", &["New York", "Vienna"])))
}

async fn provisioned(service: &InMemorySearchService, config: &PipelineConfig) -> IndexerRunState {
    let pipeline = provision(service, config).await.unwrap();
    pipeline
        .wait_until_indexed(service, Duration::from_millis(10), Duration::from_secs(1)).await
        .unwrap()
}

fn executor(service: &Arc<InMemorySearchService>, config: &PipelineConfig) -> QueryExecutor {
    QueryExecutor::with_options(service.clone(), &config.names.index, config.query_options())
}

#[tokio::test]
async fn provisioning_twice_keeps_one_of_each_resource() {
    let service = service();
    let config = config();
    service.put_blob(CONTAINER, "philharmonic.txt", PHILHARMONIC);

    provision(service.as_ref(), &config).await.unwrap();
    let first_count = service.count_documents(&config.names.index).await.unwrap();
    provision(service.as_ref(), &config).await.unwrap();

    for (kind, name) in [
        (ResourceKind::DataSource, &config.names.data_source),
        (ResourceKind::Index, &config.names.index),
        (ResourceKind::Skillset, &config.names.skillset),
        (ResourceKind::Indexer, &config.names.indexer),
    ] {
        assert_eq!(service.resource_names(kind), vec![name.clone()], "{}", kind);
    }
    assert_eq!(service.count_documents(&config.names.index).await.unwrap(), first_count);
}

#[tokio::test]
async fn west_side_story_is_found_after_one_run() {
    let service = service();
    let config = config();
    service.put_blob(CONTAINER, "philharmonic.txt", PHILHARMONIC);

    assert_eq!(provisioned(&service, &config).await, IndexerRunState::Succeeded);

    let hits = executor(&service, &config).search("West Side Story premiere").await.unwrap();
    assert!(!hits.is_empty() && hits.len() <= 5);
    let hit = hits
        .iter()
        .find(|h| h.chunk == PHILHARMONIC)
        .expect("document chunk among the top hits");
    assert_eq!(hit.title, "philharmonic.txt");
    assert_eq!(hit.locations, vec!["New York".to_string()]);
}

#[tokio::test]
async fn search_returns_at_most_five_populated_hits() {
    let service = service();
    let config = config();
    for n in 0..12 {
        service.put_blob(CONTAINER, &format!("concert-{}.txt", n), format!("Orchestra concert number {} in Vienna", n));
    }
    provisioned(&service, &config).await;

    let executor = executor(&service, &config);
    for query in ["orchestra", "concert Vienna", "number 7", "*"] {
        let hits = executor.search(query).await.unwrap();
        assert!(hits.len() <= 5, "{} gave {} hits", query, hits.len());
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| !h.title.is_empty() && !h.chunk.is_empty()));
    }
    assert_eq!(executor.search("orchestra").await.unwrap().len(), 5);
}

#[tokio::test]
async fn empty_index_yields_empty_results() {
    let service = service();
    let config = config();

    // The container was never created, so the first run fails and nothing is indexed.
    assert_eq!(provisioned(&service, &config).await, IndexerRunState::Failed);
    assert_eq!(service.count_documents(&config.names.index).await.unwrap(), 0);

    let executor = executor(&service, &config);
    for query in ["West Side Story", "", "*", "anything at all"] {
        assert!(executor.search(query).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn documents_are_split_into_overlapping_chunks() {
    let service = service();
    let config = config();
    service.put_blob(CONTAINER, "short.txt", "a".repeat(2000));
    service.put_blob(CONTAINER, "long.txt", "word ".repeat(1000));
    provisioned(&service, &config).await;

    // 1 page for 2000 chars, ceil((5000 - 2000) / 1500) + 1 = 3 pages for 5000 chars.
    assert_eq!(service.count_documents(&config.names.index).await.unwrap(), 4);

    let docs = service.documents(&config.names.index);
    assert!(
        docs.iter().all(|d| d["chunk_id"].as_str().unwrap().contains("_pages_") && d["parent_id"].is_string()),
        "parent documents must not be indexed"
    );
    let long_pages: Vec<&str> = docs
        .iter()
        .filter(|d| d["title"] == "long.txt")
        .map(|d| d["chunk"].as_str().unwrap())
        .collect();
    assert_eq!(long_pages.len(), 3);
    assert!(long_pages.iter().all(|p| p.chars().count() <= 2000));
}

#[tokio::test]
async fn reindexing_replaces_previous_chunks() {
    let service = service();
    let config = config();
    service.put_blob(CONTAINER, "notes.txt", "word ".repeat(1000));
    provisioned(&service, &config).await;
    assert_eq!(service.count_documents(&config.names.index).await.unwrap(), 3);

    service.put_blob(CONTAINER, "notes.txt", "now much shorter");
    service.run_indexer(&config.names.indexer).await.unwrap();
    assert_eq!(service.count_documents(&config.names.index).await.unwrap(), 1);

    let status = service.indexer_status(&config.names.indexer).await.unwrap();
    assert_eq!(status.execution_history.len(), 2);
}

#[tokio::test]
async fn json_lines_blobs_index_one_document_per_line() {
    let service = service();
    let config = config_with(&[
        ("SEARCH_INDEXER_PARSING_MODE", "jsonLines"),
        ("SEARCH_INDEXER_MAX_FAILED_ITEMS", "1"),
    ]);
    service.put_blob(
        CONTAINER,
        "programs.jsonl",
        format!("{{\"content\": \"{}\"}}\n\n\"Vienna premiere in 1958\"\nnot json\n", PHILHARMONIC)
    );

    assert_eq!(provisioned(&service, &config).await, IndexerRunState::PartiallySucceeded);
    let docs = service.documents(&config.names.index);
    let chunks: Vec<&str> = docs.iter().map(|d| d["chunk"].as_str().unwrap()).collect();
    assert_eq!(chunks.len(), 2);
    assert!(chunks.contains(&PHILHARMONIC));
    assert!(chunks.contains(&"Vienna premiere in 1958"));
    assert!(docs.iter().all(|d| d["title"] == "programs.jsonl"));

    let last = service.indexer_status(&config.names.indexer).await.unwrap().last_result.unwrap();
    assert_eq!((last.items_processed, last.items_failed), (2, 1));
    assert_eq!(last.errors[0].key.as_deref(), Some("programs.jsonl;2"));

    service.put_blob(CONTAINER, "programs.jsonl", "\"only one line now\"");
    service.run_indexer(&config.names.indexer).await.unwrap();
    assert_eq!(service.count_documents(&config.names.index).await.unwrap(), 1);
}

#[tokio::test]
async fn json_documents_are_read_from_the_document_root() {
    let service = service();
    let config = config_with(&[
        ("SEARCH_INDEXER_PARSING_MODE", "json"),
        ("SEARCH_INDEXER_DOCUMENT_ROOT", "/program"),
    ]);
    service.put_blob(CONTAINER, "concert.json", format!(r#"{{"program": {{"content": "{}"}}}}"#, PHILHARMONIC));
    assert_eq!(provisioned(&service, &config).await, IndexerRunState::Succeeded);
    assert_eq!(service.documents(&config.names.index)[0]["chunk"], PHILHARMONIC);

    service.put_blob(CONTAINER, "broken.json", "{\"program\": ");
    service.run_indexer(&config.names.indexer).await.unwrap();
    let status = service.indexer_status(&config.names.indexer).await.unwrap();
    assert_eq!(status.run_state(config.indexing.max_failed_items), IndexerRunState::Failed);
    let last = status.last_result.unwrap();
    assert_eq!(last.errors[0].key.as_deref(), Some("broken.json"));
    assert!(last.errors[0].error_message.contains("could not parse document as JSON"));
}

#[tokio::test]
async fn failure_threshold_decides_run_outcome() {
    let service = service();
    let config = config_with(&[("SEARCH_INDEXER_MAX_FAILED_ITEMS", "1")]);
    service.put_blob(CONTAINER, "good-1.txt", "first readable document");
    service.put_blob(CONTAINER, "good-2.txt", "second readable document");
    service.put_blob(CONTAINER, "bad-1.bin", vec![0xff, 0xfe, 0x00, 0x80]);

    assert_eq!(provisioned(&service, &config).await, IndexerRunState::PartiallySucceeded);
    assert_eq!(service.count_documents(&config.names.index).await.unwrap(), 2);

    service.put_blob(CONTAINER, "bad-2.bin", vec![0xc3, 0x28]);
    service.run_indexer(&config.names.indexer).await.unwrap();
    let status = service.indexer_status(&config.names.indexer).await.unwrap();
    assert_eq!(status.run_state(1), IndexerRunState::Failed);
    let last = status.last_result.unwrap();
    assert_eq!(last.items_failed, 2);
    assert!(last.errors.iter().any(|e| e.key.as_deref() == Some("bad-2.bin")));
}

#[tokio::test]
async fn requested_run_reports_its_own_outcome() {
    let service = service();
    let config = config();
    service.put_blob(CONTAINER, "good.txt", PHILHARMONIC);
    assert_eq!(provisioned(&service, &config).await, IndexerRunState::Succeeded);

    service.put_blob(CONTAINER, "bad.bin", vec![0xff]);
    let state = run_indexer_and_wait(
        service.as_ref(),
        &config.names.indexer,
        config.indexing.max_failed_items,
        Duration::from_millis(10),
        Duration::from_secs(1)
    ).await.unwrap();
    assert_eq!(state, IndexerRunState::Failed);

    let history = service.indexer_status(&config.names.indexer).await.unwrap().execution_history;
    assert_eq!(history.len(), 2);
    assert!(history[0].start_time > history[1].start_time);
}

#[tokio::test]
async fn unlimited_failures_always_succeed() {
    let service = service();
    let config = config_with(&[("SEARCH_INDEXER_MAX_FAILED_ITEMS", "-1")]);
    for n in 0..5 {
        service.put_blob(CONTAINER, &format!("bad-{}.bin", n), vec![0xff; 8]);
    }
    assert_eq!(provisioned(&service, &config).await, IndexerRunState::PartiallySucceeded);
}

#[tokio::test]
async fn strict_threshold_fails_on_first_bad_document() {
    let service = service();
    let config = config();
    service.put_blob(CONTAINER, "good.txt", PHILHARMONIC);
    service.put_blob(CONTAINER, "bad.bin", vec![0xff]);

    assert_eq!(provisioned(&service, &config).await, IndexerRunState::Failed);
    // The readable document is still searchable; results may be incomplete but not absent.
    assert_eq!(service.count_documents(&config.names.index).await.unwrap(), 1);
}

#[tokio::test]
async fn references_must_exist_before_binding() {
    let service = InMemorySearchService::new();
    let index = IndexSchema::define("idx", "https://example-openai.openai.azure.com").unwrap();
    let data_source = DataSourceConnection::define("ds", CONTAINER, "AccountKey=k").unwrap();
    let skillset = Skillset::define("ss", &index, "https://example-openai.openai.azure.com", "cs-key").unwrap();

    let err = service.upsert_skillset(&skillset).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { kind: ResourceKind::Index, .. }), "{}", err);

    service.upsert_index(&index).await.unwrap();
    service.upsert_skillset(&skillset).await.unwrap();

    let indexer = Indexer::define("idxr", &skillset, &index, &data_source, IndexingSchedule::default(), 0).unwrap();
    let err = service.upsert_indexer(&indexer).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { kind: ResourceKind::DataSource, .. }), "{}", err);
    assert!(!err.is_fatal() && !err.is_retryable());

    service.upsert_data_source(&data_source).await.unwrap();
    service.upsert_indexer(&indexer).await.unwrap();
    assert_eq!(service.resource_names(ResourceKind::Indexer), vec!["idxr".to_string()]);
}

#[tokio::test]
async fn rejected_credentials_are_fatal() {
    let config = config();

    let service = InMemorySearchService::new().require_storage_connection("AccountKey=other");
    let err = provision(&service, &config).await.unwrap_err();
    assert!(matches!(err, PipelineError::Auth { .. }), "{}", err);
    assert!(err.is_fatal());
    assert!(service.resource_names(ResourceKind::Index).is_empty());

    let service = InMemorySearchService::new()
        .require_storage_connection(&config.storage.connection_string)
        .require_cognitive_services_key("another-key");
    let err = provision(&service, &config).await.unwrap_err();
    assert!(matches!(err, PipelineError::Auth { .. }), "{}", err);
    // Not atomic: the data source and index stay behind for the next attempt.
    assert_eq!(service.resource_names(ResourceKind::Index), vec![config.names.index.clone()]);
    assert!(service.resource_names(ResourceKind::Indexer).is_empty());
}

#[tokio::test]
async fn unknown_query_targets_are_rejected() {
    let service = service();
    let config = config();
    service.put_blob(CONTAINER, "philharmonic.txt", PHILHARMONIC);
    provisioned(&service, &config).await;

    let options = QueryOptions { vector_field: "chunk".to_string(), ..config.query_options() };
    let err = service
        .search(&config.names.index, &QueryRequest::hybrid("West Side", &options)).await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Remote { status: 400, .. }), "{}", err);

    let missing = QueryExecutor::new(service.clone(), "no-such-index");
    assert!(matches!(missing.search("x").await.unwrap_err(), PipelineError::NotFound { .. }));
    assert_eq!(executor(&service, &config).search("West Side").await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_queries_are_independent() {
    let service = service();
    let config = config();
    service.put_blob(CONTAINER, "philharmonic.txt", PHILHARMONIC);
    service.put_blob(CONTAINER, "vienna.txt", "The Vienna Philharmonic plays New Year concerts");
    provisioned(&service, &config).await;

    let executor = executor(&service, &config);
    let queries = ["Philharmonic", "West Side Story", "Vienna", "New Year", "Philharmonic", "1961"];
    let results = join_all(queries.iter().map(|q| executor.search(q))).await;

    let results: Vec<Vec<String>> = results
        .into_iter()
        .map(|r| r.unwrap().into_iter().map(|h| h.title).collect())
        .collect();
    assert_eq!(results[0], results[4]);
    assert_eq!(results[0].len(), 2);
    assert_eq!(results[1], vec!["philharmonic.txt".to_string()]);
    assert_eq!(results[2], vec!["vienna.txt".to_string()]);
    assert_eq!(results[5], vec!["philharmonic.txt".to_string()]);
}

/// Records every request and answers with a canned reply.
struct ScriptedModel {
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    async fn complete(&self, messages: &[ChatMessage]) -> grounded_search::Result<String> {
        let mut seen = self.seen.lock().unwrap();
        seen.push(messages.to_vec());
        Ok(format!("answer {}", seen.len()))
    }
}

#[tokio::test]
async fn chat_turns_are_grounded_and_threaded() {
    let service = service();
    let config = config();
    service.put_blob(CONTAINER, "philharmonic.txt", PHILHARMONIC);
    provisioned(&service, &config).await;

    let model = ScriptedModel { seen: Mutex::new(Vec::new()) };
    let assistant = Assistant::new(executor(&service, &config), model);

    let (conversation, reply) = assistant
        .respond(Conversation::new(), "When did West Side Story premiere?").await
        .unwrap();
    assert_eq!(reply, "answer 1");
    assert_eq!(conversation.len(), 2);

    let (conversation, reply) = assistant.respond(conversation, "Where?").await.unwrap();
    assert_eq!(reply, "answer 2");
    assert_eq!(conversation.len(), 4);
    assert_eq!(conversation.messages()[0].content, "When did West Side Story premiere?");
    assert_eq!(conversation.messages()[3].role, Role::Assistant);
}

#[tokio::test]
async fn chat_prompt_carries_sources_and_history() {
    let service = service();
    let config = config();
    service.put_blob(CONTAINER, "philharmonic.txt", PHILHARMONIC);
    provisioned(&service, &config).await;

    let model = Arc::new(ScriptedModel { seen: Mutex::new(Vec::new()) });
    let assistant = Assistant::new(executor(&service, &config), SharedModel(model.clone()));

    let (conversation, _) = assistant.respond(Conversation::new(), "West Side Story premiere").await.unwrap();
    assistant.respond(conversation, "Who played it?").await.unwrap();

    let seen = model.seen.lock().unwrap();
    let first = &seen[0];
    assert_eq!(first.len(), 1);
    assert!(first[0].content.contains("Query: West Side Story premiere"));
    assert!(first[0].content.contains(PHILHARMONIC));
    assert!(first[0].content.contains("\"locations\""));

    let second = &seen[1];
    assert_eq!(second.len(), 3);
    assert_eq!(second[0], ChatMessage::user("West Side Story premiere"));
    assert_eq!(second[1], ChatMessage::assistant("answer 1"));
    assert!(second[2].content.contains("Query: Who played it?"));
}

struct SharedModel(Arc<ScriptedModel>);

#[async_trait]
impl CompletionModel for SharedModel {
    async fn complete(&self, messages: &[ChatMessage]) -> grounded_search::Result<String> {
        self.0.complete(messages).await
    }
}
