//! In-process stand-in for the managed search service.
//!
//! It honours the service's observable contract (create-or-update by name,
//! reference checks, indexer runs with a failure tolerance, page projection,
//! `top`/`select` on queries) so provisioning and retrieval can be exercised
//! without a network. Vector similarity and semantic re-ranking are accepted
//! and validated but not scored: hits are ordered by lexical term overlap.

use async_trait::async_trait;
use base64::{ engine::general_purpose::URL_SAFE_NO_PAD, Engine as _ };
use chrono::Utc;
use serde_json::{ Map, Value };
use std::collections::{ BTreeMap, HashMap, HashSet };
use std::sync::{ PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard };
use log::{ info, debug, warn };

use super::SearchService;
use crate::datasource::DataSourceConnection;
use crate::error::{ PipelineError, ResourceKind, Result };
use crate::indexer::{
    ExecutionResult,
    ExecutionStatus,
    Indexer,
    IndexerConfiguration,
    IndexerServiceStatus,
    IndexerStatus,
    ItemError,
    ParsingMode,
};
use crate::query::{ QueryRequest, SearchHit };
use crate::schema::{ IndexSchema, CHUNK_FIELD, LOCATIONS_FIELD, TITLE_FIELD };
use crate::skillset::{ Skill, Skillset, CONTENT_SOURCE, PAGES_CONTEXT, STORAGE_NAME_SOURCE };

const HISTORY_LIMIT: usize = 50;

/// Named-entity extraction used by the entity recognition skill.
pub trait EntityRecognizer: Send + Sync {
    fn recognize(&self, text: &str, categories: &[String], language: Option<&str>) -> Vec<String>;
}

/// Recognizes nothing; pages are indexed with empty entity lists.
pub struct NoEntities;

impl EntityRecognizer for NoEntities {
    fn recognize(&self, _text: &str, _categories: &[String], _language: Option<&str>) -> Vec<String> {
        Vec::new()
    }
}

/// Recognizes a fixed list of names per category, in order of first appearance.
#[derive(Debug, Clone, Default)]
pub struct Gazetteer {
    entries: Vec<(String, String)>,
}

impl Gazetteer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, category: &str, names: &[&str]) -> Self {
        self.entries.extend(names.iter().map(|n| (category.to_string(), n.to_string())));
        self
    }
}

impl EntityRecognizer for Gazetteer {
    fn recognize(&self, text: &str, categories: &[String], _language: Option<&str>) -> Vec<String> {
        let mut found: Vec<(usize, &str)> = self.entries
            .iter()
            .filter(|(category, _)| categories.iter().any(|c| c == category))
            .filter_map(|(_, name)| text.find(name.as_str()).map(|at| (at, name.as_str())))
            .collect();
        found.sort();
        found.dedup_by(|a, b| a.1 == b.1);
        found
            .into_iter()
            .map(|(_, name)| name.to_string())
            .collect()
    }
}

type Document = Map<String, Value>;

#[derive(Default)]
struct State {
    indexes: HashMap<String, IndexSchema>,
    documents: HashMap<String, BTreeMap<String, Document>>,
    data_sources: HashMap<String, DataSourceConnection>,
    skillsets: HashMap<String, Skillset>,
    indexers: HashMap<String, Indexer>,
    history: HashMap<String, Vec<ExecutionResult>>,
    containers: HashMap<String, BTreeMap<String, Vec<u8>>>,
}

pub struct InMemorySearchService {
    state: RwLock<State>,
    recognizer: Box<dyn EntityRecognizer>,
    storage_connection: Option<String>,
    cognitive_services_key: Option<String>,
}

impl Default for InMemorySearchService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySearchService {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            recognizer: Box::new(NoEntities),
            storage_connection: None,
            cognitive_services_key: None,
        }
    }

    pub fn with_recognizer(mut self, recognizer: impl EntityRecognizer + 'static) -> Self {
        self.recognizer = Box::new(recognizer);
        self
    }

    /// Data sources must present exactly this connection string.
    pub fn require_storage_connection(mut self, connection_string: &str) -> Self {
        self.storage_connection = Some(connection_string.to_string());
        self
    }

    /// Skillsets must present exactly this cognitive services key.
    pub fn require_cognitive_services_key(mut self, key: &str) -> Self {
        self.cognitive_services_key = Some(key.to_string());
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put_blob(&self, container: &str, name: &str, content: impl Into<Vec<u8>>) {
        self.write()
            .containers
            .entry(container.to_string())
            .or_default()
            .insert(name.to_string(), content.into());
    }

    pub fn delete_blob(&self, container: &str, name: &str) -> bool {
        self.write()
            .containers
            .get_mut(container)
            .map_or(false, |blobs| blobs.remove(name).is_some())
    }

    /// Names of the stored resources of one kind, sorted.
    pub fn resource_names(&self, kind: ResourceKind) -> Vec<String> {
        let state = self.read();
        let mut names: Vec<String> = match kind {
            ResourceKind::Index => state.indexes.keys().cloned().collect(),
            ResourceKind::DataSource => state.data_sources.keys().cloned().collect(),
            ResourceKind::Skillset => state.skillsets.keys().cloned().collect(),
            ResourceKind::Indexer => state.indexers.keys().cloned().collect(),
            ResourceKind::Container => state.containers.keys().cloned().collect(),
        };
        names.sort();
        names
    }

    /// Stored documents of an index in key order.
    pub fn documents(&self, index: &str) -> Vec<Value> {
        self.read()
            .documents.get(index)
            .map(|docs| docs.values().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    fn execute(&self, state: &mut State, indexer_name: &str) -> Result<ExecutionResult> {
        let indexer = state.indexers
            .get(indexer_name)
            .cloned()
            .ok_or_else(|| PipelineError::not_found(ResourceKind::Indexer, indexer_name))?;

        // Start times of one indexer's runs strictly increase.
        let mut start_time = Utc::now();
        if let Some(previous) = state.history
            .get(indexer_name)
            .and_then(|h| h.first())
            .and_then(|r| r.start_time)
        {
            if start_time <= previous {
                start_time = previous + chrono::Duration::microseconds(1);
            }
        }

        let outcome = self.ingest(state, &indexer);
        let end_time = Some(Utc::now().max(start_time));
        let result = match outcome {
            Ok((processed, errors)) => {
                let failed = errors.len();
                let tolerated = indexer.parameters
                    .as_ref()
                    .map_or(failed == 0, |p| p.tolerates(failed));
                ExecutionResult {
                    status: if tolerated { ExecutionStatus::Success } else { ExecutionStatus::TransientFailure },
                    error_message: if tolerated {
                        None
                    } else {
                        Some(
                            format!(
                                "{} items failed, exceeding maxFailedItems {}",
                                failed,
                                indexer.max_failed_items()
                            )
                        )
                    },
                    start_time: Some(start_time),
                    end_time,
                    items_processed: processed,
                    items_failed: failed,
                    errors,
                }
            }
            Err(reason) => {
                warn!("Indexer '{}' run failed: {}", indexer_name, reason);
                ExecutionResult {
                    status: ExecutionStatus::TransientFailure,
                    error_message: Some(reason),
                    start_time: Some(start_time),
                    end_time,
                    items_processed: 0,
                    items_failed: 0,
                    errors: Vec::new(),
                }
            }
        };

        info!(
            "Indexer '{}' run: {:?}, {} processed, {} failed",
            indexer_name,
            result.status,
            result.items_processed,
            result.items_failed
        );
        let history = state.history.entry(indexer_name.to_string()).or_default();
        history.insert(0, result.clone());
        history.truncate(HISTORY_LIMIT);
        Ok(result)
    }

    /// Runs every blob of the indexer's container through the skillset and into the index.
    /// Returns processed count and per-item errors, or a run-level failure reason.
    fn ingest(&self, state: &mut State, indexer: &Indexer) -> std::result::Result<(usize, Vec<ItemError>), String> {
        let data_source = state.data_sources
            .get(&indexer.data_source_name)
            .cloned()
            .ok_or_else(|| format!("data source '{}' no longer exists", indexer.data_source_name))?;
        let index = state.indexes
            .get(&indexer.target_index_name)
            .cloned()
            .ok_or_else(|| format!("index '{}' no longer exists", indexer.target_index_name))?;
        let skillset = match &indexer.skillset_name {
            Some(name) =>
                Some(
                    state.skillsets
                        .get(name)
                        .cloned()
                        .ok_or_else(|| format!("skillset '{}' no longer exists", name))?
                ),
            None => None,
        };
        let blobs = state.containers
            .get(data_source.container_name())
            .cloned()
            .ok_or_else(|| format!("container '{}' does not exist", data_source.container_name()))?;
        let key_field = index
            .key_field()
            .map(|f| f.name.clone())
            .ok_or_else(|| format!("index '{}' has no key field", index.name))?;

        let documents = state.documents.entry(index.name.clone()).or_default();
        let mut processed = 0;
        let mut errors = Vec::new();

        let configuration = indexer.configuration();
        let mut owner_fields = vec![key_field.clone()];
        if let Some(projection) = skillset.as_ref().and_then(|s| s.index_projections.as_ref()) {
            owner_fields.extend(
                projection.selectors
                    .iter()
                    .filter(|s| s.target_index_name == index.name)
                    .map(|s| s.parent_key_field_name.clone())
            );
        }

        for (blob_name, bytes) in &blobs {
            let Ok(text) = std::str::from_utf8(bytes) else {
                debug!("Blob '{}' is not valid UTF-8", blob_name);
                errors.push(ItemError {
                    key: Some(blob_name.clone()),
                    error_message: "could not extract text from document".to_string(),
                });
                continue;
            };

            let path = format!("{}/{}", data_source.container_name(), blob_name);
            documents.retain(|_, doc| {
                !owner_fields
                    .iter()
                    .filter_map(|f| doc.get(f).and_then(Value::as_str))
                    .any(|key| key_belongs_to(key, &path))
            });

            for (element, content) in split_documents(text, configuration) {
                let (item_path, item_name) = match element {
                    Some(n) => (format!("{};{}", path, n), format!("{};{}", blob_name, n)),
                    None => (path.clone(), blob_name.clone()),
                };
                let content = match content {
                    Ok(content) => content,
                    Err(reason) => {
                        debug!("Item '{}' rejected: {}", item_name, reason);
                        errors.push(ItemError { key: Some(item_name), error_message: reason });
                        continue;
                    }
                };
                processed += 1;

                if content.trim().is_empty() {
                    debug!("Item '{}' has no content; nothing to index", item_name);
                    continue;
                }
                let parent_key = URL_SAFE_NO_PAD.encode(&item_path);

                let Some(skillset) = &skillset else {
                    documents.insert(
                        parent_key.clone(),
                        parent_document(&index, &key_field, &parent_key, blob_name, &content)
                    );
                    continue;
                };

                let pages: Vec<&str> = match skillset.split_skill() {
                    Some(split) => split.split(&content),
                    None => vec![content.as_str()],
                };
                if let Some(projection) = &skillset.index_projections {
                    for selector in projection.selectors.iter().filter(|s| s.target_index_name == index.name) {
                        for (n, page) in pages.iter().enumerate() {
                            let enrichments = self.enrich_page(skillset, page);
                            let mut doc = Map::new();
                            for mapping in &selector.mappings {
                                let value = match mapping.source.as_str() {
                                    s if s == PAGES_CONTEXT => Some(Value::String(page.to_string())),
                                    s if s == STORAGE_NAME_SOURCE => Some(Value::String(blob_name.clone())),
                                    s if s == CONTENT_SOURCE => Some(Value::String(content.clone())),
                                    s =>
                                        s
                                            .strip_prefix(PAGES_CONTEXT)
                                            .and_then(|rest| rest.strip_prefix('/'))
                                            .and_then(|target| enrichments.get(target).cloned()),
                                };
                                if let Some(value) = value {
                                    doc.insert(mapping.name.clone(), value);
                                }
                            }
                            let chunk_key = format!("{}_pages_{}", parent_key, n);
                            doc.insert(selector.parent_key_field_name.clone(), Value::String(parent_key.clone()));
                            doc.insert(key_field.clone(), Value::String(chunk_key.clone()));
                            documents.insert(chunk_key, doc);
                        }
                    }
                }
                if skillset.indexes_parent_documents() {
                    documents.insert(
                        parent_key.clone(),
                        parent_document(&index, &key_field, &parent_key, blob_name, &content)
                    );
                }
            }
        }

        Ok((processed, errors))
    }

    /// Outputs of the page-level skills, keyed by target name. Embeddings are not computed.
    fn enrich_page(&self, skillset: &Skillset, page: &str) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        for skill in skillset.skills.iter().filter(|s| s.context() == PAGES_CONTEXT) {
            if let Skill::EntityRecognition(entities) = skill {
                let found = self.recognizer.recognize(
                    page,
                    &entities.categories,
                    entities.default_language_code.as_deref()
                );
                for output in &entities.outputs {
                    out.insert(
                        output.target_name.clone(),
                        Value::Array(found.iter().cloned().map(Value::String).collect())
                    );
                }
            }
        }
        out
    }
}

/// Whether a document key was derived from the blob at `path`, either directly or
/// as element `;n` of a JSON array or lines blob.
fn key_belongs_to(key: &str, path: &str) -> bool {
    let Ok(raw) = URL_SAFE_NO_PAD.decode(key) else {
        return false;
    };
    match raw.strip_prefix(path.as_bytes()) {
        Some([]) => true,
        Some([b';', digits @ ..]) => !digits.is_empty() && digits.iter().all(u8::is_ascii_digit),
        _ => false,
    }
}

/// Splits blob text into indexable items according to the parsing mode. Items from
/// JSON arrays and JSON lines carry their position; a per-item error is a failed item.
fn split_documents(
    text: &str,
    configuration: Option<&IndexerConfiguration>
) -> Vec<(Option<usize>, std::result::Result<String, String>)> {
    let Some(configuration) = configuration else {
        return vec![(None, Ok(text.to_string()))];
    };
    let root = configuration.document_root.as_deref();
    match configuration.parsing_mode {
        ParsingMode::Default | ParsingMode::Text => vec![(None, Ok(text.to_string()))],
        ParsingMode::Json => vec![(None, parse_json(text).and_then(|v| json_content(&v, root)))],
        ParsingMode::JsonArray => {
            let elements = parse_json(text).and_then(|value| {
                let target = match root {
                    Some(pointer) => value.pointer(pointer).cloned(),
                    None => Some(value),
                };
                match target {
                    Some(Value::Array(elements)) => Ok(elements),
                    _ => Err("document is not a JSON array".to_string()),
                }
            });
            match elements {
                Ok(elements) =>
                    elements
                        .iter()
                        .enumerate()
                        .map(|(n, element)| (Some(n), json_content(element, None)))
                        .collect(),
                Err(reason) => vec![(None, Err(reason))],
            }
        }
        ParsingMode::JsonLines =>
            text
                .lines()
                .filter(|line| !line.trim().is_empty())
                .enumerate()
                .map(|(n, line)| (Some(n), parse_json(line).and_then(|v| json_content(&v, root))))
                .collect(),
    }
}

fn parse_json(text: &str) -> std::result::Result<Value, String> {
    serde_json::from_str(text).map_err(|e| format!("could not parse document as JSON: {}", e))
}

/// Text of a JSON document: a string value itself, or the `content` string of an object.
fn json_content(value: &Value, root: Option<&str>) -> std::result::Result<String, String> {
    let value = match root {
        Some(pointer) => value.pointer(pointer).ok_or_else(|| format!("document root '{}' not found", pointer))?,
        None => value,
    };
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Object(fields) =>
            fields
                .get("content")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| "JSON document has no 'content' string".to_string()),
        _ => Err("JSON document has no text content".to_string()),
    }
}

fn parent_document(index: &IndexSchema, key_field: &str, parent_key: &str, blob_name: &str, text: &str) -> Document {
    let mut doc = Map::new();
    doc.insert(key_field.to_string(), Value::String(parent_key.to_string()));
    for (field, value) in [
        (TITLE_FIELD, blob_name),
        (CHUNK_FIELD, text),
        ("metadata_storage_name", blob_name),
        ("content", text),
    ] {
        if index.field(field).is_some() {
            doc.insert(field.to_string(), Value::String(value.to_string()));
        }
    }
    doc
}

fn bad_request(message: String) -> PipelineError {
    PipelineError::Remote { status: 400, message }
}

fn tokens(text: &str) -> HashSet<String> {
    text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn text_of(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push_str(s);
            out.push(' ');
        }
        Value::Array(items) => items.iter().for_each(|v| text_of(v, out)),
        _ => {}
    }
}

fn string_field(doc: &Document, name: &str) -> String {
    doc.get(name).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn validate_query(index: &IndexSchema, request: &QueryRequest) -> Result<()> {
    for name in &request.select {
        if index.field(name).is_none() {
            return Err(bad_request(format!("Could not find a property named '{}' on type 'search.document'.", name)));
        }
    }
    for vq in &request.vector_queries {
        for name in vq.fields.split(',').map(str::trim) {
            match index.field(name) {
                Some(f) if f.field_type.is_vector() => {}
                _ => {
                    return Err(bad_request(format!("The field '{}' is not a vector field.", name)));
                }
            }
        }
        if vq.k == 0 {
            return Err(bad_request("k must be positive".to_string()));
        }
    }
    if let Some(config) = &request.semantic_configuration {
        if index.semantic_config(config).is_none() {
            return Err(bad_request(format!("Unknown semantic configuration '{}'.", config)));
        }
    } else if request.query_type.as_deref() == Some("semantic") {
        return Err(bad_request("Semantic queries need a semantic configuration.".to_string()));
    }
    Ok(())
}

fn check_fields_compatible(existing: &IndexSchema, updated: &IndexSchema) -> Result<()> {
    for field in &existing.fields {
        match updated.field(&field.name) {
            Some(f) if f.field_type == field.field_type && f.key == field.key => {}
            _ => {
                return Err(
                    bad_request(
                        format!(
                            "Index '{}' cannot be updated: existing field '{}' was removed or changed",
                            existing.name,
                            field.name
                        )
                    )
                );
            }
        }
    }
    Ok(())
}

#[async_trait]
impl SearchService for InMemorySearchService {
    async fn upsert_index(&self, index: &IndexSchema) -> Result<IndexSchema> {
        index.validate()?;
        let mut state = self.write();
        if let Some(existing) = state.indexes.get(&index.name) {
            check_fields_compatible(existing, index)?;
        }
        let created = state.indexes.insert(index.name.clone(), index.clone()).is_none();
        state.documents.entry(index.name.clone()).or_default();
        info!("index '{}' {}", index.name, if created { "created" } else { "updated" });
        Ok(index.clone())
    }

    async fn upsert_data_source(&self, data_source: &DataSourceConnection) -> Result<DataSourceConnection> {
        data_source.validate()?;
        if let Some(expected) = &self.storage_connection {
            if data_source.credentials.connection_string.as_deref() != Some(expected.as_str()) {
                return Err(PipelineError::Auth {
                    status: 403,
                    message: format!("credentials of data source '{}' were rejected by storage", data_source.name),
                });
            }
        }
        let mut state = self.write();
        let created = state.data_sources.insert(data_source.name.clone(), data_source.clone()).is_none();
        info!("data source '{}' {}", data_source.name, if created { "created" } else { "updated" });

        let mut stored = data_source.clone();
        stored.credentials.connection_string = None;
        Ok(stored)
    }

    async fn upsert_skillset(&self, skillset: &Skillset) -> Result<Skillset> {
        skillset.validate()?;
        if let Some(expected) = &self.cognitive_services_key {
            let presented = skillset.cognitive_services.as_ref().and_then(|c| c.key());
            if presented != Some(expected.as_str()) {
                return Err(PipelineError::Auth {
                    status: 403,
                    message: format!("cognitive services key of skillset '{}' was rejected", skillset.name),
                });
            }
        }
        let mut state = self.write();
        if let Some(projection) = &skillset.index_projections {
            for selector in &projection.selectors {
                let index = state.indexes
                    .get(&selector.target_index_name)
                    .ok_or_else(|| PipelineError::not_found(ResourceKind::Index, &selector.target_index_name))?;
                skillset.validate_against(index)?;
            }
        }
        let created = state.skillsets.insert(skillset.name.clone(), skillset.clone()).is_none();
        info!("skillset '{}' {}", skillset.name, if created { "created" } else { "updated" });
        Ok(skillset.clone())
    }

    async fn upsert_indexer(&self, indexer: &Indexer) -> Result<Indexer> {
        indexer.validate()?;
        let mut state = self.write();
        if !state.data_sources.contains_key(&indexer.data_source_name) {
            return Err(PipelineError::not_found(ResourceKind::DataSource, &indexer.data_source_name));
        }
        if !state.indexes.contains_key(&indexer.target_index_name) {
            return Err(PipelineError::not_found(ResourceKind::Index, &indexer.target_index_name));
        }
        if let Some(name) = &indexer.skillset_name {
            if !state.skillsets.contains_key(name) {
                return Err(PipelineError::not_found(ResourceKind::Skillset, name));
            }
        }

        let created = state.indexers.insert(indexer.name.clone(), indexer.clone()).is_none();
        info!("indexer '{}' {}", indexer.name, if created { "created" } else { "updated" });
        if created {
            self.execute(&mut state, &indexer.name)?;
        }
        Ok(indexer.clone())
    }

    async fn run_indexer(&self, name: &str) -> Result<()> {
        let mut state = self.write();
        self.execute(&mut state, name)?;
        Ok(())
    }

    async fn indexer_status(&self, name: &str) -> Result<IndexerStatus> {
        let state = self.read();
        if !state.indexers.contains_key(name) {
            return Err(PipelineError::not_found(ResourceKind::Indexer, name));
        }
        let history = state.history.get(name).cloned().unwrap_or_default();
        Ok(IndexerStatus {
            status: IndexerServiceStatus::Running,
            last_result: history.first().cloned(),
            execution_history: history,
        })
    }

    async fn search(&self, index: &str, request: &QueryRequest) -> Result<Vec<SearchHit>> {
        let state = self.read();
        let schema = state.indexes.get(index).ok_or_else(|| PipelineError::not_found(ResourceKind::Index, index))?;
        validate_query(schema, request)?;
        if !request.vector_queries.is_empty() || request.semantic_configuration.is_some() {
            debug!("Vector and semantic signals are not scored in memory; ranking lexically");
        }

        let Some(documents) = state.documents.get(index) else {
            return Ok(Vec::new());
        };
        let searchable: Vec<&str> = schema.fields
            .iter()
            .filter(|f| !f.key && f.field_type.is_text() && f.is_searchable())
            .map(|f| f.name.as_str())
            .collect();
        let query_tokens = tokens(&request.search);
        let match_all = request.search.trim().is_empty() || request.search.trim() == "*";

        let mut scored: Vec<(f64, &String, &Document)> = documents
            .iter()
            .filter_map(|(key, doc)| {
                if match_all {
                    return Some((1.0, key, doc));
                }
                let mut text = String::new();
                for field in &searchable {
                    if let Some(value) = doc.get(*field) {
                        text_of(value, &mut text);
                    }
                }
                let doc_tokens = tokens(&text);
                let matched = query_tokens.intersection(&doc_tokens).count();
                if matched == 0 {
                    None
                } else {
                    Some(((matched as f64) / (query_tokens.len() as f64), key, doc))
                }
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));

        let selected = |name: &str| request.select.is_empty() || request.select.iter().any(|s| s == name);
        let hits = scored
            .into_iter()
            .take(request.top)
            .map(|(score, _, doc)| SearchHit {
                score,
                reranker_score: None,
                title: if selected(TITLE_FIELD) { string_field(doc, TITLE_FIELD) } else { String::new() },
                chunk: if selected(CHUNK_FIELD) { string_field(doc, CHUNK_FIELD) } else { String::new() },
                locations: if selected(LOCATIONS_FIELD) {
                    doc.get(LOCATIONS_FIELD)
                        .and_then(Value::as_array)
                        .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
                        .unwrap_or_default()
                } else {
                    Vec::new()
                },
            })
            .collect();
        Ok(hits)
    }

    async fn count_documents(&self, index: &str) -> Result<usize> {
        let state = self.read();
        if !state.indexes.contains_key(index) {
            return Err(PipelineError::not_found(ResourceKind::Index, index));
        }
        Ok(state.documents.get(index).map_or(0, BTreeMap::len))
    }
}
