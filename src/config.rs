use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;

use crate::error::{ ConfigErrors, PipelineError, Result };
use crate::indexer::{
    IndexerConfiguration,
    IndexingSchedule,
    ParsingMode,
    DEFAULT_MAX_FAILED_ITEMS,
    UNLIMITED_FAILURES,
};
use crate::query::{ QueryOptions, DEFAULT_NEAREST_NEIGHBORS, DEFAULT_TOP };
use crate::schema::{ EMBEDDING_DIMENSIONS, EMBEDDING_MODEL };
use crate::skillset::{ SkillsetOptions, MAX_PAGE_LENGTH, PAGE_OVERLAP_LENGTH };

pub const SEARCH_API_VERSION: &str = "2024-07-01";
pub const OPENAI_API_VERSION: &str = "2024-06-01";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const MAX_RESOURCE_NAME_LEN: usize = 128;

/// How requests to the search service authenticate.
#[derive(Clone, PartialEq, Eq)]
pub enum SearchCredential {
    ApiKey(String),
    BearerToken(String),
}

impl fmt::Debug for SearchCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchCredential::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            SearchCredential::BearerToken(_) => f.write_str("BearerToken(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchServiceConfig {
    pub endpoint: String,
    pub credential: SearchCredential,
    pub api_version: String,
    pub timeout: Duration,
}

#[derive(Clone, PartialEq)]
pub struct OpenAiConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub api_version: String,
    pub chat_deployment: Option<String>,
    pub embedding_deployment: String,
    pub embedding_model: String,
    pub dimensions: u32,
}

impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_version", &self.api_version)
            .field("chat_deployment", &self.chat_deployment)
            .field("embedding_deployment", &self.embedding_deployment)
            .field("embedding_model", &self.embedding_model)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

/// Everything the chat completion client needs, checked only when chat is used.
#[derive(Clone, PartialEq)]
pub struct ChatConfig {
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
    pub deployment: String,
    pub timeout: Duration,
}

impl fmt::Debug for ChatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("api_version", &self.api_version)
            .field("deployment", &self.deployment)
            .finish()
    }
}

#[derive(Clone, PartialEq)]
pub struct StorageConfig {
    pub connection_string: String,
    pub container: String,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("connection_string", &"<redacted>")
            .field("container", &self.container)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub index: String,
    pub skillset: String,
    pub indexer: String,
    pub data_source: String,
}

impl Default for ResourceNames {
    fn default() -> Self {
        Self {
            index: "default-idx".to_string(),
            skillset: "default-ss".to_string(),
            indexer: "default-idxr".to_string(),
            data_source: "default-ds".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub max_page_length: u32,
    pub page_overlap_length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexingConfig {
    pub schedule: IndexingSchedule,
    pub max_failed_items: i32,
    /// `None` leaves parsing to the service default.
    pub configuration: Option<IndexerConfiguration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryConfig {
    pub top: usize,
    pub nearest_neighbors: usize,
}

/// Validated settings for provisioning and querying.
#[derive(Clone, PartialEq)]
pub struct PipelineConfig {
    pub search: SearchServiceConfig,
    pub open_ai: OpenAiConfig,
    pub storage: StorageConfig,
    pub cognitive_services_key: String,
    pub names: ResourceNames,
    pub chunking: ChunkingConfig,
    pub indexing: IndexingConfig,
    pub query: QueryConfig,
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("search", &self.search)
            .field("open_ai", &self.open_ai)
            .field("storage", &self.storage)
            .field("cognitive_services_key", &"<redacted>")
            .field("names", &self.names)
            .field("chunking", &self.chunking)
            .field("indexing", &self.indexing)
            .field("query", &self.query)
            .finish()
    }
}

/// Collects every violation instead of stopping at the first one.
struct Reader<F> {
    lookup: F,
    errors: ConfigErrors,
}

impl<F: Fn(&str) -> Option<String>> Reader<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&mut self, key: &str) -> String {
        match self.optional(key) {
            Some(value) => value,
            None => {
                self.errors.push(format!("{} is required", key));
                String::new()
            }
        }
    }

    fn url(&mut self, key: &str) -> String {
        let value = self.required(key);
        if value.is_empty() {
            return value;
        }
        match Url::parse(&value) {
            Ok(url) if url.scheme() == "https" || url.scheme() == "http" => {
                value.trim_end_matches('/').to_string()
            }
            Ok(url) => {
                self.errors.push(format!("{} must be an http(s) URL, got scheme '{}'", key, url.scheme()));
                value
            }
            Err(e) => {
                self.errors.push(format!("{} is not a valid URL: {}", key, e));
                value
            }
        }
    }

    fn name(&mut self, key: &str, default: &str) -> String {
        let value = self.optional(key).unwrap_or_else(|| default.to_string());
        if let Err(reason) = check_resource_name(&value) {
            self.errors.push(format!("{} '{}' {}", key, value, reason));
        }
        value
    }

    fn number<T: FromStr + Copy>(&mut self, key: &str, default: T) -> T {
        match self.optional(key) {
            None => default,
            Some(raw) =>
                match raw.parse::<T>() {
                    Ok(v) => v,
                    Err(_) => {
                        self.errors.push(format!("{} must be a number, got '{}'", key, raw));
                        default
                    }
                }
        }
    }

    fn positive(&mut self, key: &str, default: u64) -> u64 {
        let value = self.number(key, default);
        if value == 0 {
            self.errors.push(format!("{} must be positive", key));
        }
        value
    }
}

/// Resource names: lowercase letters, digits and dashes, alphanumeric at both ends.
pub fn check_resource_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() || name.len() > MAX_RESOURCE_NAME_LEN {
        return Err("must be 1 to 128 characters long");
    }
    if !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return Err("may only contain lowercase letters, digits and dashes");
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err("must start and end with a letter or digit");
    }
    Ok(())
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
        let mut r = Reader { lookup, errors: ConfigErrors::default() };

        let endpoint = r.url("AZURE_SEARCH_SERVICE");
        let credential = match (r.optional("AZURE_SEARCH_API_KEY"), r.optional("AZURE_SEARCH_TOKEN")) {
            (Some(key), None) => SearchCredential::ApiKey(key),
            (None, Some(token)) => SearchCredential::BearerToken(token),
            (Some(key), Some(_)) => {
                r.errors.push("set only one of AZURE_SEARCH_API_KEY and AZURE_SEARCH_TOKEN");
                SearchCredential::ApiKey(key)
            }
            (None, None) => {
                r.errors.push("AZURE_SEARCH_API_KEY or AZURE_SEARCH_TOKEN is required");
                SearchCredential::ApiKey(String::new())
            }
        };
        let search = SearchServiceConfig {
            endpoint,
            credential,
            api_version: r.optional("AZURE_SEARCH_API_VERSION").unwrap_or_else(|| SEARCH_API_VERSION.to_string()),
            timeout: Duration::from_secs(r.positive("SEARCH_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)),
        };

        let dimensions = r.positive("AZURE_OPENAI_EMBEDDING_DIMENSIONS", EMBEDDING_DIMENSIONS as u64);
        let open_ai = OpenAiConfig {
            endpoint: r.url("AZURE_OPENAI_ENDPOINT"),
            api_key: r.optional("AZURE_OPENAI_API_KEY"),
            api_version: r.optional("AZURE_OPENAI_API_VERSION").unwrap_or_else(|| OPENAI_API_VERSION.to_string()),
            chat_deployment: r.optional("AZURE_OPENAI_MODEL"),
            embedding_deployment: r
                .optional("AZURE_OPENAI_EMBEDDING_DEPLOYMENT")
                .unwrap_or_else(|| EMBEDDING_MODEL.to_string()),
            embedding_model: r.optional("AZURE_OPENAI_EMBEDDING_MODEL").unwrap_or_else(|| EMBEDDING_MODEL.to_string()),
            dimensions: u32::try_from(dimensions).unwrap_or(EMBEDDING_DIMENSIONS),
        };

        let storage = StorageConfig {
            connection_string: r.required("AZURE_STORAGE_CONNECTION"),
            container: r
                .optional("AZURE_STORAGE_CONTAINER_NAME")
                .unwrap_or_else(|| "default-container".to_string()),
        };
        let cognitive_services_key = r.required("AZURE_AI_COGNITIVE_SERVICES_KEY");

        let defaults = ResourceNames::default();
        let names = ResourceNames {
            index: r.name("AZURE_SEARCH_INDEX_NAME", &defaults.index),
            skillset: r.name("AZURE_SEARCH_SKILLSET_NAME", &defaults.skillset),
            indexer: r.name("AZURE_SEARCH_INDEXER_NAME", &defaults.indexer),
            data_source: r.name("AZURE_SEARCH_DATA_SOURCE", &defaults.data_source),
        };

        let chunking = ChunkingConfig {
            max_page_length: r.number("SEARCH_CHUNK_MAX_LENGTH", MAX_PAGE_LENGTH),
            page_overlap_length: r.number("SEARCH_CHUNK_OVERLAP", PAGE_OVERLAP_LENGTH),
        };
        if chunking.page_overlap_length >= chunking.max_page_length {
            r.errors.push(
                format!(
                    "SEARCH_CHUNK_OVERLAP ({}) must be less than SEARCH_CHUNK_MAX_LENGTH ({})",
                    chunking.page_overlap_length,
                    chunking.max_page_length
                )
            );
        }

        let minutes = r.number("SEARCH_INDEXER_INTERVAL_MINUTES", 120u64);
        let schedule = match minutes.checked_mul(60).map(|secs| IndexingSchedule::every(Duration::from_secs(secs))) {
            Some(Ok(schedule)) => schedule,
            _ => {
                r.errors.push(
                    format!("SEARCH_INDEXER_INTERVAL_MINUTES must be between 5 and 1440, got {}", minutes)
                );
                IndexingSchedule::default()
            }
        };
        let max_failed_items = r.number("SEARCH_INDEXER_MAX_FAILED_ITEMS", DEFAULT_MAX_FAILED_ITEMS);
        if max_failed_items < UNLIMITED_FAILURES {
            r.errors.push("SEARCH_INDEXER_MAX_FAILED_ITEMS must be -1 (unlimited) or greater");
        }

        let parsing_mode = r.optional("SEARCH_INDEXER_PARSING_MODE").and_then(|raw| {
            match raw.parse::<ParsingMode>() {
                Ok(mode) => Some(mode),
                Err(reason) => {
                    r.errors.push(
                        format!("SEARCH_INDEXER_PARSING_MODE {}; expected default, text, json, jsonArray or jsonLines", reason)
                    );
                    None
                }
            }
        });
        let document_root = r.optional("SEARCH_INDEXER_DOCUMENT_ROOT");
        if let Some(root) = &document_root {
            if !root.starts_with('/') {
                r.errors.push(format!("SEARCH_INDEXER_DOCUMENT_ROOT must be a JSON pointer starting with '/', got '{}'", root));
            }
            if !parsing_mode.map_or(false, ParsingMode::is_json) {
                r.errors.push("SEARCH_INDEXER_DOCUMENT_ROOT requires a JSON SEARCH_INDEXER_PARSING_MODE");
            }
        }
        let configuration = parsing_mode.map(|parsing_mode| IndexerConfiguration { parsing_mode, document_root });

        let query = QueryConfig {
            top: r.positive("SEARCH_TOP", DEFAULT_TOP as u64) as usize,
            nearest_neighbors: r.positive("SEARCH_VECTOR_K", DEFAULT_NEAREST_NEIGHBORS as u64) as usize,
        };

        r.errors.into_result()?;

        Ok(Self {
            search,
            open_ai,
            storage,
            cognitive_services_key,
            names,
            chunking,
            indexing: IndexingConfig { schedule, max_failed_items, configuration },
            query,
        })
    }

    pub fn skillset_options(&self) -> SkillsetOptions {
        SkillsetOptions {
            max_page_length: self.chunking.max_page_length,
            page_overlap_length: self.chunking.page_overlap_length,
            embedding_deployment: self.open_ai.embedding_deployment.clone(),
            embedding_model: self.open_ai.embedding_model.clone(),
            dimensions: self.open_ai.dimensions,
            ..SkillsetOptions::default()
        }
    }

    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            top: self.query.top,
            nearest_neighbors: self.query.nearest_neighbors,
            ..QueryOptions::default()
        }
    }

    /// Chat settings; fails with every missing key when chat was not configured.
    pub fn chat(&self) -> Result<ChatConfig> {
        let mut errors = ConfigErrors::default();
        if self.open_ai.api_key.is_none() {
            errors.push("AZURE_OPENAI_API_KEY is required for chat");
        }
        if self.open_ai.chat_deployment.is_none() {
            errors.push("AZURE_OPENAI_MODEL is required for chat");
        }
        errors.into_result()?;

        match (&self.open_ai.api_key, &self.open_ai.chat_deployment) {
            (Some(api_key), Some(deployment)) =>
                Ok(ChatConfig {
                    endpoint: self.open_ai.endpoint.clone(),
                    api_key: api_key.clone(),
                    api_version: self.open_ai.api_version.clone(),
                    deployment: deployment.clone(),
                    timeout: Duration::from_secs(300),
                }),
            _ => Err(PipelineError::config("chat is not configured")),
        }
    }
}
