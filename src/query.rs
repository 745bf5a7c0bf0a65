use std::sync::Arc;

use log::{ debug, info };
use serde::{ Deserialize, Serialize };

use crate::error::Result;
use crate::schema::{ CHUNK_FIELD, LOCATIONS_FIELD, SEMANTIC_CONFIG, TITLE_FIELD, VECTOR_FIELD };
use crate::service::SearchService;

pub const DEFAULT_TOP: usize = 5;
pub const DEFAULT_NEAREST_NEIGHBORS: usize = 50;

/// Vector sub-query the service vectorizes itself from `text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorQuery {
    pub kind: String,
    pub text: String,
    pub k: usize,
    pub fields: String,
}

impl VectorQuery {
    pub fn text(text: &str, k: usize, field: &str) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.to_string(),
            k,
            fields: field.to_string(),
        }
    }
}

/// Body of a hybrid query: lexical match, vector similarity and semantic re-ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub search: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vector_queries: Vec<VectorQuery>,
    #[serde(
        serialize_with = "serialize_select",
        deserialize_with = "deserialize_select",
        skip_serializing_if = "Vec::is_empty",
        default
    )]
    pub select: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_configuration: Option<String>,
    pub top: usize,
}

fn serialize_select<S: serde::Serializer>(select: &[String], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&select.join(","))
}

fn deserialize_select<'de, D: serde::Deserializer<'de>>(
    deserializer: D
) -> std::result::Result<Vec<String>, D::Error> {
    let text = String::deserialize(deserializer)?;
    Ok(
        text
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    )
}

/// Tunables of the hybrid query. Scoring itself stays with the service.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub top: usize,
    pub nearest_neighbors: usize,
    pub vector_field: String,
    pub semantic_configuration: Option<String>,
    pub select: Vec<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top: DEFAULT_TOP,
            nearest_neighbors: DEFAULT_NEAREST_NEIGHBORS,
            vector_field: VECTOR_FIELD.to_string(),
            semantic_configuration: Some(SEMANTIC_CONFIG.to_string()),
            select: vec![TITLE_FIELD.to_string(), CHUNK_FIELD.to_string(), LOCATIONS_FIELD.to_string()],
        }
    }
}

impl QueryRequest {
    pub fn hybrid(text: &str, options: &QueryOptions) -> Self {
        Self {
            search: text.to_string(),
            vector_queries: vec![VectorQuery::text(text, options.nearest_neighbors, &options.vector_field)],
            select: options.select.clone(),
            query_type: options.semantic_configuration.as_ref().map(|_| "semantic".to_string()),
            semantic_configuration: options.semantic_configuration.clone(),
            top: options.top,
        }
    }
}

/// One ranked result with the fields the grounding prompt needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "@search.score", default)]
    pub score: f64,
    #[serde(rename = "@search.rerankerScore", default, skip_serializing_if = "Option::is_none")]
    pub reranker_score: Option<f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub chunk: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub locations: Vec<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
    where D: serde::Deserializer<'de>, T: Default + Deserialize<'de>
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueryResponse {
    #[serde(default)]
    pub value: Vec<SearchHit>,
}

/// Runs hybrid queries against one index. Holds no per-call state, so one executor
/// can serve any number of concurrent chat sessions.
#[derive(Clone)]
pub struct QueryExecutor {
    service: Arc<dyn SearchService>,
    index_name: String,
    options: QueryOptions,
}

impl QueryExecutor {
    pub fn new(service: Arc<dyn SearchService>, index_name: &str) -> Self {
        Self::with_options(service, index_name, QueryOptions::default())
    }

    pub fn with_options(service: Arc<dyn SearchService>, index_name: &str, options: QueryOptions) -> Self {
        Self {
            service,
            index_name: index_name.to_string(),
            options,
        }
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Ranked hits for `text`, at most `options.top` of them. No match is an empty
    /// result, not an error.
    pub async fn search(&self, text: &str) -> Result<Vec<SearchHit>> {
        let request = QueryRequest::hybrid(text, &self.options);
        debug!("Hybrid query against '{}': {:?}", self.index_name, request);

        let mut hits = self.service.search(&self.index_name, &request).await?;
        hits.truncate(self.options.top);

        info!("Query against '{}' returned {} hits", self.index_name, hits.len());
        Ok(hits)
    }
}
