use serde::{ Deserialize, Serialize };

use crate::error::{ PipelineError, ResourceKind, Result };

pub const KEY_FIELD: &str = "chunk_id";
pub const PARENT_KEY_FIELD: &str = "parent_id";
pub const TITLE_FIELD: &str = "title";
pub const CHUNK_FIELD: &str = "chunk";
pub const LOCATIONS_FIELD: &str = "locations";
pub const VECTOR_FIELD: &str = "text_vector";

pub const EMBEDDING_DIMENSIONS: u32 = 1024;
pub const EMBEDDING_MODEL: &str = "text-embedding-3-large";

pub const HNSW_ALGORITHM: &str = "myHnsw";
pub const VECTOR_PROFILE: &str = "myHnswProfile";
pub const VECTORIZER: &str = "myOpenAI";
pub const SEMANTIC_CONFIG: &str = "my-semantic-config";

/// Entity data types understood by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    #[serde(rename = "Edm.String")]
    String,
    #[serde(rename = "Edm.Int32")]
    Int32,
    #[serde(rename = "Edm.Int64")]
    Int64,
    #[serde(rename = "Edm.Double")]
    Double,
    #[serde(rename = "Edm.Boolean")]
    Boolean,
    #[serde(rename = "Edm.DateTimeOffset")]
    DateTimeOffset,
    #[serde(rename = "Collection(Edm.String)")]
    StringCollection,
    #[serde(rename = "Collection(Edm.Single)")]
    SingleCollection,
}

impl FieldType {
    pub fn is_vector(&self) -> bool {
        matches!(self, FieldType::SingleCollection)
    }

    pub fn is_text(&self) -> bool {
        matches!(self, FieldType::String | FieldType::StringCollection)
    }
}

/// One field of an index. Unset flags fall back to the service defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub searchable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filterable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sortable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facetable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<String>,
    #[serde(rename = "dimensions", skip_serializing_if = "Option::is_none")]
    pub vector_dimensions: Option<u32>,
    #[serde(rename = "vectorSearchProfile", skip_serializing_if = "Option::is_none")]
    pub vector_profile: Option<String>,
}

impl SearchField {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            key: false,
            searchable: None,
            filterable: None,
            sortable: None,
            facetable: None,
            analyzer: None,
            vector_dimensions: None,
            vector_profile: None,
        }
    }

    pub fn vector(name: &str, dimensions: u32, profile: &str) -> Self {
        let mut field = Self::new(name, FieldType::SingleCollection);
        field.searchable = Some(true);
        field.vector_dimensions = Some(dimensions);
        field.vector_profile = Some(profile.to_string());
        field
    }

    pub fn as_key(mut self) -> Self {
        self.key = true;
        self
    }

    pub fn filterable(mut self, on: bool) -> Self {
        self.filterable = Some(on);
        self
    }

    pub fn sortable(mut self, on: bool) -> Self {
        self.sortable = Some(on);
        self
    }

    pub fn facetable(mut self, on: bool) -> Self {
        self.facetable = Some(on);
        self
    }

    pub fn analyzer(mut self, analyzer: &str) -> Self {
        self.analyzer = Some(analyzer.to_string());
        self
    }

    /// Strings are full-text searchable unless switched off explicitly.
    pub fn is_searchable(&self) -> bool {
        self.searchable.unwrap_or(self.field_type.is_text())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HnswParameters {
    pub m: u32,
    pub ef_construction: u32,
    pub ef_search: u32,
    pub metric: String,
}

impl Default for HnswParameters {
    fn default() -> Self {
        Self {
            m: 4,
            ef_construction: 400,
            ef_search: 500,
            metric: "cosine".to_string(),
        }
    }
}

/// Approximate-nearest-neighbour algorithm configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorAlgorithm {
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hnsw_parameters: Option<HnswParameters>,
}

impl VectorAlgorithm {
    pub fn hnsw(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: "hnsw".to_string(),
            hnsw_parameters: Some(HnswParameters::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorProfile {
    pub name: String,
    #[serde(rename = "algorithm")]
    pub algorithm: String,
    #[serde(rename = "vectorizer")]
    pub vectorizer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureOpenAiParameters {
    #[serde(rename = "resourceUri")]
    pub resource_uri: String,
    pub deployment_id: String,
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Query-time embedding provider the service calls on our behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vectorizer {
    pub name: String,
    pub kind: String,
    #[serde(rename = "azureOpenAIParameters")]
    pub azure_open_ai_parameters: AzureOpenAiParameters,
}

impl Vectorizer {
    pub fn azure_open_ai(name: &str, endpoint: &str, deployment: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: "azureOpenAI".to_string(),
            azure_open_ai_parameters: AzureOpenAiParameters {
                resource_uri: endpoint.to_string(),
                deployment_id: deployment.to_string(),
                model_name: model.to_string(),
                api_key: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VectorSearch {
    #[serde(default)]
    pub algorithms: Vec<VectorAlgorithm>,
    #[serde(default)]
    pub profiles: Vec<VectorProfile>,
    #[serde(default)]
    pub vectorizers: Vec<Vectorizer>,
}

impl VectorSearch {
    pub fn profile(&self, name: &str) -> Option<&VectorProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticField {
    pub field_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrioritizedFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_field: Option<SemanticField>,
    #[serde(default)]
    pub prioritized_content_fields: Vec<SemanticField>,
}

/// Which fields feed the semantic re-ranker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticConfig {
    pub name: String,
    pub prioritized_fields: PrioritizedFields,
}

impl SemanticConfig {
    pub fn new(name: &str, title_field: Option<&str>, content_fields: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            prioritized_fields: PrioritizedFields {
                title_field: title_field.map(|f| SemanticField { field_name: f.to_string() }),
                prioritized_content_fields: content_fields
                    .iter()
                    .map(|f| SemanticField { field_name: f.to_string() })
                    .collect(),
            },
        }
    }

    fn referenced_fields(&self) -> impl Iterator<Item = &str> {
        self.prioritized_fields.title_field
            .iter()
            .chain(self.prioritized_fields.prioritized_content_fields.iter())
            .map(|f| f.field_name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SemanticSearch {
    #[serde(default)]
    pub configurations: Vec<SemanticConfig>,
}

/// The searchable document shape of one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSchema {
    pub name: String,
    pub fields: Vec<SearchField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_search: Option<VectorSearch>,
    #[serde(rename = "semantic", default, skip_serializing_if = "Option::is_none")]
    pub semantic_search: Option<SemanticSearch>,
}

impl IndexSchema {
    /// The canonical chunk index: one record per page of a source document, with a
    /// 1024-dimension embedding produced by the named OpenAI deployment.
    pub fn define(name: &str, open_ai_endpoint: &str) -> Result<Self> {
        Self::define_with(name, open_ai_endpoint, EMBEDDING_MODEL, EMBEDDING_MODEL, EMBEDDING_DIMENSIONS)
    }

    pub fn define_with(
        name: &str,
        open_ai_endpoint: &str,
        deployment: &str,
        model: &str,
        dimensions: u32
    ) -> Result<Self> {
        if open_ai_endpoint.trim().is_empty() {
            return Err(
                PipelineError::config(
                    format!("index '{}' needs an embedding endpoint for its vectorizer", name)
                )
            );
        }

        let fields = vec![
            SearchField::new(PARENT_KEY_FIELD, FieldType::String),
            SearchField::new(TITLE_FIELD, FieldType::String),
            SearchField::new(LOCATIONS_FIELD, FieldType::StringCollection).filterable(true),
            SearchField::new(KEY_FIELD, FieldType::String)
                .as_key()
                .sortable(true)
                .filterable(true)
                .facetable(true)
                .analyzer("keyword"),
            SearchField::new(CHUNK_FIELD, FieldType::String)
                .sortable(false)
                .filterable(false)
                .facetable(false),
            SearchField::vector(VECTOR_FIELD, dimensions, VECTOR_PROFILE)
        ];

        let vector_search = VectorSearch {
            algorithms: vec![VectorAlgorithm::hnsw(HNSW_ALGORITHM)],
            profiles: vec![VectorProfile {
                name: VECTOR_PROFILE.to_string(),
                algorithm: HNSW_ALGORITHM.to_string(),
                vectorizer: VECTORIZER.to_string(),
            }],
            vectorizers: vec![
                Vectorizer::azure_open_ai(VECTORIZER, open_ai_endpoint, deployment, model)
            ],
        };

        let schema = Self {
            name: name.to_string(),
            fields,
            vector_search: Some(vector_search),
            semantic_search: Some(SemanticSearch {
                configurations: vec![SemanticConfig::new(SEMANTIC_CONFIG, None, &[CHUNK_FIELD])],
            }),
        };
        schema.validate()?;
        Ok(schema)
    }

    pub fn field(&self, name: &str) -> Option<&SearchField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn key_field(&self) -> Option<&SearchField> {
        self.fields.iter().find(|f| f.key)
    }

    pub fn semantic_config(&self, name: &str) -> Option<&SemanticConfig> {
        self.semantic_search.as_ref()?.configurations.iter().find(|c| c.name == name)
    }

    /// Checks the structural invariants the service would otherwise reject on upsert.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| PipelineError::invalid(ResourceKind::Index, &self.name, reason);

        let keys: Vec<&str> = self.fields
            .iter()
            .filter(|f| f.key)
            .map(|f| f.name.as_str())
            .collect();
        if keys.len() != 1 {
            return Err(invalid(format!("expected exactly one key field, found {:?}", keys)));
        }
        if let Some(key) = self.key_field() {
            if key.field_type != FieldType::String {
                return Err(invalid(format!("key field '{}' must be Edm.String", key.name)));
            }
        }

        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(invalid(format!("duplicate field '{}'", field.name)));
            }
            if !field.field_type.is_vector() {
                if field.vector_dimensions.is_some() || field.vector_profile.is_some() {
                    return Err(
                        invalid(format!("field '{}' carries vector settings but is not a vector", field.name))
                    );
                }
                continue;
            }

            match field.vector_dimensions {
                Some(d) if d > 0 => {}
                _ => {
                    return Err(invalid(format!("vector field '{}' must declare dimensions", field.name)));
                }
            }
            let profile_name = field.vector_profile
                .as_deref()
                .ok_or_else(|| invalid(format!("vector field '{}' has no vector profile", field.name)))?;
            let vector_search = self.vector_search
                .as_ref()
                .ok_or_else(|| invalid("vector fields require a vector search section".to_string()))?;
            let profile = vector_search
                .profile(profile_name)
                .ok_or_else(|| invalid(format!("unknown vector profile '{}'", profile_name)))?;
            if !vector_search.algorithms.iter().any(|a| a.name == profile.algorithm) {
                return Err(
                    invalid(
                        format!("profile '{}' references unknown algorithm '{}'", profile.name, profile.algorithm)
                    )
                );
            }
            if !vector_search.vectorizers.iter().any(|v| v.name == profile.vectorizer) {
                return Err(
                    invalid(
                        format!("profile '{}' references unknown vectorizer '{}'", profile.name, profile.vectorizer)
                    )
                );
            }
        }

        if let Some(semantic) = &self.semantic_search {
            for config in &semantic.configurations {
                if config.prioritized_fields.prioritized_content_fields.is_empty() {
                    return Err(invalid(format!("semantic config '{}' has no content fields", config.name)));
                }
                for name in config.referenced_fields() {
                    match self.field(name) {
                        Some(f) if f.field_type.is_text() => {}
                        Some(_) => {
                            return Err(invalid(format!("semantic field '{}' is not a text field", name)));
                        }
                        None => {
                            return Err(
                                invalid(format!("semantic config '{}' references unknown field '{}'", config.name, name))
                            );
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
