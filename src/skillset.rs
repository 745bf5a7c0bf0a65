use std::fmt;
use std::ops::Range;

use serde::{ Deserialize, Serialize };

use crate::error::{ PipelineError, ResourceKind, Result };
use crate::schema::{
    IndexSchema,
    CHUNK_FIELD,
    EMBEDDING_DIMENSIONS,
    EMBEDDING_MODEL,
    LOCATIONS_FIELD,
    PARENT_KEY_FIELD,
    TITLE_FIELD,
    VECTOR_FIELD,
};

pub const DOCUMENT_CONTEXT: &str = "/document";
pub const PAGES_CONTEXT: &str = "/document/pages/*";
pub const CONTENT_SOURCE: &str = "/document/content";
pub const STORAGE_NAME_SOURCE: &str = "/document/metadata_storage_name";

pub const MAX_PAGE_LENGTH: u32 = 2000;
pub const PAGE_OVERLAP_LENGTH: u32 = 500;
pub const LOCATION_CATEGORY: &str = "Location";

/// Input binding of a skill or projection: `name` receives the value found at `source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMapping {
    pub name: String,
    pub source: String,
}

impl InputMapping {
    pub fn new(name: &str, source: &str) -> Self {
        Self { name: name.to_string(), source: source.to_string() }
    }
}

/// Output binding of a skill: the skill's `name` output lands at `targetName` under the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputMapping {
    pub name: String,
    pub target_name: String,
}

impl OutputMapping {
    pub fn new(name: &str, target_name: &str) -> Self {
        Self { name: name.to_string(), target_name: target_name.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitSkill {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub context: String,
    pub text_split_mode: String,
    pub maximum_page_length: u32,
    pub page_overlap_length: u32,
    pub inputs: Vec<InputMapping>,
    pub outputs: Vec<OutputMapping>,
}

impl SplitSkill {
    pub fn pages(max_page_length: u32, page_overlap_length: u32) -> Self {
        Self {
            description: Some("Split skill to chunk documents".to_string()),
            context: DOCUMENT_CONTEXT.to_string(),
            text_split_mode: "pages".to_string(),
            maximum_page_length: max_page_length,
            page_overlap_length,
            inputs: vec![InputMapping::new("text", CONTENT_SOURCE)],
            outputs: vec![OutputMapping::new("textItems", "pages")],
        }
    }

    /// Character windows a document of `len` characters is split into.
    pub fn page_spans(&self, len: usize) -> Vec<Range<usize>> {
        page_spans(len, self.maximum_page_length as usize, self.page_overlap_length as usize)
    }

    /// Splits `text` into the pages the service would produce, counting characters, not bytes.
    pub fn split<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut offsets: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .collect();
        let len = offsets.len();
        offsets.push(text.len());

        self.page_spans(len)
            .into_iter()
            .map(|span| &text[offsets[span.start]..offsets[span.end]])
            .collect()
    }
}

/// Windows of at most `max` units where consecutive windows share `overlap` units.
pub fn page_spans(len: usize, max: usize, overlap: usize) -> Vec<Range<usize>> {
    if len == 0 || max == 0 {
        return Vec::new();
    }
    if len <= max {
        return vec![0..len];
    }

    let stride = max.saturating_sub(overlap).max(1);
    let mut spans = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + max).min(len);
        spans.push(start..end);
        if end == len {
            break;
        }
        start += stride;
    }
    spans
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingSkill {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub context: String,
    #[serde(rename = "resourceUri")]
    pub resource_uri: String,
    pub deployment_id: String,
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub inputs: Vec<InputMapping>,
    pub outputs: Vec<OutputMapping>,
}

impl fmt::Debug for EmbeddingSkill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingSkill")
            .field("context", &self.context)
            .field("resource_uri", &self.resource_uri)
            .field("deployment_id", &self.deployment_id)
            .field("model_name", &self.model_name)
            .field("dimensions", &self.dimensions)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecognitionSkill {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub context: String,
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_language_code: Option<String>,
    pub inputs: Vec<InputMapping>,
    pub outputs: Vec<OutputMapping>,
}

/// One enrichment step. The discriminator is the service's `@odata.type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@odata.type")]
pub enum Skill {
    #[serde(rename = "#Microsoft.Skills.Text.SplitSkill")]
    Split(SplitSkill),
    #[serde(rename = "#Microsoft.Skills.Text.AzureOpenAIEmbeddingSkill")]
    Embedding(EmbeddingSkill),
    #[serde(rename = "#Microsoft.Skills.Text.V3.EntityRecognitionSkill")]
    EntityRecognition(EntityRecognitionSkill),
}

impl Skill {
    pub fn context(&self) -> &str {
        match self {
            Skill::Split(s) => &s.context,
            Skill::Embedding(s) => &s.context,
            Skill::EntityRecognition(s) => &s.context,
        }
    }

    pub fn inputs(&self) -> &[InputMapping] {
        match self {
            Skill::Split(s) => &s.inputs,
            Skill::Embedding(s) => &s.inputs,
            Skill::EntityRecognition(s) => &s.inputs,
        }
    }

    pub fn outputs(&self) -> &[OutputMapping] {
        match self {
            Skill::Split(s) => &s.outputs,
            Skill::Embedding(s) => &s.outputs,
            Skill::EntityRecognition(s) => &s.outputs,
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@odata.type")]
pub enum CognitiveServicesAccount {
    #[serde(rename = "#Microsoft.Azure.Search.CognitiveServicesByKey")]
    ByKey {
        #[serde(default)]
        key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl CognitiveServicesAccount {
    pub fn key(&self) -> Option<&str> {
        match self {
            CognitiveServicesAccount::ByKey { key, .. } => key.as_deref(),
        }
    }
}

impl fmt::Debug for CognitiveServicesAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CognitiveServicesByKey")
            .field("key", &self.key().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProjectionMode {
    /// Only the projected sub-documents are indexed; the parent is a container.
    SkipIndexingParentDocuments,
    IncludeIndexingParentDocuments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionSelector {
    pub target_index_name: String,
    pub parent_key_field_name: String,
    pub source_context: String,
    pub mappings: Vec<InputMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionParameters {
    pub projection_mode: ProjectionMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexProjection {
    pub selectors: Vec<ProjectionSelector>,
    pub parameters: ProjectionParameters,
}

/// Knobs of the canonical chunk/embed/extract skillset.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillsetOptions {
    pub max_page_length: u32,
    pub page_overlap_length: u32,
    pub embedding_deployment: String,
    pub embedding_model: String,
    pub dimensions: u32,
    pub entity_categories: Vec<String>,
    pub language: String,
}

impl Default for SkillsetOptions {
    fn default() -> Self {
        Self {
            max_page_length: MAX_PAGE_LENGTH,
            page_overlap_length: PAGE_OVERLAP_LENGTH,
            embedding_deployment: EMBEDDING_MODEL.to_string(),
            embedding_model: EMBEDDING_MODEL.to_string(),
            dimensions: EMBEDDING_DIMENSIONS,
            entity_categories: vec![LOCATION_CATEGORY.to_string()],
            language: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Skillset {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub skills: Vec<Skill>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cognitive_services: Option<CognitiveServicesAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_projections: Option<IndexProjection>,
}

impl Skillset {
    pub fn define(
        name: &str,
        index: &IndexSchema,
        embedding_endpoint: &str,
        cognitive_services_key: &str
    ) -> Result<Self> {
        Self::define_with(name, index, embedding_endpoint, cognitive_services_key, &SkillsetOptions::default())
    }

    /// Split into overlapping pages, embed every page, extract entities per page, and
    /// project the pages (never the parent document) into `index`.
    pub fn define_with(
        name: &str,
        index: &IndexSchema,
        embedding_endpoint: &str,
        cognitive_services_key: &str,
        options: &SkillsetOptions
    ) -> Result<Self> {
        if embedding_endpoint.trim().is_empty() {
            return Err(
                PipelineError::config(format!("skillset '{}' needs an embedding endpoint", name))
            );
        }
        if cognitive_services_key.trim().is_empty() {
            return Err(
                PipelineError::config(format!("skillset '{}' needs a cognitive services key", name))
            );
        }

        let split = SplitSkill::pages(options.max_page_length, options.page_overlap_length);

        let embedding = EmbeddingSkill {
            description: Some("Skill to generate embeddings via Azure OpenAI".to_string()),
            context: PAGES_CONTEXT.to_string(),
            resource_uri: embedding_endpoint.to_string(),
            deployment_id: options.embedding_deployment.clone(),
            model_name: options.embedding_model.clone(),
            dimensions: Some(options.dimensions),
            api_key: None,
            inputs: vec![InputMapping::new("text", PAGES_CONTEXT)],
            outputs: vec![OutputMapping::new("embedding", VECTOR_FIELD)],
        };

        let entities = EntityRecognitionSkill {
            description: Some("Skill to recognize entities in text".to_string()),
            context: PAGES_CONTEXT.to_string(),
            categories: options.entity_categories.clone(),
            default_language_code: Some(options.language.clone()),
            inputs: vec![InputMapping::new("text", PAGES_CONTEXT)],
            outputs: vec![OutputMapping::new("locations", LOCATIONS_FIELD)],
        };

        let projection = IndexProjection {
            selectors: vec![ProjectionSelector {
                target_index_name: index.name.clone(),
                parent_key_field_name: PARENT_KEY_FIELD.to_string(),
                source_context: PAGES_CONTEXT.to_string(),
                mappings: vec![
                    InputMapping::new(CHUNK_FIELD, PAGES_CONTEXT),
                    InputMapping::new(VECTOR_FIELD, &format!("{}/{}", PAGES_CONTEXT, VECTOR_FIELD)),
                    InputMapping::new(LOCATIONS_FIELD, &format!("{}/{}", PAGES_CONTEXT, LOCATIONS_FIELD)),
                    InputMapping::new(TITLE_FIELD, STORAGE_NAME_SOURCE)
                ],
            }],
            parameters: ProjectionParameters {
                projection_mode: ProjectionMode::SkipIndexingParentDocuments,
            },
        };

        let skillset = Self {
            name: name.to_string(),
            description: Some("Skillset to chunk documents and generate embeddings".to_string()),
            skills: vec![Skill::Split(split), Skill::Embedding(embedding), Skill::EntityRecognition(entities)],
            cognitive_services: Some(CognitiveServicesAccount::ByKey {
                key: Some(cognitive_services_key.to_string()),
                description: None,
            }),
            index_projections: Some(projection),
        };
        skillset.validate()?;
        skillset.validate_against(index)?;
        Ok(skillset)
    }

    pub fn split_skill(&self) -> Option<&SplitSkill> {
        self.skills.iter().find_map(|s| {
            match s {
                Skill::Split(split) => Some(split),
                _ => None,
            }
        })
    }

    pub fn entity_skill(&self) -> Option<&EntityRecognitionSkill> {
        self.skills.iter().find_map(|s| {
            match s {
                Skill::EntityRecognition(e) => Some(e),
                _ => None,
            }
        })
    }

    pub fn indexes_parent_documents(&self) -> bool {
        self.index_projections
            .as_ref()
            .map_or(true, |p| p.parameters.projection_mode == ProjectionMode::IncludeIndexingParentDocuments)
    }

    /// Structural checks that need nothing but the skillset itself.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| PipelineError::invalid(ResourceKind::Skillset, &self.name, reason);

        if self.skills.is_empty() {
            return Err(invalid("a skillset needs at least one skill".to_string()));
        }
        for skill in &self.skills {
            if !skill.context().starts_with(DOCUMENT_CONTEXT) {
                return Err(invalid(format!("skill context '{}' is outside /document", skill.context())));
            }
            if skill.inputs().is_empty() || skill.outputs().is_empty() {
                return Err(invalid(format!("skill at '{}' needs inputs and outputs", skill.context())));
            }
            if let Some(bad) = skill.inputs().iter().find(|i| !i.source.starts_with(DOCUMENT_CONTEXT)) {
                return Err(invalid(format!("input '{}' reads from '{}'", bad.name, bad.source)));
            }
            if let Skill::Split(split) = skill {
                if split.maximum_page_length == 0 {
                    return Err(invalid("maximum page length must be positive".to_string()));
                }
                if split.page_overlap_length >= split.maximum_page_length {
                    return Err(
                        invalid(
                            format!(
                                "page overlap {} must be shorter than the maximum page length {}",
                                split.page_overlap_length,
                                split.maximum_page_length
                            )
                        )
                    );
                }
            }
        }
        if let Some(projection) = &self.index_projections {
            if projection.selectors.is_empty() {
                return Err(invalid("index projection without selectors".to_string()));
            }
        }
        Ok(())
    }

    /// Checks that projections and embeddings line up with the target index.
    pub fn validate_against(&self, index: &IndexSchema) -> Result<()> {
        let invalid = |reason: String| PipelineError::invalid(ResourceKind::Skillset, &self.name, reason);

        let Some(projection) = &self.index_projections else {
            return Ok(());
        };
        for selector in projection.selectors.iter().filter(|s| s.target_index_name == index.name) {
            if index.field(&selector.parent_key_field_name).is_none() {
                return Err(
                    invalid(format!("parent key field '{}' is not in index '{}'", selector.parent_key_field_name, index.name))
                );
            }
            for mapping in &selector.mappings {
                if index.field(&mapping.name).is_none() {
                    return Err(
                        invalid(format!("projected field '{}' is not in index '{}'", mapping.name, index.name))
                    );
                }
            }
        }
        for skill in &self.skills {
            if let Skill::Embedding(embedding) = skill {
                let target = embedding.outputs.first().map(|o| o.target_name.as_str());
                let field = target.and_then(|t| index.field(t));
                if let (Some(field), Some(dims)) = (field, embedding.dimensions) {
                    if field.vector_dimensions != Some(dims) {
                        return Err(
                            invalid(
                                format!(
                                    "embedding produces {} dimensions but '{}' holds {:?}",
                                    dims,
                                    field.name,
                                    field.vector_dimensions
                                )
                            )
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
