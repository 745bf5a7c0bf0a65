use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Kinds of resources the search service stores by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Index,
    DataSource,
    Skillset,
    Indexer,
    Container,
}

impl ResourceKind {
    /// Collection segment of the management REST path.
    pub fn collection(&self) -> &'static str {
        match self {
            ResourceKind::Index => "indexes",
            ResourceKind::DataSource => "datasources",
            ResourceKind::Skillset => "skillsets",
            ResourceKind::Indexer => "indexers",
            ResourceKind::Container => "containers",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceKind::Index => "index",
            ResourceKind::DataSource => "data source",
            ResourceKind::Skillset => "skillset",
            ResourceKind::Indexer => "indexer",
            ResourceKind::Container => "container",
        };
        f.write_str(label)
    }
}

/// Every configuration violation found in one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigErrors(pub Vec<String>);

impl ConfigErrors {
    pub fn push(&mut self, violation: impl Into<String>) {
        self.0.push(violation.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn violations(&self) -> &[String] {
        &self.0
    }

    /// `Ok(())` when nothing was recorded, otherwise the aggregated error.
    pub fn into_result(self) -> Result<()> {
        if self.0.is_empty() { Ok(()) } else { Err(PipelineError::Configuration(self)) }
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("; "))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Configuration(ConfigErrors),

    #[error("invalid {kind} definition '{name}': {reason}")]
    InvalidDefinition {
        kind: ResourceKind,
        name: String,
        reason: String,
    },

    #[error("credential rejected ({status}): {message}")]
    Auth {
        status: u16,
        message: String,
    },

    #[error("{kind} '{name}' not found")]
    NotFound {
        kind: ResourceKind,
        name: String,
    },

    #[error("search service returned {status}: {message}")]
    Remote {
        status: u16,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("indexer '{indexer}' did not finish within {waited:?}")]
    Timeout {
        indexer: String,
        waited: Duration,
    },
}

impl PipelineError {
    pub fn config(violation: impl Into<String>) -> Self {
        PipelineError::Configuration(ConfigErrors(vec![violation.into()]))
    }

    pub fn invalid(kind: ResourceKind, name: &str, reason: impl Into<String>) -> Self {
        PipelineError::InvalidDefinition {
            kind,
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: ResourceKind, name: &str) -> Self {
        PipelineError::NotFound { kind, name: name.to_string() }
    }

    /// Whether retrying the same call may succeed. Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Transport(_) | PipelineError::Timeout { .. } => true,
            PipelineError::Remote { status, .. } =>
                *status == 408 || *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }

    /// Configuration, definition and credential problems are fatal until someone fixes them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration(_) |
                PipelineError::InvalidDefinition { .. } |
                PipelineError::Auth { .. }
        )
    }
}
