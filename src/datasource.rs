use std::fmt;

use serde::{ Deserialize, Serialize };

use crate::error::{ PipelineError, ResourceKind, Result };

pub const AZURE_BLOB: &str = "azureblob";

#[derive(Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceCredentials {
    /// The service echoes this back as `null`; only the definition we send carries it.
    #[serde(default)]
    pub connection_string: Option<String>,
}

impl fmt::Debug for DataSourceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceCredentials")
            .field("connection_string", &self.connection_string.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataContainer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// Where raw documents live and how the indexer reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceConnection {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: String,
    pub credentials: DataSourceCredentials,
    pub container: DataContainer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DataSourceConnection {
    /// A blob container as the origin of ingestible documents.
    pub fn define(name: &str, container_name: &str, connection_string: &str) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(PipelineError::config("data source name must not be empty"));
        }
        if container_name.trim().is_empty() {
            return Err(
                PipelineError::config(format!("data source '{}' needs a container name", name))
            );
        }
        if connection_string.trim().is_empty() {
            return Err(
                PipelineError::config(format!("data source '{}' needs a storage connection string", name))
            );
        }

        Ok(Self {
            name: name.to_string(),
            source_type: AZURE_BLOB.to_string(),
            credentials: DataSourceCredentials {
                connection_string: Some(connection_string.to_string()),
            },
            container: DataContainer {
                name: container_name.to_string(),
                query: None,
            },
            description: None,
        })
    }

    pub fn container_name(&self) -> &str {
        &self.container.name
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_type.is_empty() {
            return Err(PipelineError::invalid(ResourceKind::DataSource, &self.name, "type is empty"));
        }
        if self.container.name.is_empty() {
            return Err(
                PipelineError::invalid(ResourceKind::DataSource, &self.name, "container name is empty")
            );
        }
        Ok(())
    }
}
