//! Provisioning in a fixed order: data source, index, skillset, indexer.
//!
//! Each stage can only be reached from the one before it, and carries the
//! definitions the service returned so far, so the indexer is always bound to
//! resources that already exist. Every step is an idempotent upsert; a failure
//! part way leaves earlier resources in place and re-running is the recovery.

use std::time::Duration;
use log::{ info, debug };

use crate::config::PipelineConfig;
use crate::datasource::DataSourceConnection;
use crate::error::Result;
use crate::indexer::{ Indexer, IndexerRunState };
use crate::schema::IndexSchema;
use crate::service::{ wait_for_indexer, SearchService };
use crate::skillset::Skillset;

pub struct Provisioner<'a> {
    service: &'a dyn SearchService,
    config: &'a PipelineConfig,
}

pub struct DataSourceStage<'a> {
    service: &'a dyn SearchService,
    config: &'a PipelineConfig,
    data_source: DataSourceConnection,
}

pub struct IndexStage<'a> {
    service: &'a dyn SearchService,
    config: &'a PipelineConfig,
    data_source: DataSourceConnection,
    index: IndexSchema,
}

pub struct SkillsetStage<'a> {
    service: &'a dyn SearchService,
    config: &'a PipelineConfig,
    data_source: DataSourceConnection,
    index: IndexSchema,
    skillset: Skillset,
}

/// The four resources as stored by the service.
#[derive(Debug, Clone)]
pub struct ProvisionedPipeline {
    pub data_source: DataSourceConnection,
    pub index: IndexSchema,
    pub skillset: Skillset,
    pub indexer: Indexer,
}

impl<'a> Provisioner<'a> {
    pub fn new(service: &'a dyn SearchService, config: &'a PipelineConfig) -> Self {
        Self { service, config }
    }

    pub async fn data_source(self) -> Result<DataSourceStage<'a>> {
        let storage = &self.config.storage;
        let definition = DataSourceConnection::define(
            &self.config.names.data_source,
            &storage.container,
            &storage.connection_string
        )?;
        let data_source = self.service.upsert_data_source(&definition).await?;
        info!("Data source '{}' reads container '{}'", data_source.name, data_source.container_name());

        Ok(DataSourceStage {
            service: self.service,
            config: self.config,
            data_source,
        })
    }
}

impl<'a> DataSourceStage<'a> {
    pub fn data_source(&self) -> &DataSourceConnection {
        &self.data_source
    }

    pub async fn index(self) -> Result<IndexStage<'a>> {
        let open_ai = &self.config.open_ai;
        let definition = IndexSchema::define_with(
            &self.config.names.index,
            &open_ai.endpoint,
            &open_ai.embedding_deployment,
            &open_ai.embedding_model,
            open_ai.dimensions
        )?;
        let index = self.service.upsert_index(&definition).await?;
        debug!("Index '{}' has {} fields", index.name, index.fields.len());

        Ok(IndexStage {
            service: self.service,
            config: self.config,
            data_source: self.data_source,
            index,
        })
    }
}

impl<'a> IndexStage<'a> {
    pub fn index(&self) -> &IndexSchema {
        &self.index
    }

    pub async fn skillset(self) -> Result<SkillsetStage<'a>> {
        let definition = Skillset::define_with(
            &self.config.names.skillset,
            &self.index,
            &self.config.open_ai.endpoint,
            &self.config.cognitive_services_key,
            &self.config.skillset_options()
        )?;
        let skillset = self.service.upsert_skillset(&definition).await?;
        debug!("Skillset '{}' has {} skills", skillset.name, skillset.skills.len());

        Ok(SkillsetStage {
            service: self.service,
            config: self.config,
            data_source: self.data_source,
            index: self.index,
            skillset,
        })
    }
}

impl<'a> SkillsetStage<'a> {
    pub fn skillset(&self) -> &Skillset {
        &self.skillset
    }

    pub async fn indexer(self) -> Result<ProvisionedPipeline> {
        let indexing = &self.config.indexing;
        let mut definition = Indexer::define(
            &self.config.names.indexer,
            &self.skillset,
            &self.index,
            &self.data_source,
            indexing.schedule.clone(),
            indexing.max_failed_items
        )?;
        if let Some(configuration) = &indexing.configuration {
            definition = definition.with_configuration(configuration.clone());
        }
        let indexer = self.service.upsert_indexer(&definition).await?;

        Ok(ProvisionedPipeline {
            data_source: self.data_source,
            index: self.index,
            skillset: self.skillset,
            indexer,
        })
    }
}

impl ProvisionedPipeline {
    /// Blocks until the indexer's latest run is terminal. Fresh documents are only
    /// searchable once this reports a successful state.
    pub async fn wait_until_indexed(
        &self,
        service: &dyn SearchService,
        poll_interval: Duration,
        timeout: Duration
    ) -> Result<IndexerRunState> {
        wait_for_indexer(service, &self.indexer.name, self.indexer.max_failed_items(), poll_interval, timeout).await
    }
}

/// Upserts every resource of the pipeline described by `config`.
pub async fn provision(service: &dyn SearchService, config: &PipelineConfig) -> Result<ProvisionedPipeline> {
    info!(
        "Provisioning index '{}' with data source '{}', skillset '{}' and indexer '{}'",
        config.names.index,
        config.names.data_source,
        config.names.skillset,
        config.names.indexer
    );
    let pipeline = Provisioner::new(service, config)
        .data_source().await?
        .index().await?
        .skillset().await?
        .indexer().await?;
    info!("Pipeline for index '{}' provisioned", pipeline.index.name);
    Ok(pipeline)
}
