use std::sync::Arc;
use std::time::Duration;

use teamcloud_infra::audit::{AuditOptions, CommandAuditReader, CommandAuditWriter};
use teamcloud_infra::dispatch::{CommandSender, DispatchError, ReqwestTransport};
use teamcloud_infra::orchestration::{EngineBuilder, TableJournal};
use teamcloud_infra::storage::{BlobStore, MemoryBlobStore, MemoryTableStore, TableStore};
use teamcloud_infra::{EngineOptions, OrchestrationEngine};

use crate::config::ApiConfig;

/// Per-request timeout of provider calls; the callback wait is governed by
/// the engine's command timeout instead.
const PROVIDER_REQUEST_TIMEOUT: Duration = Duration::from_secs(100);

/// Everything the route handlers need.
#[derive(Debug, Clone)]
pub struct AppServices {
    pub engine: OrchestrationEngine,
    pub audit: CommandAuditReader,
    pub sync_wait: Duration,
}

impl AppServices {
    /// Wire the engine over the given storage backends.
    ///
    /// The journal lives in `tables`, so a durable table backend lets
    /// [`OrchestrationEngine::recover`] resume commands after a restart.
    ///
    /// `configure` registers local handlers; providers from the configuration
    /// are added afterwards.
    pub fn build<F>(
        config: &ApiConfig,
        blobs: Arc<dyn BlobStore>,
        tables: Arc<dyn TableStore>,
        configure: F,
    ) -> Result<Self, DispatchError>
    where
        F: FnOnce(EngineBuilder) -> EngineBuilder,
    {
        let audit_options = AuditOptions::new(&config.storage_prefix);
        let journal = TableJournal::arc(tables.clone(), &config.storage_prefix);
        let writer = CommandAuditWriter::new(blobs.clone(), tables.clone(), audit_options.clone());
        let reader = CommandAuditReader::new(blobs, tables, audit_options);

        let options = EngineOptions::default()
            .with_max_command_timeout(config.max_command_timeout)
            .with_callback_base_url(config.public_url.clone());
        let transport = ReqwestTransport::new(PROVIDER_REQUEST_TIMEOUT)?;
        let sender = CommandSender::new(Arc::new(transport), options.dispatch_retry.clone());

        let mut builder = configure(
            OrchestrationEngine::builder(options, writer, sender)
                .with_audit_reader(reader.clone())
                .with_journal(journal),
        );
        for route in &config.providers {
            builder = builder.with_provider(route.pattern.clone(), route.provider.clone());
        }

        Ok(Self {
            engine: builder.build(),
            audit: reader,
            sync_wait: config.sync_wait,
        })
    }

    /// In-process storage; state is lost on restart.
    pub fn in_memory<F>(config: &ApiConfig, configure: F) -> Result<Self, DispatchError>
    where
        F: FnOnce(EngineBuilder) -> EngineBuilder,
    {
        Self::build(config, MemoryBlobStore::arc(), MemoryTableStore::arc(), configure)
    }
}
