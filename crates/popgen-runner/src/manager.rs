//! Run lifecycle - generate, bind, serve and delete runs
//!
//! Generation is serialized: the generator names its own output directory and
//! the new run is found as the newest directory, which is only sound when one
//! generator runs at a time. The permit covers invoke, discovery and the
//! registry save, so a run is either fully bound and recorded or not created.

use crate::archive::{archive_file_name, ArchiveCache};
use crate::invoker::GeneratorInvoker;
use crate::locator::latest_run_directory;
use crate::registry::RunRegistry;
use popgen_core::{
    Error, Format, GenerationParameters, GenerationRequest, GeneratorConfig, Identity, Result,
    Run, RunId,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// A built archive ready to be streamed.
#[derive(Clone, Debug)]
pub struct ArchiveHandle {
    pub run_id: RunId,
    pub format: Format,
    pub path: PathBuf,
    /// Download name, `{run_id}_{format}.tar.zst`.
    pub file_name: String,
}

pub struct RunManager {
    invoker: GeneratorInvoker,
    cache: ArchiveCache,
    registry: Arc<dyn RunRegistry>,
    generation: Mutex<()>,
}

impl RunManager {
    pub fn new(config: &GeneratorConfig, registry: Arc<dyn RunRegistry>) -> Self {
        Self {
            invoker: GeneratorInvoker::new(config),
            cache: ArchiveCache::new(config.output_root()),
            registry,
            generation: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &ArchiveCache {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<dyn RunRegistry> {
        &self.registry
    }

    /// Validate a raw request, then generate.
    pub async fn start_generation(
        self: &Arc<Self>,
        caller: &Identity,
        request: &GenerationRequest,
    ) -> Result<Run> {
        let params = request.validate()?;
        self.generate(caller, params).await
    }

    /// Run the generator, bind its output to a run id and record the run.
    ///
    /// The work runs on its own task: once started, a generation completes
    /// (or hits the configured timeout) even if the returned future is dropped.
    pub async fn generate(
        self: &Arc<Self>,
        caller: &Identity,
        params: GenerationParameters,
    ) -> Result<Run> {
        let manager = Arc::clone(self);
        let owner = caller.username.clone();
        tokio::spawn(async move { manager.generate_serialized(owner, params).await })
            .await
            .map_err(|e| Error::Internal(format!("generation task failed: {}", e)))?
    }

    async fn generate_serialized(&self, owner: String, params: GenerationParameters) -> Result<Run> {
        let _permit = self.generation.lock().await;
        info!("Generation requested by {}: {:?}", owner, params);

        if let Err(e) = self.invoker.run(&params).await {
            // Partial output of a failed run is left on disk for the operator.
            error!("Generation for {} failed: {}", owner, e);
            return Err(e);
        }

        let run_id = latest_run_directory(&self.cache.format_root(Format::Csv)).map_err(|e| {
            error!("Generator succeeded but produced no discoverable output: {}", e);
            Error::generation_failed(format!("output not found: {}", e))
        })?;

        if let Some(existing) = self.registry.find_by_id(&run_id).await? {
            error!(
                "Newest output {} already belongs to {}; generator wrote nothing new",
                run_id, existing.owner
            );
            return Err(Error::generation_failed(format!(
                "no new output directory; newest is already bound to run {}",
                run_id
            )));
        }

        let run = Run::new(run_id, owner, params);
        if let Err(e) = self.registry.save(run.clone()).await {
            error!("Failed to record run {}: {} - purging its output", run.run_id, e);
            if let Err(purge_err) = self.cache.purge(&run.run_id).await {
                error!("Purge of unrecorded run {} failed: {}", run.run_id, purge_err);
            }
            return Err(e);
        }

        info!("Run {} bound to {}", run.run_id, run.owner);
        Ok(run)
    }

    /// Archive for (run, format), built on first request.
    pub async fn fetch_archive(
        &self,
        caller: &Identity,
        run_id: &str,
        format: &str,
    ) -> Result<ArchiveHandle> {
        let format: Format = format.parse()?;
        let run_id = RunId::parse(run_id)?;

        let path = self.cache.materialize(&run_id, format).await?;
        info!("Serving {} archive of run {} to {}", format, run_id, caller.username);
        Ok(ArchiveHandle {
            file_name: archive_file_name(&run_id, format),
            run_id,
            format,
            path,
        })
    }

    /// Delete a run the caller owns (or any run, for an administrator).
    ///
    /// Files are purged before the record is removed: if the purge fails the
    /// record stays and the error is returned; if removing the record fails
    /// after a purge, the record points at nothing and the error is returned.
    pub async fn delete_run(&self, caller: &Identity, run_id: &str) -> Result<()> {
        let run_id = RunId::parse(run_id)?;
        let run = self
            .registry
            .find_by_id(&run_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("run {}", run_id)))?;

        if !caller.can_manage(&run.owner) {
            warn!("{} may not delete run {} owned by {}", caller.username, run_id, run.owner);
            return Err(Error::forbidden(format!("run {} belongs to another user", run_id)));
        }

        self.cache.purge(&run_id).await.map_err(|e| {
            error!("Purge of run {} failed, record kept: {}", run_id, e);
            e
        })?;

        if !self.registry.delete_by_id(&run_id).await.map_err(|e| {
            error!("Run {} purged but its record could not be removed: {}", run_id, e);
            e
        })? {
            return Err(Error::not_found(format!("run {}", run_id)));
        }

        info!("Run {} deleted by {}", run_id, caller.username);
        Ok(())
    }

    pub async fn list_runs(&self, caller: &Identity) -> Result<Vec<Run>> {
        self.registry.find_by_owner(&caller.username).await
    }

    pub async fn list_all_runs(&self, caller: &Identity) -> Result<Vec<Run>> {
        if !caller.is_elevated() {
            return Err(Error::forbidden("listing all runs requires admin"));
        }
        self.registry.find_all().await
    }
}
