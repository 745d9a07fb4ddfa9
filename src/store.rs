use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;

use crate::controller::RunReport;
use crate::error::RunError;
use crate::ledger::WorkflowConfig;
use crate::model::BotRunContext;

/// Durable sink for run state. `checkpoint` runs after every committed step
/// with the ledger's current projection.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn write_run_start(&self, ctx: &BotRunContext) -> Result<(), RunError>;
    async fn checkpoint(
        &self,
        ctx: &BotRunContext,
        workflow: &WorkflowConfig,
    ) -> Result<(), RunError>;
    /// Stores a base64 PNG captured at a failure.
    async fn save_evidence(&self, run_id: &str, label: &str, png_b64: &str) -> Result<(), RunError>;
    async fn write_run_end(&self, report: &RunReport) -> Result<(), RunError>;
}

pub struct NullRunStore;

#[async_trait]
impl RunStore for NullRunStore {
    async fn write_run_start(&self, _ctx: &BotRunContext) -> Result<(), RunError> {
        Ok(())
    }

    async fn checkpoint(
        &self,
        _ctx: &BotRunContext,
        _workflow: &WorkflowConfig,
    ) -> Result<(), RunError> {
        Ok(())
    }

    async fn save_evidence(&self, _run_id: &str, _label: &str, _png_b64: &str) -> Result<(), RunError> {
        Ok(())
    }

    async fn write_run_end(&self, _report: &RunReport) -> Result<(), RunError> {
        Ok(())
    }
}

/// Writes `<base>/<run_id>/{context,report,workflow}.json` and failure PNGs.
pub struct DiskRunStore {
    base_dir: PathBuf,
}

impl DiskRunStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    async fn write_json<T: Serialize + ?Sized>(&self, run_id: &str, file: &str, value: &T) -> Result<(), RunError> {
        let dir = self.run_dir(run_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| RunError::Persistence(format!("create_dir: {}", e)))?;
        let body = serde_json::to_vec_pretty(value)
            .map_err(|e| RunError::Persistence(format!("encode {}: {}", file, e)))?;
        // replace atomically; readers never see a partial file
        let tmp = dir.join(format!("{}.tmp", file));
        async_fs::write(&tmp, &body)
            .await
            .map_err(|e| RunError::Persistence(format!("write {}: {}", file, e)))?;
        async_fs::rename(&tmp, dir.join(file))
            .await
            .map_err(|e| RunError::Persistence(format!("rename {}: {}", file, e)))
    }
}

#[async_trait]
impl RunStore for DiskRunStore {
    async fn write_run_start(&self, ctx: &BotRunContext) -> Result<(), RunError> {
        self.write_json(&ctx.run_id, "context.json", ctx).await
    }

    async fn checkpoint(
        &self,
        ctx: &BotRunContext,
        workflow: &WorkflowConfig,
    ) -> Result<(), RunError> {
        self.write_json(&ctx.run_id, "context.json", ctx).await?;
        self.write_json(&ctx.run_id, "workflow.json", workflow).await
    }

    async fn save_evidence(&self, run_id: &str, label: &str, png_b64: &str) -> Result<(), RunError> {
        let dir = self.run_dir(run_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| RunError::Persistence(format!("create_dir: {}", e)))?;
        let png = B64
            .decode(png_b64)
            .map_err(|e| RunError::Persistence(format!("b64 decode: {}", e)))?;
        async_fs::write(dir.join(format!("{}.png", label)), &png)
            .await
            .map_err(|e| RunError::Persistence(format!("write: {}", e)))
    }

    async fn write_run_end(&self, report: &RunReport) -> Result<(), RunError> {
        self.write_json(&report.run_id, "report.json", report).await?;
        self.write_json(&report.run_id, "workflow.json", &report.workflow).await
    }
}
