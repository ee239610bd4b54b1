//! Run lifecycle operations: create, stop, delete, read.
//!
//! Creation validates the tool and scope through the catalog seam,
//! authorizes the target, writes the run in pending, and enqueues a job.
//! Stop and delete are idempotency-guarded: acting on an already-terminal
//! run is a Conflict, not a silent success, so caller mistakes surface.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::Audit;
use crate::catalog::CatalogStore;
use crate::db::DbHandle;
use crate::engine::ScanEngine;
use crate::errors::VigilError;
use crate::events::EventHub;
use crate::models::*;
use crate::queue::JobQueue;
use crate::scope;

/// Applied when neither the request nor the tool manifest names one.
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 300;

pub struct CreateRunInput {
    pub tool: String,
    pub scope_id: Option<String>,
    pub target: String,
    pub params: serde_json::Value,
    pub timeout_secs: Option<u64>,
}

#[derive(Clone)]
pub struct RunManager {
    db: DbHandle,
    queue: JobQueue,
    hub: EventHub,
    engine: Arc<dyn ScanEngine>,
    catalog: Arc<dyn CatalogStore>,
    audit: Audit,
}

impl RunManager {
    pub fn new(
        db: DbHandle,
        queue: JobQueue,
        hub: EventHub,
        engine: Arc<dyn ScanEngine>,
        catalog: Arc<dyn CatalogStore>,
        audit: Audit,
    ) -> Self {
        Self {
            db,
            queue,
            hub,
            engine,
            catalog,
            audit,
        }
    }

    /// Validate, persist in pending, and enqueue. Returns immediately;
    /// execution happens on the worker.
    pub async fn create(&self, user: &User, input: CreateRunInput) -> Result<Run, VigilError> {
        let target = input.target.trim().to_string();
        if target.is_empty() {
            return Err(VigilError::Validation("target is required".into()));
        }

        let tool = self
            .catalog
            .get_tool(&input.tool)
            .await?
            .ok_or_else(|| VigilError::not_found(format!("Tool '{}' not found", input.tool)))?;
        if !tool.enabled {
            return Err(VigilError::Validation(format!(
                "Tool '{}' is disabled",
                tool.slug
            )));
        }
        if tool.manifest.is_none() {
            return Err(VigilError::Validation(format!(
                "Tool '{}' has no manifest",
                tool.slug
            )));
        }

        let scope = match &input.scope_id {
            Some(scope_id) => {
                let scope = self.catalog.get_scope(scope_id).await?.ok_or_else(|| {
                    VigilError::not_found(format!("Scope '{}' not found", scope_id))
                })?;
                if !scope.active {
                    return Err(VigilError::Forbidden(format!(
                        "Scope '{}' is inactive",
                        scope.name
                    )));
                }
                Some(scope)
            }
            None => None,
        };
        if !scope::authorize(&target, scope.as_ref(), user) {
            return Err(VigilError::Forbidden(format!(
                "Target '{}' is outside the authorized scope",
                target
            )));
        }

        let timeout_secs = input
            .timeout_secs
            .or_else(|| tool.default_timeout_secs())
            .unwrap_or(DEFAULT_RUN_TIMEOUT_SECS);

        let run = Run {
            id: Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            tool: tool.slug.clone(),
            scope_id: input.scope_id,
            target,
            params: input.params,
            status: RunStatus::Pending,
            exit_code: None,
            error: None,
            timeout_secs,
            created_at: now_ts(),
            started_at: None,
            completed_at: None,
        };

        {
            let run = run.clone();
            self.db.call(move |db| db.insert_run(&run)).await?;
        }
        self.queue.enqueue(&run.id).await?;
        info!(run_id = %run.id, tool = %run.tool, target = %run.target, "run created");
        self.audit.record(
            &user.id,
            "run.create",
            &run.id,
            Some(format!("tool={} target={}", run.tool, run.target)),
        );

        Ok(run)
    }

    pub async fn get(&self, run_id: &str) -> Result<RunDetail, VigilError> {
        let id = run_id.to_string();
        let detail = self
            .db
            .call(move |db| {
                let Some(run) = db.get_run(&id)? else {
                    return Ok(None);
                };
                let artifacts = db.list_artifacts(&id)?;
                let findings = db.list_findings_for_run(&id)?;
                Ok(Some(RunDetail {
                    run,
                    artifacts,
                    findings,
                }))
            })
            .await?;
        detail.ok_or_else(|| VigilError::not_found(format!("Run '{}' not found", run_id)))
    }

    pub async fn list(&self) -> Result<Vec<Run>, VigilError> {
        Ok(self.db.call(|db| db.list_runs()).await?)
    }

    /// Stop a pending or running run. Pulls a not-yet-started job from the
    /// queue, force-transitions to cancelled, and kicks a backend reset so
    /// the next run starts clean.
    pub async fn stop(&self, user: &User, run_id: &str) -> Result<Run, VigilError> {
        let run = self.load_owned(user, run_id).await?;
        if run.status.is_terminal() {
            return Err(VigilError::conflict(format!(
                "Run '{}' is already {}",
                run_id, run.status
            )));
        }

        if let Ok(true) = self.queue.remove_queued(run_id).await {
            info!(run_id, "removed queued job before start");
        }

        let cancelled = {
            let id = run_id.to_string();
            self.db
                .call(move |db| {
                    db.transition_run(&id, RunStatus::Cancelled, Some("Stopped by user"), None)
                })
                .await?
        };
        if !cancelled {
            // Lost the race against the worker's terminal transition.
            let run = self.load_owned(user, run_id).await?;
            return Err(VigilError::conflict(format!(
                "Run '{}' is already {}",
                run_id, run.status
            )));
        }

        self.hub.emit(
            run_id,
            StreamEventType::Failed,
            serde_json::json!({"status": "cancelled", "error": "Stopped by user"}),
        );

        // Housekeeping: the engine backend may hold state for this run.
        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.reset().await {
                warn!("engine reset after stop failed: {:#}", e);
            }
        });

        self.audit.record(&user.id, "run.stop", run_id, None);
        self.load_owned(user, run_id).await
    }

    /// Delete a run and its artifacts/findings. An active run is stopped
    /// first.
    pub async fn delete(&self, user: &User, run_id: &str) -> Result<(), VigilError> {
        let run = self.load_owned(user, run_id).await?;
        if run.status.is_active() {
            self.stop(user, run_id).await?;
        }

        let deleted = {
            let id = run_id.to_string();
            self.db.call(move |db| db.delete_run(&id)).await?
        };
        if !deleted {
            return Err(VigilError::not_found(format!("Run '{}' not found", run_id)));
        }
        self.audit.record(&user.id, "run.delete", run_id, None);
        Ok(())
    }

    async fn load_owned(&self, user: &User, run_id: &str) -> Result<Run, VigilError> {
        let id = run_id.to_string();
        let run = self
            .db
            .call(move |db| db.get_run(&id))
            .await?
            .ok_or_else(|| VigilError::not_found(format!("Run '{}' not found", run_id)))?;
        if !user.is_elevated() && run.user_id != user.id {
            return Err(VigilError::Forbidden(
                "Run belongs to another user".into(),
            ));
        }
        Ok(run)
    }
}
