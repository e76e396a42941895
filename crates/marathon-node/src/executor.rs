//! Task executor: VM acquisition and detached per-task workers.
//!
//! `execute_task` is fire-and-forget: it borrows a VM from the pool, spawns
//! a worker for the task's lifetime, and returns. Workers always produce a
//! task-result report — every error branch is folded into a failed report so
//! the orchestrator hears about each task exactly once.

use std::sync::Arc;

use marathon_proto::{ExecuteRequest, OutputEvent, TaskResult, UsageMetrics};
use marathon_vm::{VmHandle, VmPool};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::buffer::OutputBuffer;
use crate::error::{NodeError, NodeResult};
use crate::runner::VsockRunner;

pub struct TaskExecutor {
    pool: Arc<VmPool>,
    vsock_port: u32,
    output: Arc<Mutex<OutputBuffer>>,
    results: Mutex<Vec<TaskResult>>,
}

impl TaskExecutor {
    pub fn new(pool: Arc<VmPool>, vsock_port: u32) -> Self {
        Self {
            pool,
            vsock_port,
            output: Arc::new(Mutex::new(OutputBuffer::new())),
            results: Mutex::new(Vec::new()),
        }
    }

    /// Start a task. Returns once a VM is assigned and the worker is
    /// spawned; the run itself is detached. When no VM is available the
    /// failure is queued as a task result and also returned.
    pub async fn execute_task(self: &Arc<Self>, request: ExecuteRequest) -> NodeResult<()> {
        let task_id = request.task_id;
        let handle = match self.pool.acquire_or_create(task_id).await {
            Ok(handle) => handle,
            Err(e) => {
                let err = NodeError::from(e);
                error!(task_id = %task_id.simple(), error = %err, "no vm for task");
                self.push_result(failed_result(&request, &err)).await;
                return Err(err);
            }
        };

        info!(task_id = %task_id.simple(), vm = %handle.id.simple(), "task assigned to vm");

        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.run_worker(handle, request).await;
        });
        Ok(())
    }

    /// Take all completed task results, leaving an empty queue.
    pub async fn drain_results(&self) -> Vec<TaskResult> {
        std::mem::take(&mut *self.results.lock().await)
    }

    /// Take all buffered output events, leaving an empty buffer.
    pub async fn drain_output(&self) -> Vec<OutputEvent> {
        self.output.lock().await.drain()
    }

    /// Worker body: run the vsock protocol, report, release the VM.
    async fn run_worker(&self, handle: VmHandle, request: ExecuteRequest) {
        let task_id = request.task_id;
        let result = match self.run_task(&handle, &request).await {
            Ok(outcome) => TaskResult {
                task_id,
                success: outcome.success,
                error_message: outcome.error_message,
                metrics: outcome.metrics,
                pr_url: outcome.pr_url,
            },
            Err(e) => {
                error!(task_id = %task_id.simple(), error = %e, "task run failed");
                failed_result(&request, &e)
            }
        };

        info!(task_id = %task_id.simple(), success = result.success, "task finished");
        self.push_result(result).await;
        // Destroys the VM and replenishes the warm pool.
        self.pool.release(handle.id).await;
    }

    async fn run_task(
        &self,
        handle: &VmHandle,
        request: &ExecuteRequest,
    ) -> NodeResult<crate::runner::TaskOutcome> {
        let mut runner = VsockRunner::connect(
            &handle.vsock_path,
            self.vsock_port,
            request.task_id,
            Arc::clone(&self.output),
        )
        .await?;
        runner.run(request).await
    }

    async fn push_result(&self, result: TaskResult) {
        self.results.lock().await.push(result);
    }
}

/// A failed report carrying the error name, per the wire contract.
fn failed_result(request: &ExecuteRequest, error: &NodeError) -> TaskResult {
    TaskResult {
        task_id: request.task_id,
        success: false,
        error_message: Some(error.name().to_string()),
        metrics: UsageMetrics::default(),
        pr_url: None,
    }
}
