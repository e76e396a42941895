//! Vsock task runner: drives one task on one VM's guest agent.
//!
//! Firecracker exposes the guest's vsock listener as a UDS at
//! `<vsock_uds>_<port>`. The guest may not be listening immediately after a
//! snapshot restore, so connecting retries with a backoff. The exchange is:
//! one `vsock_ready` from the guest, one `vsock_start` from the host, then a
//! stream of output/metrics/progress events ending in `vsock_complete` or
//! `vsock_error`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use marathon_proto::{
    ExecuteRequest, MessageType, OutputEvent, OutputType, UsageMetrics, VsockComplete, VsockError,
    VsockOutput, VsockProgress, read_frame, write_frame,
};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::OutputBuffer;
use crate::error::{NodeError, NodeResult};

/// Connection attempts against the guest vsock endpoint.
const CONNECT_ATTEMPTS: u32 = 15;
/// Delay between attempts (30 s in total).
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Outcome of one task run, success or not.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub success: bool,
    pub error_message: Option<String>,
    pub metrics: UsageMetrics,
    pub pr_url: Option<String>,
}

pub struct VsockRunner {
    stream: UnixStream,
    task_id: Uuid,
    output: Arc<Mutex<OutputBuffer>>,
    next_request_id: u32,
}

impl VsockRunner {
    /// Connect to the guest agent behind `vsock_path` on `port`.
    pub async fn connect(
        vsock_path: &Path,
        port: u32,
        task_id: Uuid,
        output: Arc<Mutex<OutputBuffer>>,
    ) -> NodeResult<Self> {
        let addr = format!("{}_{port}", vsock_path.display());

        let mut last_error = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            match UnixStream::connect(&addr).await {
                Ok(stream) => {
                    debug!(task_id = %task_id.simple(), attempt, "vsock connected");
                    return Ok(Self {
                        stream,
                        task_id,
                        output,
                        next_request_id: 1,
                    });
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(NodeError::VsockConnectFailed(format!(
            "{addr}: {last_error} after {CONNECT_ATTEMPTS} attempts"
        )))
    }

    /// Run the task protocol to completion.
    pub async fn run(&mut self, request: &ExecuteRequest) -> NodeResult<TaskOutcome> {
        // The guest announces itself before accepting work.
        let ready = read_frame(&mut self.stream).await?;
        if ready.msg_type != MessageType::VsockReady {
            return Err(NodeError::UnexpectedGuestMessage(ready.msg_type as u8));
        }

        let id = self.next_request_id();
        write_frame(&mut self.stream, MessageType::VsockStart, id, &request.encode()).await?;
        info!(task_id = %self.task_id.simple(), repo = %request.repo_url, "task started");

        let mut latest_metrics = UsageMetrics::default();
        loop {
            let frame = read_frame(&mut self.stream).await?;
            match frame.msg_type {
                MessageType::VsockOutput => {
                    let output = VsockOutput::decode(&frame.payload)?;
                    debug!(
                        task_id = %self.task_id.simple(),
                        stream = ?output.output_type,
                        "{}",
                        String::from_utf8_lossy(&output.data)
                    );
                    self.push_output(output.output_type, output.timestamp_ms, output.data)
                        .await;
                }
                MessageType::VsockMetrics => {
                    latest_metrics = UsageMetrics::decode(&frame.payload)?;
                }
                MessageType::VsockProgress => {
                    let progress = VsockProgress::decode(&frame.payload)?;
                    info!(
                        task_id = %self.task_id.simple(),
                        iteration = progress.iteration,
                        max = progress.max_iterations,
                        "{}",
                        progress.status
                    );
                    let line = format!(
                        "Progress: {}/{} - {}",
                        progress.iteration, progress.max_iterations, progress.status
                    );
                    self.push_output(OutputType::Stdout, now_ms(), line.into_bytes())
                        .await;
                }
                MessageType::VsockComplete => {
                    let complete = VsockComplete::decode(&frame.payload)?;
                    info!(
                        task_id = %self.task_id.simple(),
                        exit_code = complete.exit_code,
                        iterations = complete.iterations_completed,
                        promise_found = complete.promise_found,
                        "task complete"
                    );
                    return Ok(TaskOutcome {
                        success: complete.exit_code == 0,
                        error_message: None,
                        metrics: complete.metrics,
                        pr_url: complete.pr_url,
                    });
                }
                MessageType::VsockError => {
                    let error = VsockError::decode(&frame.payload)?;
                    warn!(task_id = %self.task_id.simple(), "task failed: {}", error.message);
                    return Ok(TaskOutcome {
                        success: false,
                        error_message: Some(error.message),
                        metrics: latest_metrics,
                        pr_url: None,
                    });
                }
                other => return Err(NodeError::UnexpectedGuestMessage(other as u8)),
            }
        }
    }

    /// Ask the guest to cancel the running task. The guest answers with a
    /// regular `vsock_complete` or `vsock_error` on the same connection.
    #[allow(dead_code)]
    pub async fn cancel(&mut self) -> NodeResult<()> {
        let id = self.next_request_id();
        write_frame(&mut self.stream, MessageType::VsockCancel, id, &[]).await?;
        Ok(())
    }

    async fn push_output(&self, output_type: OutputType, timestamp_ms: i64, data: Vec<u8>) {
        self.output.lock().await.push(OutputEvent {
            task_id: self.task_id,
            output_type,
            timestamp_ms,
            data,
        });
    }

    fn next_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
