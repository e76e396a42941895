//! Typed message payloads.
//!
//! Each struct encodes to and decodes from the payload bytes of one frame.
//! Field order on the wire is fixed; see the per-type `encode` methods.

use uuid::Uuid;

use crate::wire::{Reader, Writer};
use crate::{AUTH_TOKEN_SIZE, ProtoError, Result};

/// Additive usage counters reported by the guest agent.
///
/// Counts are non-negative; the wire stores them as signed 64-bit for
/// compatibility, so negative values decode to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub tool_calls: u64,
    pub compute_time_ms: u64,
}

impl UsageMetrics {
    pub fn add(&mut self, other: &UsageMetrics) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.tool_calls += other.tool_calls;
        self.compute_time_ms += other.compute_time_ms;
    }

    fn write(&self, w: &mut Writer) {
        w.put_i64(self.input_tokens as i64);
        w.put_i64(self.output_tokens as i64);
        w.put_i64(self.cache_read_tokens as i64);
        w.put_i64(self.cache_write_tokens as i64);
        w.put_i64(self.tool_calls as i64);
        w.put_i64(self.compute_time_ms as i64);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let mut count = || -> Result<u64> { Ok(r.i64("metrics")?.max(0) as u64) };
        Ok(Self {
            input_tokens: count()?,
            output_tokens: count()?,
            cache_read_tokens: count()?,
            cache_write_tokens: count()?,
            tool_calls: count()?,
            compute_time_ms: count()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.write(&mut w);
        w.into_inner()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Self::read(&mut Reader::new(payload))
    }
}

/// Which guest stream an output event came from.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    Stdout = 0,
    Stderr = 1,
}

impl OutputType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Stdout),
            1 => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// One chunk of task output, queued node-side until the next heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub task_id: Uuid,
    pub output_type: OutputType,
    pub timestamp_ms: i64,
    pub data: Vec<u8>,
}

impl OutputEvent {
    fn write(&self, w: &mut Writer) {
        w.put_id(self.task_id);
        w.put_u8(self.output_type as u8);
        w.put_i64(self.timestamp_ms);
        w.put_bytes(&self.data);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let task_id = r.id("output task_id")?;
        let type_byte = r.u8("output_type")?;
        let output_type = OutputType::from_u8(type_byte)
            .ok_or(ProtoError::InvalidPayload("unknown output_type"))?;
        Ok(Self {
            task_id,
            output_type,
            timestamp_ms: r.i64("output timestamp")?,
            data: r.bytes("output data")?,
        })
    }
}

/// Final report for one task run.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub success: bool,
    pub error_message: Option<String>,
    pub metrics: UsageMetrics,
    pub pr_url: Option<String>,
}

impl TaskResult {
    fn write(&self, w: &mut Writer) {
        w.put_id(self.task_id);
        w.put_bool(self.success);
        w.put_opt_str(self.error_message.as_deref());
        self.metrics.write(w);
        w.put_opt_str(self.pr_url.as_deref());
    }

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            task_id: r.id("result task_id")?,
            success: r.bool("result success")?,
            error_message: r.opt_str("result error")?,
            metrics: UsageMetrics::read(r)?,
            pr_url: r.opt_str("result pr_url")?,
        })
    }
}

/// Point-in-time node health published with every heartbeat.
///
/// The cpu/memory/disk fields are wire-compatible placeholders; the node
/// currently reports zeros.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub hostname: String,
    pub total_vm_slots: u32,
    pub active_vms: u32,
    pub warm_vms: u32,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_available_bytes: i64,
    pub healthy: bool,
    pub draining: bool,
}

/// Node → orchestrator heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatRequest {
    pub node_id: Uuid,
    pub timestamp_ms: i64,
    pub auth_token: [u8; AUTH_TOKEN_SIZE],
    pub status: NodeStatus,
    pub completed_tasks: Vec<TaskResult>,
    pub pending_output: Vec<OutputEvent>,
}

impl HeartbeatRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_id(self.node_id);
        w.put_i64(self.timestamp_ms);
        w.put_token(&self.auth_token);
        w.put_str(&self.status.hostname);
        w.put_u32(self.status.total_vm_slots);
        w.put_u32(self.status.active_vms);
        w.put_u32(self.status.warm_vms);
        w.put_f64(self.status.cpu_usage);
        w.put_f64(self.status.memory_usage);
        w.put_i64(self.status.disk_available_bytes);
        w.put_bool(self.status.healthy);
        w.put_bool(self.status.draining);
        w.put_u32(self.completed_tasks.len() as u32);
        for task in &self.completed_tasks {
            task.write(&mut w);
        }
        w.put_u32(self.pending_output.len() as u32);
        for event in &self.pending_output {
            event.write(&mut w);
        }
        w.into_inner()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let node_id = r.id("node_id")?;
        let timestamp_ms = r.i64("timestamp")?;
        let auth_token = r.token("auth_token")?;
        let status = NodeStatus {
            hostname: r.str("hostname")?,
            total_vm_slots: r.u32("total_vm_slots")?,
            active_vms: r.u32("active_vms")?,
            warm_vms: r.u32("warm_vms")?,
            cpu_usage: r.f64("cpu_usage")?,
            memory_usage: r.f64("memory_usage")?,
            disk_available_bytes: r.i64("disk_available_bytes")?,
            healthy: r.bool("healthy")?,
            draining: r.bool("draining")?,
        };
        let task_count = r.u32("completed count")?;
        let mut completed_tasks = Vec::with_capacity(task_count.min(1024) as usize);
        for _ in 0..task_count {
            completed_tasks.push(TaskResult::read(&mut r)?);
        }
        let output_count = r.u32("output count")?;
        let mut pending_output = Vec::with_capacity(output_count.min(1024) as usize);
        for _ in 0..output_count {
            pending_output.push(OutputEvent::read(&mut r)?);
        }
        Ok(Self {
            node_id,
            timestamp_ms,
            auth_token,
            status,
            completed_tasks,
            pending_output,
        })
    }
}

/// Orchestrator → node command kind.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    ExecuteTask = 0,
    CancelTask = 1,
    Drain = 2,
    WarmPool = 3,
}

impl CommandType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::ExecuteTask),
            1 => Some(Self::CancelTask),
            2 => Some(Self::Drain),
            3 => Some(Self::WarmPool),
            _ => None,
        }
    }
}

/// One command delivered in a heartbeat response.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub command_type: CommandType,
    pub execute_request: Option<ExecuteRequest>,
    pub warm_pool_target: Option<u32>,
}

impl Command {
    fn write(&self, w: &mut Writer) {
        w.put_u8(self.command_type as u8);
        match &self.execute_request {
            Some(req) => {
                w.put_u8(1);
                req.write(w);
            }
            None => w.put_u8(0),
        }
        w.put_opt_u32(self.warm_pool_target);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let type_byte = r.u8("command_type")?;
        let command_type = CommandType::from_u8(type_byte)
            .ok_or(ProtoError::InvalidPayload("unknown command_type"))?;
        let execute_request = if r.bool("execute flag")? {
            Some(ExecuteRequest::read(r)?)
        } else {
            None
        };
        Ok(Self {
            command_type,
            execute_request,
            warm_pool_target: r.opt_u32("warm_pool_target")?,
        })
    }
}

/// Orchestrator → node heartbeat reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatResponse {
    pub commands: Vec<Command>,
}

impl HeartbeatResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u32(self.commands.len() as u32);
        for command in &self.commands {
            command.write(&mut w);
        }
        w.into_inner()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let count = r.u32("command count")?;
        let mut commands = Vec::with_capacity(count.min(256) as usize);
        for _ in 0..count {
            commands.push(Command::read(&mut r)?);
        }
        Ok(Self { commands })
    }
}

/// Full task payload: carried both in `execute_task` commands and as the
/// `vsock_start` payload handed to the guest agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteRequest {
    pub task_id: Uuid,
    pub repo_url: String,
    pub branch: String,
    pub prompt: String,
    pub github_token: String,
    pub model_api_key: String,
    pub create_pr: bool,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    pub max_iterations: Option<u32>,
    pub completion_promise: Option<String>,
    pub env_vars: Vec<(String, String)>,
}

impl ExecuteRequest {
    fn write(&self, w: &mut Writer) {
        w.put_id(self.task_id);
        w.put_str(&self.repo_url);
        w.put_str(&self.branch);
        w.put_str(&self.prompt);
        w.put_str(&self.github_token);
        w.put_str(&self.model_api_key);
        w.put_bool(self.create_pr);
        w.put_opt_str(self.pr_title.as_deref());
        w.put_opt_str(self.pr_body.as_deref());
        w.put_opt_u32(self.max_iterations);
        w.put_opt_str(self.completion_promise.as_deref());
        w.put_u32(self.env_vars.len() as u32);
        for (key, value) in &self.env_vars {
            w.put_str(key);
            w.put_str(value);
        }
    }

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let task_id = r.id("task_id")?;
        let repo_url = r.str("repo_url")?;
        let branch = r.str("branch")?;
        let prompt = r.str("prompt")?;
        let github_token = r.str("github_token")?;
        let model_api_key = r.str("model_api_key")?;
        let create_pr = r.bool("create_pr")?;
        let pr_title = r.opt_str("pr_title")?;
        let pr_body = r.opt_str("pr_body")?;
        let max_iterations = r.opt_u32("max_iterations")?;
        let completion_promise = r.opt_str("completion_promise")?;
        let env_count = r.u32("env count")?;
        let mut env_vars = Vec::with_capacity(env_count.min(256) as usize);
        for _ in 0..env_count {
            env_vars.push((r.str("env key")?, r.str("env value")?));
        }
        Ok(Self {
            task_id,
            repo_url,
            branch,
            prompt,
            github_token,
            model_api_key,
            create_pr,
            pr_title,
            pr_body,
            max_iterations,
            completion_promise,
            env_vars,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.write(&mut w);
        w.into_inner()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Self::read(&mut Reader::new(payload))
    }
}

/// Orchestrator-side failure reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_str(&self.code);
        w.put_str(&self.message);
        w.into_inner()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self {
            code: r.str("error code")?,
            message: r.str("error message")?,
        })
    }
}

/// Guest → host output chunk. The host fills in the task id when it queues
/// the event, since the vsock connection serves exactly one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsockOutput {
    pub output_type: OutputType,
    pub timestamp_ms: i64,
    pub data: Vec<u8>,
}

impl VsockOutput {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(self.output_type as u8);
        w.put_i64(self.timestamp_ms);
        w.put_bytes(&self.data);
        w.into_inner()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let type_byte = r.u8("output_type")?;
        let output_type = OutputType::from_u8(type_byte)
            .ok_or(ProtoError::InvalidPayload("unknown output_type"))?;
        Ok(Self {
            output_type,
            timestamp_ms: r.i64("output timestamp")?,
            data: r.bytes("output data")?,
        })
    }
}

/// Guest → host iteration progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsockProgress {
    pub iteration: u32,
    pub max_iterations: u32,
    pub status: String,
}

impl VsockProgress {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u32(self.iteration);
        w.put_u32(self.max_iterations);
        w.put_str(&self.status);
        w.into_inner()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self {
            iteration: r.u32("progress iteration")?,
            max_iterations: r.u32("progress max")?,
            status: r.str("progress status")?,
        })
    }
}

/// Guest → host task completion.
#[derive(Debug, Clone, PartialEq)]
pub struct VsockComplete {
    pub exit_code: i32,
    pub pr_url: Option<String>,
    pub metrics: UsageMetrics,
    pub iterations_completed: u32,
    pub promise_found: bool,
}

impl VsockComplete {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_i32(self.exit_code);
        w.put_opt_str(self.pr_url.as_deref());
        self.metrics.write(&mut w);
        w.put_u32(self.iterations_completed);
        w.put_bool(self.promise_found);
        w.into_inner()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self {
            exit_code: r.i32("complete exit_code")?,
            pr_url: r.opt_str("complete pr_url")?,
            metrics: UsageMetrics::read(&mut r)?,
            iterations_completed: r.u32("complete iterations")?,
            promise_found: r.bool("complete promise_found")?,
        })
    }
}

/// Guest → host fatal task error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsockError {
    pub message: String,
}

impl VsockError {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_str(&self.message);
        w.into_inner()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            message: Reader::new(payload).str("error message")?,
        })
    }
}
