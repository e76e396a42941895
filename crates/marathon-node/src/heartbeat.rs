//! Heartbeat client: one persistent connection to the orchestrator.
//!
//! Each iteration publishes node status plus the drained task results and
//! output events, then applies whatever commands come back. The loop never
//! exits on error: protocol failures close the connection and reconnect
//! after a short delay, while auth failures are logged loudly and retried
//! only at the normal cadence (operator intervention expected).

use std::sync::Arc;
use std::time::Duration;

use marathon_proto::{
    Command, CommandType, ErrorResponse, HeartbeatRequest, HeartbeatResponse, MessageType,
    NodeStatus, read_frame, write_frame,
};
use marathon_vm::VmPool;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::executor::TaskExecutor;
use crate::runner::now_ms;

/// Delay before reconnecting after a protocol or I/O failure.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Heartbeat cadence while any VM is running a task, so buffered output
/// reaches the orchestrator in near-real-time.
const ACTIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Either a plain TCP stream or its TLS wrap; the codec is transport-neutral.
trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type Conn = Box<dyn Transport>;

pub struct HeartbeatClient {
    config: Arc<NodeConfig>,
    node_id: Uuid,
    auth_key: Option<Vec<u8>>,
    pool: Arc<VmPool>,
    executor: Arc<TaskExecutor>,
    started_at: Instant,
}

impl HeartbeatClient {
    pub fn new(
        config: Arc<NodeConfig>,
        node_id: Uuid,
        auth_key: Option<Vec<u8>>,
        pool: Arc<VmPool>,
        executor: Arc<TaskExecutor>,
    ) -> Self {
        Self {
            config,
            node_id,
            auth_key,
            pool,
            executor,
            started_at: Instant::now(),
        }
    }

    /// Run the heartbeat loop forever.
    pub async fn run(self) {
        let mut conn: Option<Conn> = None;
        let idle_interval = Duration::from_millis(self.config.heartbeat_interval_ms);

        loop {
            if conn.is_none() {
                match self.connect().await {
                    Ok(stream) => {
                        info!(addr = %self.config.orchestrator_addr(), tls = self.config.tls, "connected to orchestrator");
                        conn = Some(stream);
                    }
                    Err(e) => {
                        warn!(error = %e, "orchestrator connect failed");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                }
            }

            if let Some(stream) = conn.as_mut() {
                match self.heartbeat_once(stream).await {
                    Ok(()) => {}
                    Err(NodeError::AuthFailed(msg)) => {
                        // No reconnect storm on auth errors: the key is wrong
                        // until an operator fixes it.
                        error!("orchestrator rejected heartbeat auth: {msg}");
                    }
                    Err(e) => {
                        warn!(error = %e, "heartbeat failed, reconnecting");
                        conn = None;
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                }
            }

            let delay = if self.pool.active_count().await > 0 {
                ACTIVE_INTERVAL
            } else {
                idle_interval
            };
            tokio::time::sleep(delay).await;
        }
    }

    /// One request/response exchange on an established connection.
    async fn heartbeat_once<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
    ) -> NodeResult<()> {
        let timestamp_ms = now_ms();
        let auth_token = auth::auth_token(self.auth_key.as_deref(), self.node_id, timestamp_ms);

        let request = HeartbeatRequest {
            node_id: self.node_id,
            timestamp_ms,
            auth_token,
            status: self.collect_status().await,
            completed_tasks: self.executor.drain_results().await,
            pending_output: self.executor.drain_output().await,
        };
        debug!(
            completed = request.completed_tasks.len(),
            output = request.pending_output.len(),
            warm = request.status.warm_vms,
            active = request.status.active_vms,
            uptime_seconds = self.started_at.elapsed().as_secs(),
            "sending heartbeat"
        );

        write_frame(stream, MessageType::HeartbeatRequest, 0, &request.encode()).await?;

        let frame = read_frame(stream).await?;
        match frame.msg_type {
            MessageType::HeartbeatResponse => {
                let response = HeartbeatResponse::decode(&frame.payload)?;
                for command in response.commands {
                    self.apply_command(command).await;
                }
                Ok(())
            }
            MessageType::ErrorResponse => {
                let err = ErrorResponse::decode(&frame.payload)?;
                Err(NodeError::AuthFailed(format!("{}: {}", err.code, err.message)))
            }
            other => Err(NodeError::UnexpectedResponse(other as u8)),
        }
    }

    async fn apply_command(&self, command: Command) {
        match command.command_type {
            CommandType::ExecuteTask => match command.execute_request {
                Some(request) => {
                    if let Err(e) = self.executor.execute_task(request).await {
                        // Already queued as a failed task result.
                        warn!(error = %e, "execute_task command failed");
                    }
                }
                None => warn!("execute_task command without request, ignoring"),
            },
            CommandType::WarmPool => {
                let target = command
                    .warm_pool_target
                    .map(|t| t as usize)
                    .unwrap_or_else(|| self.pool.warm_pool_target());
                info!(target, "warm_pool command received");
                // Warming boots VMs for seconds at a time; keep the
                // heartbeat cadence by running it on its own task.
                let pool = Arc::clone(&self.pool);
                tokio::spawn(async move {
                    if let Err(e) = pool.warm_pool(target).await {
                        warn!(error = %e, "warm_pool command failed");
                    }
                });
            }
            CommandType::CancelTask => {
                info!("cancel_task command received, not implemented");
            }
            CommandType::Drain => {
                info!("drain command received, not implemented");
            }
        }
    }

    async fn collect_status(&self) -> NodeStatus {
        NodeStatus {
            hostname: hostname(),
            total_vm_slots: self.pool.total_vm_slots() as u32,
            active_vms: self.pool.active_count().await as u32,
            warm_vms: self.pool.warm_count().await as u32,
            // Wire-compatible placeholders; real collection is future work
            // on the orchestrator contract.
            cpu_usage: 0.0,
            memory_usage: 0.0,
            disk_available_bytes: 0,
            healthy: true,
            draining: false,
        }
    }

    async fn connect(&self) -> NodeResult<Conn> {
        let tcp = TcpStream::connect(self.config.orchestrator_addr()).await?;
        if !self.config.tls {
            return Ok(Box::new(tcp));
        }

        let ca_path = self
            .config
            .tls_ca
            .as_ref()
            .ok_or_else(|| NodeError::Config("tls enabled but no --tls-ca given".into()))?;
        let pem = tokio::fs::read(ca_path).await?;

        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| NodeError::Tls(format!("parse CA pem: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| NodeError::Tls(format!("add CA cert: {e}")))?;
        }
        if roots.is_empty() {
            return Err(NodeError::Tls(format!(
                "no certificates in {}",
                ca_path.display()
            )));
        }

        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(self.config.orchestrator_host.clone())
            .map_err(|e| NodeError::Tls(format!("invalid server name: {e}")))?;

        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| NodeError::Tls(format!("handshake: {e}")))?;
        Ok(Box::new(stream))
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use marathon_proto::{AUTH_TOKEN_SIZE, ExecuteRequest, Frame};
    use marathon_vm::{PoolConfig, SnapshotCatalog, VmConfig};
    use std::path::Path;
    use tokio::net::UnixStream;

    async fn test_client(auth_key: Option<Vec<u8>>) -> (HeartbeatClient, Arc<TaskExecutor>) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = SnapshotCatalog::load(dir.path()).await.unwrap();
        let pool = Arc::new(VmPool::new(
            VmConfig {
                firecracker_bin: Path::new("/nonexistent/firecracker").to_path_buf(),
                kernel_path: Path::new("/nonexistent/vmlinux").to_path_buf(),
                rootfs_path: Path::new("/nonexistent/rootfs.ext4").to_path_buf(),
                vcpu_count: 1,
                mem_size_mib: 128,
            },
            PoolConfig {
                total_vm_slots: 0,
                warm_pool_target: 0,
            },
            catalog,
        ));
        let executor = Arc::new(TaskExecutor::new(Arc::clone(&pool), 9999));
        let config = Arc::new(NodeConfig::parse_from(["marathon-node"]));
        let client = HeartbeatClient::new(
            config,
            Uuid::new_v4(),
            auth_key,
            pool,
            Arc::clone(&executor),
        );
        (client, executor)
    }

    async fn read_heartbeat(stream: &mut UnixStream) -> HeartbeatRequest {
        let frame: Frame = read_frame(stream).await.unwrap();
        assert_eq!(frame.msg_type, MessageType::HeartbeatRequest);
        HeartbeatRequest::decode(&frame.payload).unwrap()
    }

    #[tokio::test]
    async fn heartbeat_carries_status_and_zero_token_without_key() {
        let (client, _executor) = test_client(None).await;
        let (mut node_side, mut orch_side) = UnixStream::pair().unwrap();

        let orchestrator = tokio::spawn(async move {
            let request = read_heartbeat(&mut orch_side).await;
            assert_eq!(request.auth_token, [0u8; AUTH_TOKEN_SIZE]);
            assert_eq!(request.status.total_vm_slots, 0);
            assert_eq!(request.status.active_vms, 0);
            assert!(request.status.healthy);
            assert!(!request.status.draining);
            assert!(!request.status.hostname.is_empty());
            assert!(request.completed_tasks.is_empty());
            assert!(request.pending_output.is_empty());

            let response = HeartbeatResponse::default();
            write_frame(
                &mut orch_side,
                MessageType::HeartbeatResponse,
                0,
                &response.encode(),
            )
            .await
            .unwrap();
        });

        client.heartbeat_once(&mut node_side).await.unwrap();
        orchestrator.await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_token_is_verifiable_by_orchestrator() {
        let key = vec![0x5Au8; 32];
        let (client, _executor) = test_client(Some(key.clone())).await;
        let node_id = client.node_id;
        let (mut node_side, mut orch_side) = UnixStream::pair().unwrap();

        let orchestrator = tokio::spawn(async move {
            let request = read_heartbeat(&mut orch_side).await;
            let expected = auth::auth_token(Some(&key), node_id, request.timestamp_ms);
            assert_eq!(request.auth_token, expected);

            write_frame(
                &mut orch_side,
                MessageType::HeartbeatResponse,
                0,
                &HeartbeatResponse::default().encode(),
            )
            .await
            .unwrap();
        });

        client.heartbeat_once(&mut node_side).await.unwrap();
        orchestrator.await.unwrap();
    }

    #[tokio::test]
    async fn error_response_is_classified_as_auth_failure() {
        let (client, _executor) = test_client(Some(vec![1u8; 32])).await;
        let (mut node_side, mut orch_side) = UnixStream::pair().unwrap();

        let orchestrator = tokio::spawn(async move {
            let _ = read_heartbeat(&mut orch_side).await;
            let error = ErrorResponse {
                code: "AUTH_FAILED".into(),
                message: "hmac mismatch".into(),
            };
            write_frame(&mut orch_side, MessageType::ErrorResponse, 0, &error.encode())
                .await
                .unwrap();
        });

        let err = client.heartbeat_once(&mut node_side).await.unwrap_err();
        orchestrator.await.unwrap();
        match err {
            NodeError::AuthFailed(msg) => {
                assert!(msg.contains("AUTH_FAILED"), "got: {msg}");
            }
            other => panic!("expected AuthFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn unexpected_reply_type_is_an_error() {
        let (client, _executor) = test_client(None).await;
        let (mut node_side, mut orch_side) = UnixStream::pair().unwrap();

        let orchestrator = tokio::spawn(async move {
            let _ = read_heartbeat(&mut orch_side).await;
            write_frame(&mut orch_side, MessageType::VsockReady, 0, &[])
                .await
                .unwrap();
        });

        let err = client.heartbeat_once(&mut node_side).await.unwrap_err();
        orchestrator.await.unwrap();
        assert!(matches!(err, NodeError::UnexpectedResponse(_)));
    }

    #[tokio::test]
    async fn closed_connection_yields_connection_closed() {
        let (client, _executor) = test_client(None).await;
        let (mut node_side, orch_side) = UnixStream::pair().unwrap();
        drop(orch_side);

        let err = client.heartbeat_once(&mut node_side).await.unwrap_err();
        assert!(matches!(
            err,
            NodeError::Proto(marathon_proto::ProtoError::ConnectionClosed)
                | NodeError::Io(_)
        ));
    }

    #[tokio::test]
    async fn execute_command_failure_surfaces_on_next_drain() {
        // The pool has zero slots, so the command fails and the failure is
        // queued for the next heartbeat.
        let (client, executor) = test_client(None).await;
        let (mut node_side, mut orch_side) = UnixStream::pair().unwrap();
        let task_id = Uuid::new_v4();

        let orchestrator = tokio::spawn(async move {
            let _ = read_heartbeat(&mut orch_side).await;
            let response = HeartbeatResponse {
                commands: vec![Command {
                    command_type: CommandType::ExecuteTask,
                    execute_request: Some(ExecuteRequest {
                        task_id,
                        repo_url: "https://github.com/test/repo".into(),
                        branch: "main".into(),
                        prompt: "Fix".into(),
                        ..ExecuteRequest::default()
                    }),
                    warm_pool_target: None,
                }],
            };
            write_frame(
                &mut orch_side,
                MessageType::HeartbeatResponse,
                0,
                &response.encode(),
            )
            .await
            .unwrap();
        });

        client.heartbeat_once(&mut node_side).await.unwrap();
        orchestrator.await.unwrap();

        let results = executor.drain_results().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].task_id, task_id);
        assert!(!results[0].success);
        assert_eq!(results[0].error_message.as_deref(), Some("NoAvailableVm"));
    }

    #[tokio::test]
    async fn drain_and_cancel_commands_are_accepted() {
        let (client, _executor) = test_client(None).await;
        let (mut node_side, mut orch_side) = UnixStream::pair().unwrap();

        let orchestrator = tokio::spawn(async move {
            let _ = read_heartbeat(&mut orch_side).await;
            let response = HeartbeatResponse {
                commands: vec![
                    Command {
                        command_type: CommandType::CancelTask,
                        execute_request: None,
                        warm_pool_target: None,
                    },
                    Command {
                        command_type: CommandType::Drain,
                        execute_request: None,
                        warm_pool_target: None,
                    },
                ],
            };
            write_frame(
                &mut orch_side,
                MessageType::HeartbeatResponse,
                0,
                &response.encode(),
            )
            .await
            .unwrap();
        });

        // Accepted and logged; the iteration still succeeds.
        client.heartbeat_once(&mut node_side).await.unwrap();
        orchestrator.await.unwrap();
    }
}
