use marathon_proto::ProtoError;
use marathon_vm::VmError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("authentication rejected by orchestrator: {0}")]
    AuthFailed(String),

    #[error("unexpected response type: 0x{0:02X}")]
    UnexpectedResponse(u8),

    #[error("unexpected message from guest: 0x{0:02X}")]
    UnexpectedGuestMessage(u8),

    #[error("guest did not accept a vsock connection: {0}")]
    VsockConnectFailed(String),

    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("vm error: {0}")]
    Vm(#[from] VmError),

    #[error("config error: {0}")]
    Config(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Short stable name, used as the error message in task-result reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AuthFailed(_) => "AuthFailed",
            Self::UnexpectedResponse(_) => "UnexpectedResponse",
            Self::UnexpectedGuestMessage(_) => "UnexpectedGuestMessage",
            Self::VsockConnectFailed(_) => "VsockConnectFailed",
            Self::Proto(ProtoError::InvalidMagic(_)) => "InvalidMagic",
            Self::Proto(ProtoError::ConnectionClosed) => "ConnectionClosed",
            Self::Proto(ProtoError::UnexpectedMessageType(_)) => "UnexpectedMessageType",
            Self::Proto(_) => "ProtocolError",
            Self::Vm(VmError::NoAvailableVm) => "NoAvailableVm",
            Self::Vm(_) => "VmError",
            Self::Config(_) => "ConfigError",
            Self::Tls(_) => "TlsError",
            Self::Io(_) => "IoError",
        }
    }
}

pub type NodeResult<T> = Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_stable_per_variant() {
        assert_eq!(NodeError::Vm(VmError::NoAvailableVm).name(), "NoAvailableVm");
        assert_eq!(
            NodeError::Proto(ProtoError::ConnectionClosed).name(),
            "ConnectionClosed"
        );
        assert_eq!(NodeError::AuthFailed("x".into()).name(), "AuthFailed");
    }
}
