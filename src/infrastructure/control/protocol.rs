//! Wire messages of the control channel.
//!
//! Frames are serde_json payloads inside length-delimited frames. A unary
//! exchange is Request → Response. Server-streaming is Request →
//! StreamItem* → Response. Client-streaming is Request → (client)
//! StreamItem* → StreamEnd → Response. Bidirectional interleaves items both
//! ways until either side ends. Cancel aborts the callee's handler.

use serde::{Deserialize, Serialize};

use crate::domain::models::{AgentCommand, AgentCommandKind, AppConfig, AppId, DeploymentId};

/// One multiplexed frame. `id` pairs requests with their responses and
/// stream items; ids are assigned by the caller and never reused within a
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: u64,
    pub body: FrameBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum FrameBody {
    Request(Request),
    Response(Result<Response, WireError>),
    StreamItem(StreamItem),
    /// No more items will follow in this direction.
    StreamEnd { error: Option<String> },
    /// Caller aborts the exchange; the callee stops its handler.
    Cancel,
}

/// Error category carried across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthenticated,
    InvalidArgument,
    NotFound,
    Internal,
    Unavailable,
}

/// A failure response from the remote handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthenticated, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// A control command in wire form. The kind travels as its raw string so an
/// older agent can log and ignore values it does not know instead of
/// failing to decode the whole heartbeat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireCommand {
    pub command: String,
    #[serde(default)]
    pub payload: String,
}

impl From<&AgentCommand> for WireCommand {
    fn from(cmd: &AgentCommand) -> Self {
        Self {
            command: cmd.kind.as_wire().to_string(),
            payload: cmd.payload.clone(),
        }
    }
}

impl WireCommand {
    /// Decode into a known command; `None` for unknown wire values.
    pub fn decode(&self) -> Option<AgentCommand> {
        AgentCommandKind::from_wire(&self.command)
            .map(|kind| AgentCommand::with_payload(kind, self.payload.clone()))
    }
}

/// Everything an agent needs to run one deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySpec {
    pub app_id: AppId,
    pub deployment_id: DeploymentId,
    pub app_name: String,
    pub repo_url: String,
    pub branch: String,
    pub commit_sha: String,
    pub workdir: String,
    pub config: AppConfig,
    /// Image live before this deploy; recorded for rollback.
    pub previous_image_tag: Option<String>,
    /// When set, skip clone and build and run this image directly. Used by
    /// the rollback path.
    pub rollback_to: Option<String>,
}

/// Requests the caller side can open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    // Agent → plane.
    Register { agent_version: String },
    Heartbeat { agent_version: String },

    // Plane → agent, unary.
    GetSystemInfo,
    GetSystemMetrics,
    GetDockerInfo,
    ListContainers,
    RestartContainer { container_id: String },
    StopContainer { container_id: String },
    StartContainer { container_id: String },
    RemoveContainer { container_id: String },
    ListImages,
    RemoveImage { image_id: String },
    PruneImages,
    ListNetworks,
    CreateNetwork { name: String },
    RemoveNetwork { name: String },
    ListVolumes,
    CreateVolume { name: String },
    RemoveVolume { name: String },
    UpdateDomains { domains: Vec<String> },
    ExecuteDeploy(DeploySpec),

    // Plane → agent, server-streaming.
    StreamDeployLogs { deployment_id: DeploymentId },
    GetContainerLogs { container_id: String, tail: u32, follow: bool },
    GetContainerStats { container_id: String, stream: bool },

    // Plane → agent, client-streaming: UpdateChunk items then StreamEnd.
    PushUpdate { version: String, total_size: u64, sha256_hex: Option<String> },

    // Plane → agent, bidirectional terminal session.
    ExecContainer { container_id: String },
}

impl Request {
    /// Short name for logging.
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Heartbeat { .. } => "heartbeat",
            Self::GetSystemInfo => "get_system_info",
            Self::GetSystemMetrics => "get_system_metrics",
            Self::GetDockerInfo => "get_docker_info",
            Self::ListContainers => "list_containers",
            Self::RestartContainer { .. } => "restart_container",
            Self::StopContainer { .. } => "stop_container",
            Self::StartContainer { .. } => "start_container",
            Self::RemoveContainer { .. } => "remove_container",
            Self::ListImages => "list_images",
            Self::RemoveImage { .. } => "remove_image",
            Self::PruneImages => "prune_images",
            Self::ListNetworks => "list_networks",
            Self::CreateNetwork { .. } => "create_network",
            Self::RemoveNetwork { .. } => "remove_network",
            Self::ListVolumes => "list_volumes",
            Self::CreateVolume { .. } => "create_volume",
            Self::RemoveVolume { .. } => "remove_volume",
            Self::UpdateDomains { .. } => "update_domains",
            Self::ExecuteDeploy(_) => "execute_deploy",
            Self::StreamDeployLogs { .. } => "stream_deploy_logs",
            Self::GetContainerLogs { .. } => "get_container_logs",
            Self::GetContainerStats { .. } => "get_container_stats",
            Self::PushUpdate { .. } => "push_update",
            Self::ExecContainer { .. } => "exec_container",
        }
    }
}

/// Host facts reported by `GetSystemInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub kernel: String,
    pub arch: String,
}

/// Point-in-time host metrics reported by `GetSystemMetrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub load_1m: f64,
    pub mem_total_kb: u64,
    pub mem_available_kb: u64,
    pub disk_used_percent: f64,
}

/// Responses, one per request family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Registered {
        accepted: bool,
        heartbeat_interval_secs: u64,
    },
    HeartbeatAck {
        commands: Vec<WireCommand>,
    },
    SystemInfo(SystemInfo),
    SystemMetrics(SystemMetrics),
    /// Raw output of a container/image/network/volume operation.
    Output {
        text: String,
    },
    /// Simple acknowledgement.
    Ack {
        message: String,
    },
    DeployResult {
        success: bool,
        error: Option<String>,
        image_tag: Option<String>,
        /// Buffered copy of the per-step log lines.
        logs: String,
    },
    PushUpdateAck {
        success: bool,
        message: String,
    },
    /// Terminal response of a server-streaming exchange.
    StreamDone,
}

/// Items flowing inside a streaming exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "item", rename_all = "snake_case")]
pub enum StreamItem {
    /// One log line (deploy logs, container logs).
    LogLine { line: String },
    /// One stats sample, JSON-encoded as emitted by the container tool.
    StatSample { json: String },
    /// One chunk of an agent binary push, hex-encoded.
    UpdateChunk { data_hex: String },
    /// Terminal input, plane → agent.
    ExecInput { data: String },
    /// Terminal output, agent → plane.
    ExecOutput { data: String },
    /// Terminal resize, plane → agent.
    ExecResize { cols: u16, rows: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let frame = Frame {
            id: 7,
            body: FrameBody::Request(Request::Heartbeat { agent_version: "1.0.0".into() }),
        };
        let bytes = serde_json::to_vec(&frame).unwrap();
        let back: Frame = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.id, 7);
        match back.body {
            FrameBody::Request(Request::Heartbeat { agent_version }) => {
                assert_eq!(agent_version, "1.0.0");
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_unknown_command_survives_decoding() {
        // A plane newer than the agent may send commands the agent does not
        // know; the envelope still decodes and the command maps to None.
        let raw = r#"{"command":"AGENT_COMMAND_DEFRAGMENT","payload":""}"#;
        let wire: WireCommand = serde_json::from_str(raw).unwrap();
        assert!(wire.decode().is_none());
    }

    #[test]
    fn test_known_command_decodes() {
        let wire = WireCommand {
            command: "AGENT_COMMAND_UPDATE_AGENT".into(),
            payload: "https://plane/agent/binary?token=ab".into(),
        };
        let cmd = wire.decode().unwrap();
        assert_eq!(cmd.kind, AgentCommandKind::UpdateAgent);
        assert!(cmd.payload.contains("token="));
    }

    #[test]
    fn test_error_code_wire_names() {
        let err = WireError::unauthenticated("bad OU");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "UNAUTHENTICATED");
    }
}
