//! Control commands queued for agents and drained on heartbeat.

use serde::{Deserialize, Serialize};

/// Kind of a control command, matching the wire values of the protocol.
///
/// Unknown wire values are not representable here on purpose: the agent
/// logs and drops them at the decoding boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentCommandKind {
    #[serde(rename = "AGENT_COMMAND_UPDATE_AGENT")]
    UpdateAgent,
    #[serde(rename = "AGENT_COMMAND_RESTART")]
    Restart,
    #[serde(rename = "AGENT_COMMAND_SHUTDOWN")]
    Shutdown,
    #[serde(rename = "AGENT_COMMAND_RELOAD_CONFIG")]
    ReloadConfig,
}

impl AgentCommandKind {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::UpdateAgent => "AGENT_COMMAND_UPDATE_AGENT",
            Self::Restart => "AGENT_COMMAND_RESTART",
            Self::Shutdown => "AGENT_COMMAND_SHUTDOWN",
            Self::ReloadConfig => "AGENT_COMMAND_RELOAD_CONFIG",
        }
    }

    /// Decode a wire value; `None` for values this agent does not know.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "AGENT_COMMAND_UPDATE_AGENT" => Some(Self::UpdateAgent),
            "AGENT_COMMAND_RESTART" => Some(Self::Restart),
            "AGENT_COMMAND_SHUTDOWN" => Some(Self::Shutdown),
            "AGENT_COMMAND_RELOAD_CONFIG" => Some(Self::ReloadConfig),
            _ => None,
        }
    }
}

/// A queued command plus its opaque payload.
///
/// For `UpdateAgent` the payload is the tokenized download URL; the other
/// kinds carry an empty payload today.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub kind: AgentCommandKind,
    #[serde(default)]
    pub payload: String,
}

impl AgentCommand {
    pub fn new(kind: AgentCommandKind) -> Self {
        Self { kind, payload: String::new() }
    }

    pub fn with_payload(kind: AgentCommandKind, payload: impl Into<String>) -> Self {
        Self { kind, payload: payload.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values_round_trip() {
        for kind in [
            AgentCommandKind::UpdateAgent,
            AgentCommandKind::Restart,
            AgentCommandKind::Shutdown,
            AgentCommandKind::ReloadConfig,
        ] {
            assert_eq!(AgentCommandKind::from_wire(kind.as_wire()), Some(kind));
        }
    }

    #[test]
    fn test_unknown_wire_value_is_none() {
        assert_eq!(AgentCommandKind::from_wire("AGENT_COMMAND_DANCE"), None);
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let cmd = AgentCommand::new(AgentCommandKind::Restart);
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["kind"], "AGENT_COMMAND_RESTART");
    }
}
