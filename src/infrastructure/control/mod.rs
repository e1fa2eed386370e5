//! mTLS control channel between the plane and its agents.
//!
//! The wire format is length-delimited JSON frames multiplexed by request
//! id over a single TLS 1.3 stream. Each connection has one caller side and
//! one handler side: agents call the plane (Register/Heartbeat) on the
//! plane listener, the plane calls agents (deploys, container ops, streams)
//! through the client pool.

pub mod client_pool;
pub mod connection;
pub mod plane_server;
pub mod protocol;
pub mod tls;

pub use client_pool::{AgentClient, AgentClientPool, DeployOutcome, PushOutcome};
pub use connection::{
    serve_connection, InboundItem, RpcClient, RpcContext, RpcHandler, RpcStream, StreamEvent,
};
pub use plane_server::{liveness_sweep, PlaneControlServer};
pub use protocol::{
    DeploySpec, ErrorCode, Frame, FrameBody, Request, Response, StreamItem, WireCommand, WireError,
};
pub use tls::TlsMaterial;
