//! Private PKI for the control channel.
//!
//! One long-lived self-signed root; short-lived leaves whose CN is the
//! server id and whose OU tags the peer's role. Every mTLS link in the
//! system chains to this root.

pub mod authority;
pub mod identity;

pub use authority::{CertificateAuthority, IssuedLeaf};
pub use identity::{peer_identity_from_der, PeerIdentity};

/// OU value carried by agent leaves.
pub const AGENT_ROLE: &str = "caravel-agent";
/// OU value carried by the plane's client/server leaves.
pub const PLANE_ROLE: &str = "caravel-control-plane";
