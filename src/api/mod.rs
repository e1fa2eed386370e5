//! HTTP surface of the plane: the agent binary download endpoint and the
//! per-topic event streams, wrapped in the typed response envelope.

pub mod envelope;
pub mod http;

pub use envelope::{ApiErrorCode, Envelope};
pub use http::{router, ApiState};
