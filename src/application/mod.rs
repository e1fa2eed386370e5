//! Application layer: the orchestrating subsystems of the plane and the
//! agent runtime.

pub mod agent;
pub mod agent_updater;
pub mod deploy_engine;
pub mod gateway;
pub mod provisioner;

pub use agent_updater::AgentUpdater;
pub use deploy_engine::{DeployEngine, DeployRequest};
pub use gateway::{AgentGateway, PooledAgentGateway};
pub use provisioner::Provisioner;
