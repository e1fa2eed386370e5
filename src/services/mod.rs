//! In-process services: the leaves the core subsystems are built from.

pub mod agent_hub;
pub mod command_queue;
pub mod event_fabric;
pub mod executor;
pub mod health;
pub mod locker;
pub mod token_store;

pub use agent_hub::AgentHub;
pub use command_queue::CommandQueue;
pub use event_fabric::{Delivery, EventFabric, Subscription};
pub use executor::{sanitize_arg, CommandOutput, Executor};
pub use health::{HealthChecker, ProbePolicy};
pub use locker::Locker;
pub use token_store::TokenStore;
