//! Database infrastructure
//!
//! SQLite implementation using sqlx with:
//! - Repository pattern adapters
//! - Database migrations
//! - Connection pool management
//! - WAL mode configuration

pub mod app_repo;
pub mod connection;
pub mod deployment_repo;
pub mod server_repo;
pub mod utils;

pub use app_repo::AppRepositoryImpl;
pub use connection::DatabaseConnection;
pub use deployment_repo::DeploymentRepositoryImpl;
pub use server_repo::ServerRepositoryImpl;
