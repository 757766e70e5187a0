pub mod connection;
#[cfg(test)]
mod fixtures;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, ping, DbPool};
pub use repositories::{RepositoryError, SqlApprovalStore, SqlTimerStore, SqlWorkflowStore};
