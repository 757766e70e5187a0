pub mod api;
pub mod bootstrap;
pub mod health;
pub mod identity;
