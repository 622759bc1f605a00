pub mod auth_store;
pub mod bus;
pub mod config;
pub mod hub;
pub mod identity;
pub mod lifecycle;
pub mod memory_bus;
pub mod outbound;
pub mod registry;
pub mod session;
