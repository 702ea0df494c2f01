pub mod config;
pub mod consumer;
pub mod context;
pub mod session;
pub mod types;
