pub mod bootstrap;
pub mod config;
pub mod connector;
pub mod diag;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod peers;
pub mod server;
pub mod store;
