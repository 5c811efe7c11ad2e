pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod mapping;
pub mod protocol;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod token;
