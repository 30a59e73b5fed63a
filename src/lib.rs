pub mod client;
pub mod config;
pub mod protocol;
pub mod sentinel;
pub mod server;
mod telemetry;

pub use client::{Client, ResultStream};
pub use server::{Server, ServerHandle, SessionBroker};
pub use telemetry::init_tracing;
