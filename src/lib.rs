// ABOUTME: Root library module exposing the USSD gateway's HTTP surface and storage
// ABOUTME: Re-exports the platform-agnostic bridge, config, and message model from ussdgate-core

pub mod handler;
pub mod push;
pub mod server;
pub mod store;

// Re-export platform-agnostic modules from ussdgate-core
pub use ussdgate_core::bridge;
pub use ussdgate_core::channel;
pub use ussdgate_core::config;
pub use ussdgate_core::message;
pub use ussdgate_core::metrics;
pub use ussdgate_core::paths;
pub use ussdgate_core::urn;

pub use ussdgate_core::{Backend, SessionBridge};
