//! SLIRC Engine library.
//!
//! Client-side IRC protocol engine: wire parsing, IRCv3 capability and SASL
//! negotiation, event normalization, channel membership tracking, and a
//! single resilient session with backoff-driven reconnection.
//!
//! Front ends hold a [`Client`]; everything else is exported for testing
//! and extension.

pub mod backend;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod membership;
pub mod message;
pub mod protocol;
pub mod validation;

#[cfg(test)]
mod backend_tests;

pub use backend::Client;
pub use config::{EngineSettings, Profile, SessionConfig};
pub use error::{ConfigError, EngineError, ParseError};
pub use events::Event;
pub use message::Message;
pub use protocol::{ConnectionState, NetworkHandle, UserInfo};
