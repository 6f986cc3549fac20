//! Shared types for netfuzz.
//!
//! This crate contains:
//! - **Credentials**: openrc-style `KEY=VALUE` parsing with `$VAR` / `${VAR}` resolution
//! - **Models**: resource indices, command kinds, and the network/subnet naming scheme

pub mod credentials;
pub mod models;

pub use credentials::{ConfigError, CredentialResolver, Credentials};
pub use models::{CommandKind, NamingScheme, ResourceIndex};
