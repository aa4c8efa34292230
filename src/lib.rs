//! # joonos
//!
//! A lightweight certificate authority and node-agent pair for a fleet of
//! networked devices talking over MQTT. Every device bootstraps from a
//! short-lived, shared provisioning identity to a unique, renewable node
//! identity without operator action: it generates a CSR, publishes it,
//! installs whatever certificate chain the authority signs in response,
//! and repeats the cycle before the installed certificate expires.
//!
//! ## Architecture
//!
//! - [`codec`]: PEM/DER transcoding and single-root chain verification,
//!   shared by both processes.
//! - [`types`]: credential, certificate, and private-key domain types.
//! - [`config`]: JSON configuration for the node agent and the authority.
//! - [`csr`]: CSR generation (node side).
//! - [`installer`]: certificate-chain installation (node side).
//! - [`scheduler`]: renewal-timing computation (node side).
//! - [`mqtt`]: the MQTT session supervisor and its mutual-TLS setup (node
//!   side).
//! - [`node`]: the node's state store and top-level event loop.
//! - [`telemetry`]: best-effort OS status readers feeding the status topics.
//! - [`upgrade`]: the one-shot upgrade executor.
//! - [`serial`]: the crash-safe monotonic serial allocator (authority side).
//! - [`authority`]: CSR intake, signing, and chain publication (authority
//!   side).
//! - [`error`]: the per-subsystem error taxonomy.

pub mod authority;
pub mod codec;
pub mod config;
pub mod csr;
pub mod error;
pub mod installer;
pub mod mqtt;
pub mod node;
pub mod scheduler;
pub mod serial;
pub mod telemetry;
pub mod types;
pub mod upgrade;

pub use error::{Error, Result};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{CaConfig, NodeConfig};
    pub use crate::error::{Error, Result};
    pub use crate::node::NodeState;
    pub use crate::types::{Certificate, Credential, NodeName, PrivateKey, SerialNumber};
}
