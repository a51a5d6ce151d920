//! # LocalComm
//!
//! Local-network connectivity between a service and the remote objects it
//! manages. Objects advertise TCP endpoints; the service discovers them,
//! connects over mutual TLS (or plaintext where allowed), establishes both
//! identities and binds each connection to a remote object. When an object is
//! reachable through more than one endpoint the extra connections are kept as
//! backups and promoted when the active one drops.
//!
//! ## Key Modules
//! * `config` – TOML configuration with defaults.
//! * `network` – Peer state machine, discovery, local clients and their manager, object-side listener.
//! * `security` – Certificates, trust policy and the TLS channel with certificate sharing.
//! * `objs` – Remote objects, their connectivity facade and the object registry.
//! * `events` – Structured logging/events dispatcher.

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod network;
pub mod objs;
pub mod security;

pub use error::{LocalCommError, Result};
