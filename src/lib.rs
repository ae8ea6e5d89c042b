//! # meshlink - connection lifecycle manager for Meshtastic radios
//!
//! meshlink opens a link to a Meshtastic device over HTTP, Bluetooth LE or a USB serial
//! port, drives the two-stage configuration handshake, keeps the link alive and reports a
//! single status model for every saved connection, whatever the medium.
//!
//! ## Features
//!
//! - **Uniform transports**: one open/close/link-loss/probe contract for network, wireless
//!   and serial devices, each handling its own authorization (certificate trust, pairing,
//!   port exclusivity).
//! - **Per-record serialization**: every record has its own worker; commands, session
//!   events and timers for a record are applied one at a time, records never block each other.
//! - **Two-stage handshake**: `connected` after basic configuration, `configured` after the
//!   full node database sync, never the other way round.
//! - **Durable registry**: records survive restarts in an atomically written JSON file and
//!   come back `disconnected` until reconciled.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshlink::config::Config;
//! use meshlink::manager::{ConnectionManager, ManagerSettings};
//! use meshlink::registry::JsonRecordStore;
//! use meshlink::transport::{system_transports, OpenOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let store = Arc::new(JsonRecordStore::open(&config.storage.registry_file)?);
//!     let manager = ConnectionManager::new(
//!         store,
//!         system_transports(&config)?,
//!         ManagerSettings::from_config(&config.manager),
//!     );
//!     for record in manager.records() {
//!         let ok = manager.connect(record.id, OpenOptions::default()).await?;
//!         println!("{}: {}", record.name, if ok { "connected" } else { "failed" });
//!     }
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`manager`] - commands, per-record state machine, observers, probing
//! - [`protocol`] - protobuf envelope and the handshake-driving protocol session
//! - [`transport`] - the transport contract and the network, serial, wireless and in-memory adapters
//! - [`registry`] - connection records and their persistence
//! - [`config`] - TOML configuration
//! - [`error`] - error taxonomy
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Manager      │ ← per-record workers, status model
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Protocol Session│ ← handshake stages, keep-alive frames
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Transports    │ ← HTTP / BLE / serial
//! └─────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod logutil;
pub mod manager;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod transport;
