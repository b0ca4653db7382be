//! callwatch daemon - PBX link, call state engine and broadcast server
//!
//! This crate provides the runtime pieces of the daemon:
//! - `config` - TOML configuration with environment overrides
//! - `engine` - Engine actor owning peers, channels and the call history
//! - `ami` - PBX management connection (login, heartbeat, polling, reconnect)
//! - `cdr` - CDR table ingestion
//! - `leads` - Lead lookup with a coalescing TTL cache
//! - `directory` - Agent directory refresh
//! - `server` - Unix socket server for local subscribers
//! - `client` - Request client used by the CLI
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        callwatchd                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────────┐  EngineCommand  ┌──────────────────┐   │
//! │  │ConnectionManager │────────────────▶│   EngineActor    │   │
//! │  │ (PBX TCP link)   │                 │ peers / channels │   │
//! │  └──────────────────┘        ┌───────▶│  call history    │   │
//! │  ┌──────────────────┐        │        └────────┬─────────┘   │
//! │  │ CDR / directory  │────────┘                 │ EngineEvent │
//! │  │   refresh tasks  │                          ▼             │
//! │  └──────────────────┘                 ┌──────────────────┐   │
//! │                                       │  DaemonServer    │   │
//! │                                       │  (Unix socket)   │   │
//! │                                       └──────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! Production code in this crate never calls `.unwrap()`, `.expect()` or
//! `panic!()`. Channel operations handle closure gracefully.

pub mod ami;
pub mod cdr;
pub mod client;
pub mod config;
pub mod db;
pub mod directory;
pub mod engine;
pub mod leads;
pub mod server;
