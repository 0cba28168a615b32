//! dna_engine — the DNA Messenger core engine.
//!
//! One long-lived [`Engine`] per process owns the DHT handle, the
//! local database, the identity session, and a small worker pool. The
//! public surface is the async request methods plus a broadcast event
//! stream; everything else (envelope crypto, Spillway transport, GEK
//! lifecycle) is internal plumbing over the sibling crates.
//!
//! # Modules
//! - `engine`    — construction, identity lifecycle, shutdown
//! - `messaging` — direct send/receive, ACKs, retry sweep
//! - `groups`    — GEK rotation, IKP publication, group traffic
//! - `keyserver` — profile resolution and name registration
//! - `identity`  — sessions, wrapped key files, the process lock
//! - `events`    — the event stream and diagnostic ring
//! - `workers`   — the task queue
//! - `config`, `error`

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod groups;
pub mod identity;
pub mod keyserver;
pub mod messaging;
pub mod workers;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use events::{Event, MessageView};
pub use identity::IdentitySeeds;
