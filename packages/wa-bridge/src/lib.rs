//! Matrix ↔ WhatsApp puppeting bridge core.
//!
//! This crate holds the parts of the bridge that do not depend on the
//! WhatsApp wire protocol:
//!
//! 1. **Entity registry**: users, portals and puppets, each reachable by
//!    two keys, plus the management-room bindings of users.
//!
//! 2. **Lifecycle supervisor**: loads persisted state, starts the
//!    application service and background tasks, and shuts everything down in
//!    a fixed, best-effort order.
//!
//! 3. **Autosave**: a periodic task that persists whatever changed.
//!
//! The remote network is reached through [`session::SessionConnector`] and
//! the homeserver through [`matrix::MatrixClient`]; both are traits so the
//! supervisor can be driven in tests without either.

pub mod appservice;
pub mod autosave;
pub mod bot_profile;
pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod event_processor;
pub mod formatter;
pub mod handler;
pub mod logging;
pub mod matrix;
pub mod registration;
pub mod registry;
pub mod session;
pub mod signals;
pub mod state_store;
pub mod supervisor;
pub mod types;
