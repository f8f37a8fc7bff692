//! GPT-Load - a multi-tenant reverse proxy for generative-AI HTTP APIs
//!
//! Clients address a *group*; the proxy selects one of the credentials
//! registered under it, rewrites the request for the upstream vendor,
//! forwards it (streaming or buffered), records the outcome, and rotates
//! failing credentials away. A periodic recuperator probes cooled-down
//! credentials back to life.

pub mod admin;
pub mod application;
pub mod channels;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod keypool;
pub mod proxy;
pub mod store;

pub use application::Application;
pub use error::{Error, Result};
