//! citeproxy: CORS bridge between an office add-in and the local Zotero connector server.
//!
//! - `config`: ports and timeouts from file and environment
//! - `logging`: file logging with size-based cleanup
//! - `server`: the single-task serving loop

pub mod config;
pub mod logging;
pub mod server;

pub use server::{ProxyConfig, ProxyServer, ProxyStats};
