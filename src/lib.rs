//! kly - run untrusted third-party scripts inside an OS sandbox
//!
//! This crate provides:
//! - Permission broker with a persistent trust store and decision audit log
//! - Sandbox policy builder and platform isolation engines (Landlock/seccomp, Seatbelt)
//! - Host launcher and guest executor talking over an inherited socket
//! - Host-side resource provider for credentials, logging, and prompts

pub mod app_id;
pub mod cli;
pub mod config;
pub mod context;
pub mod ipc;
pub mod paths;
pub mod permissions;
pub mod provider;
pub mod sandbox;

pub use config::Config;
pub use context::ExecutionContext;
