pub mod batch;
pub mod cleanup;
pub mod client;
pub mod config;
pub mod db;
pub mod dedup;
mod error;
pub mod link;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod session_pool;
mod status;
pub mod tasks;
pub mod workq;

pub const APP_NAME: &str = "Savegram";

pub use error::{Error, Result};
