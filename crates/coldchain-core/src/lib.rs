pub mod collectors;
pub mod config;
pub mod db;
pub mod error;
pub mod identifiers;
pub mod job;
pub mod logging;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod resilience;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod types;
pub mod writer;

pub use config::Config;
pub use error::{IngestError, Result};
