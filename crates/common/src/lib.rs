//! Common utilities and shared types for faultline.
//!
//! This crate provides foundational components used across all faultline crates:
//!
//! - **Configuration**: Worker, lock, and backend settings via [`Config`]
//! - **Error handling**: The work-item error taxonomy via [`AppError`] and [`AppResult`]
//! - **ID Generation**: ULID-based identifiers and lock tokens via [`IdGenerator`]
//! - **Metrics**: Work-item and lock counters via [`Metrics`]
//!
//! # Example
//!
//! ```no_run
//! use faultline_common::{Config, IdGenerator, AppResult};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let id_gen = IdGenerator::new();
//!     let token = id_gen.generate();
//!     println!("{} -> {}", config.redis.prefix, token);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod metrics;

pub use config::{
    BulkSettings, Config, LockSettings, LoggingConfig, MailConfig, RedisConfig,
    ThrottlingSettings, WorkerConfig,
};
pub use error::{AppError, AppResult};
pub use id::IdGenerator;
pub use metrics::{Metrics, MetricsSnapshot, get_metrics};
