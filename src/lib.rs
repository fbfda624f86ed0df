//! Mizuchi Spool Library
//!
//! Buffers a stream of records into local files partitioned by key, rotates
//! them by size and age, and uploads the rotated files to S3.
//!
//! # Features
//!
//! - **Per-key buffering**: one open file per partition, writers to other
//!   partitions never wait on each other
//! - **Backpressure**: a bounded upload pool that runs work on the caller
//!   when it is saturated
//! - **Multipart**: large files go up in parts and interrupted uploads can
//!   be resumed
//! - **Crash recovery**: files left behind by an earlier run are uploaded at
//!   startup
//!
//! # Example
//!
//! ```no_run
//! use mizuchi_spool::{config::Config, spool::Spooler, store::S3Store};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let store = Arc::new(S3Store::connect(&config.s3).await);
//!     let spooler = Spooler::start(&config, store).await?;
//!     spooler.write_batch([("app/web", b"hello\n")]).await?;
//!     spooler.close().await?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod metrics;
pub mod recovery;
pub mod rotation;
pub mod spool;
pub mod store;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use spool::{SpoolError, Spooler};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
