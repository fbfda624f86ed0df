//! Local buffering
//!
//! Records are appended to one open file per partition key. The repository
//! hands out per-key access, the factory swaps files on rotation, and a closed
//! file becomes a [`ClosedFile`] owned by the upload side.

pub mod factory;
pub mod file;
pub mod repository;

pub use factory::TemporaryFileFactory;
pub use file::{BufferFile, BufferSink, ClosedFile, GzipSink, PlainSink};
pub use repository::FileRepository;
