//! Shuffle server for Eddy.
//!
//! A [`ShuffleServer`] accepts pushed blocks into bounded reception buffers
//! ([`ServerBlockStore`]). When buffered bytes cross the high watermark the
//! least recently flushed buffers are snapshotted and written to the first
//! storage tier that takes them ([`FlushManager`]). A finish call drains
//! every buffer of a shuffle so readers can find all of its data.
//!
//! [`LocalShuffleClient`] serves the client transport trait in process.

mod buffer;
mod config;
mod error;
mod flush;
mod local;
mod result;
mod server;

pub use buffer::{FlushHandle, ServerBlockStore};
pub use config::ServerConfig;
pub use error::ServerError;
pub use flush::FlushManager;
pub use local::LocalShuffleClient;
pub use result::ShuffleResultRegistry;
pub use server::{ShuffleServer, status_of};
