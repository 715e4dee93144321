//! An intercepting HTTP proxy whose control surface is a filesystem.
//!
//! Every in-flight request and response, plus the proxy's own knobs,
//! appears as files and directories under a FUSE mount point: read a body
//! with `cat`, edit a header with `sed`, release a held request by writing
//! to its `forward` file, drop one with `rm -r`.

mod engine;
mod error;
/// Filesystem nodes backing the control tree.
pub mod fs;
mod fuse;
/// The shared-cell message model and wire codec.
pub mod message;
/// Intercept queues, hooks, and the mode dispatcher.
pub mod proxy;
mod util;

pub use error::{FsError, FsResult};
pub use fuse::{ProxyFs, mount};
pub use message::{Body, Cell, Request, Response};
pub use proxy::{DROPPED_BODY, Proxy, QueueEntry, QueueMessage, SharedQueue};

/// How much data to read for a message head before it's considered invalid.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;

#[cfg(test)]
mod tests;
