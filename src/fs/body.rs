//! The body file: a destructive-read-safe view over a message body.

use crate::{
    error::{FsError, FsResult},
    fs::value::{MODE_RW, check_readable, check_writable},
    message::{Body, Cell},
};

/// Exposes a message body for reading and replacement.
///
/// Reads drain the stream and re-arm it, so the engine still sees the full
/// body when it forwards the message. Writes replace the stream and update
/// the linked content-length cell under the body lock.
#[derive(Debug, Clone)]
pub struct BodyFile {
    body: Cell<Body>,
    content_length: Cell<i64>,
    mode: u32,
}

impl BodyFile {
    pub fn new(body: Cell<Body>, content_length: Cell<i64>) -> Self {
        Self {
            body,
            content_length,
            mode: MODE_RW,
        }
    }

    pub(crate) fn read(&self) -> FsResult<Vec<u8>> {
        check_readable(self.mode)?;
        self.body.write().drain().map_err(|_| FsError::NoData)
    }

    pub(crate) fn write(&self, data: &[u8]) -> FsResult<usize> {
        check_writable(self.mode)?;
        let trimmed = data.trim_ascii();
        let mut body = self.body.write();
        body.replace(trimmed.to_vec());
        self.content_length.set(trimmed.len() as i64);
        Ok(data.len())
    }

    pub(crate) fn size(&self) -> FsResult<u64> {
        let len = self.body.write().len().map_err(|_| FsError::NoData)?;
        Ok(len as u64)
    }

    pub(crate) fn mode(&self) -> u32 {
        self.mode
    }
}
