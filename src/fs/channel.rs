//! The channel file: a write-triggered one-shot signal.

use tokio::sync::mpsc;

use crate::{
    error::FsResult,
    fs::value::{MODE_RW, check_readable, check_writable},
};

/// Fires a one-shot signal when written to.
///
/// Any byte content is accepted and consumed. The send is lossy: with no
/// receiver waiting and the slot already occupied, the write is absorbed
/// without error and does not pre-arm a future release.
#[derive(Debug, Clone)]
pub struct ChannelFile {
    signal: mpsc::Sender<()>,
    mode: u32,
}

impl ChannelFile {
    pub fn new(signal: mpsc::Sender<()>) -> Self {
        Self {
            signal,
            mode: MODE_RW,
        }
    }

    pub(crate) fn read(&self) -> FsResult<Vec<u8>> {
        check_readable(self.mode)?;
        Ok(Vec::new())
    }

    pub(crate) fn write(&self, data: &[u8]) -> FsResult<usize> {
        check_writable(self.mode)?;
        let _ = self.signal.try_send(());
        Ok(data.len())
    }

    pub(crate) fn size(&self) -> u64 {
        0
    }

    pub(crate) fn mode(&self) -> u32 {
        self.mode
    }
}
