//! The queue directory: a dynamic directory over the current intercept
//! queue, with entries named by dense decimal index.

use crate::{
    error::{FsError, FsResult},
    fs::{MessageDir, Node, NodeKind},
    proxy::{QueueMessage, SharedQueue},
};

/// Directory whose children are the queued messages of one direction.
///
/// Index names are valid only for the duration of one listing; when the
/// queue mutates, a stale index resolves to a different entry or to
/// nothing at all.
#[derive(Debug, Clone)]
pub struct QueueDir {
    queue: SharedQueue,
}

impl QueueDir {
    pub fn new(queue: SharedQueue) -> Self {
        Self { queue }
    }

    pub(crate) fn lookup(&self, name: &str) -> FsResult<Node> {
        let index: usize = name.parse().map_err(|_| FsError::NotFound)?;
        let queue = self.queue.read().expect("queue lock poisoned");
        let entry = queue.get(index).ok_or(FsError::NotFound)?;
        let dir = match &entry.message {
            QueueMessage::Request(request) => {
                MessageDir::request(request.clone(), Some(entry.forward.clone()))
            }
            QueueMessage::Response(response) => {
                MessageDir::response(response.clone(), Some(entry.forward.clone()))
            }
        };
        Ok(Node::Message(dir))
    }

    pub(crate) fn entries(&self) -> Vec<(String, NodeKind)> {
        let len = self.queue.read().expect("queue lock poisoned").len();
        (0..len).map(|i| (i.to_string(), NodeKind::Dir)).collect()
    }

    /// Fires the indexed entry's drop signal.
    ///
    /// Returns before the engine actually releases the message; stale or
    /// unparseable indices yield not-found.
    pub(crate) fn remove(&self, name: &str) -> FsResult<()> {
        let index: usize = name.parse().map_err(|_| FsError::NotFound)?;
        let queue = self.queue.read().expect("queue lock poisoned");
        let entry = queue.get(index).ok_or(FsError::NotFound)?;
        let _ = entry.drop.try_send(());
        Ok(())
    }
}
