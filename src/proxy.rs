//! The proxy core: intercept queues, per-message rendezvous, and the
//! intercept-mode dispatcher.

use std::{
    io,
    path::Path,
    sync::{Arc, RwLock},
};

use http::{HeaderMap, Uri};
use n0_error::{Result, StdResultExt};
use regex::Regex;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use crate::{
    fs::{BoolFile, Node, QueueDir, RegexFile, RootDir},
    message::{Body, Cell, Request, Response},
};

/// Body of the synthetic response for dropped messages.
pub const DROPPED_BODY: &str = "Dropped by proxyfs";

/// A message resident in an intercept queue, with its release signals.
///
/// Entries are created by the intercept hook on arrival and removed by the
/// same hook after either signal fires (or immediately when interception is
/// off for the direction). The signals are capacity-1 channels created
/// fresh per entry; the hook holds the receivers.
#[derive(Debug)]
pub struct QueueEntry {
    /// Unique within the process lifetime.
    pub id: Uuid,
    /// The intercepted message.
    pub message: QueueMessage,
    /// Fires to release the message for onward delivery.
    pub forward: mpsc::Sender<()>,
    /// Fires to replace the message with the synthetic 500.
    pub drop: mpsc::Sender<()>,
}

/// An intercepted message of either direction.
#[derive(Debug, Clone)]
pub enum QueueMessage {
    Request(Request),
    Response(Response),
}

/// An intercept queue shared between the proxy and the filesystem.
pub type SharedQueue = Arc<RwLock<Vec<QueueEntry>>>;

/// The intercepting proxy and the state behind its control filesystem.
#[derive(Debug)]
pub struct Proxy {
    scope: Cell<Regex>,
    intercept_requests: Cell<bool>,
    intercept_responses: Cell<bool>,
    requests: SharedQueue,
    responses: SharedQueue,
    intreq_changed: watch::Sender<bool>,
    intresp_changed: watch::Sender<bool>,
    pub(crate) upstream: Option<Uri>,
}

impl Proxy {
    /// Creates a proxy, compiling `scope` to the interception regex.
    pub fn new(scope: &str) -> Result<Self> {
        let scope = Regex::new(scope).std_context("invalid scope pattern")?;
        let (intreq_changed, _) = watch::channel(false);
        let (intresp_changed, _) = watch::channel(false);
        Ok(Self {
            scope: Cell::new(scope),
            intercept_requests: Cell::new(false),
            intercept_responses: Cell::new(false),
            requests: Arc::new(RwLock::new(Vec::new())),
            responses: Arc::new(RwLock::new(Vec::new())),
            intreq_changed,
            intresp_changed,
            upstream: None,
        })
    }

    /// Routes all forwarded traffic through the given upstream proxy.
    pub fn with_upstream(mut self, upstream: Uri) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Builds the root of the control filesystem tree.
    pub fn root(&self) -> Node {
        Node::Root(RootDir::new(
            Node::Regex(RegexFile::new(self.scope.clone())),
            Node::Bool(BoolFile::with_change(
                self.intercept_requests.clone(),
                self.intreq_changed.clone(),
            )),
            Node::Bool(BoolFile::with_change(
                self.intercept_responses.clone(),
                self.intresp_changed.clone(),
            )),
            Node::Queue(QueueDir::new(self.requests.clone())),
            Node::Queue(QueueDir::new(self.responses.clone())),
        ))
    }

    /// Mounts the control filesystem at `mountpoint`, serving until the
    /// filesystem is unmounted externally.
    pub fn mount(&self, mountpoint: &Path) -> io::Result<()> {
        crate::fuse::mount(self.root(), mountpoint)
    }

    /// Whether `url` falls inside the interception scope.
    pub fn in_scope(&self, url: &str) -> bool {
        self.scope.read().is_match(url)
    }

    /// The request intercept queue.
    pub fn requests(&self) -> &SharedQueue {
        &self.requests
    }

    /// The response intercept queue.
    pub fn responses(&self) -> &SharedQueue {
        &self.responses
    }

    /// Request-side intercept hook.
    ///
    /// Queues the request and, when request interception is on, suspends
    /// until its forward or drop signal fires. Returns `None` to forward
    /// the (possibly mutated) request, or the synthetic dropped response to
    /// short-circuit forwarding entirely.
    pub async fn intercept_request(&self, request: Request) -> Option<Response> {
        let id = Uuid::now_v7();
        let (forward_tx, mut forward_rx) = mpsc::channel(1);
        let (drop_tx, mut drop_rx) = mpsc::channel(1);
        self.requests
            .write()
            .expect("request queue lock poisoned")
            .push(QueueEntry {
                id,
                message: QueueMessage::Request(request.clone()),
                forward: forward_tx,
                drop: drop_tx,
            });

        let mut dropped = None;
        if self.intercept_requests.get() {
            debug!(%id, "holding request");
            tokio::select! {
                _ = forward_rx.recv() => debug!(%id, "request released"),
                _ = drop_rx.recv() => {
                    debug!(%id, "request dropped");
                    dropped = Some(Self::dropped_response(&request));
                }
            }
        }

        remove_entry(&self.requests, id);
        dropped
    }

    /// Response-side intercept hook.
    ///
    /// Queues the response and, when response interception is on, suspends
    /// until its forward or drop signal fires. Returns the message to send
    /// downstream: the (possibly mutated) response, or the synthetic 500.
    pub async fn intercept_response(&self, response: Response) -> Response {
        let id = Uuid::now_v7();
        let (forward_tx, mut forward_rx) = mpsc::channel(1);
        let (drop_tx, mut drop_rx) = mpsc::channel(1);
        self.responses
            .write()
            .expect("response queue lock poisoned")
            .push(QueueEntry {
                id,
                message: QueueMessage::Response(response.clone()),
                forward: forward_tx,
                drop: drop_tx,
            });

        let mut dropped = None;
        if self.intercept_responses.get() {
            debug!(%id, "holding response");
            tokio::select! {
                _ = forward_rx.recv() => debug!(%id, "response released"),
                _ = drop_rx.recv() => {
                    debug!(%id, "response dropped");
                    dropped = Some(Self::dropped_response(&response.request));
                }
            }
        }

        remove_entry(&self.responses, id);
        dropped.unwrap_or(response)
    }

    /// The synthetic response returned for a dropped message.
    pub fn dropped_response(request: &Request) -> Response {
        Response {
            status: Cell::new("500 Internal Server Error".to_owned()),
            status_code: Cell::new(500),
            proto: Cell::new("HTTP/1.1".to_owned()),
            close: Cell::new(true),
            headers: Cell::new(HeaderMap::new()),
            content_length: Cell::new(DROPPED_BODY.len() as i64),
            body: Cell::new(Body::from_bytes(DROPPED_BODY)),
            request: request.clone(),
        }
    }

    /// The intercept-mode dispatcher.
    ///
    /// Observes the intercept flags; when a direction transitions to off,
    /// fires the forward signal on every entry queued in that direction.
    /// Transitions to on have no effect on already-queued entries.
    pub(crate) fn dispatch_intercepts(&self) -> impl Future<Output = ()> + Send + 'static {
        let requests = self.requests.clone();
        let responses = self.responses.clone();
        let mut req_rx = self.intreq_changed.subscribe();
        let mut resp_rx = self.intresp_changed.subscribe();
        async move {
            loop {
                tokio::select! {
                    res = req_rx.changed() => {
                        if res.is_err() {
                            break;
                        }
                        if !*req_rx.borrow_and_update() {
                            debug!("request interception off, releasing queue");
                            release_all(&requests);
                        }
                    }
                    res = resp_rx.changed() => {
                        if res.is_err() {
                            break;
                        }
                        if !*resp_rx.borrow_and_update() {
                            debug!("response interception off, releasing queue");
                            release_all(&responses);
                        }
                    }
                }
            }
        }
    }
}

/// Removes the entry with the given id; stops at the first match.
fn remove_entry(queue: &SharedQueue, id: Uuid) {
    let mut queue = queue.write().expect("queue lock poisoned");
    if let Some(pos) = queue.iter().position(|entry| entry.id == id) {
        queue.remove(pos);
    }
}

fn release_all(queue: &SharedQueue) {
    let queue = queue.read().expect("queue lock poisoned");
    for entry in queue.iter() {
        let _ = entry.forward.try_send(());
    }
}
