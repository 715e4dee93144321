//! Directory nodes: header maps, message schemas, and the root.

use std::sync::Arc;

use http::{HeaderMap, HeaderName};
use tokio::sync::mpsc;

use crate::{
    error::{FsError, FsResult},
    fs::{
        BodyFile, BoolFile, ChannelFile, HeaderFile, Int64File, IntFile, Node, NodeKind,
        RawRequestFile, RawResponseFile, StrFile, UriFile,
    },
    message::{Cell, Request, Response},
};

/// Dynamic directory over a message's header map.
///
/// One child per header name present at the moment of listing; each child
/// is a string file over the first value of that header.
#[derive(Debug, Clone)]
pub struct HeaderDir {
    headers: Cell<HeaderMap>,
}

impl HeaderDir {
    pub fn new(headers: Cell<HeaderMap>) -> Self {
        Self { headers }
    }

    pub(crate) fn lookup(&self, name: &str) -> FsResult<Node> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| FsError::NotFound)?;
        if !self.headers.read().contains_key(&name) {
            return Err(FsError::NotFound);
        }
        Ok(Node::Header(HeaderFile::new(self.headers.clone(), name)))
    }

    pub(crate) fn entries(&self) -> Vec<(String, NodeKind)> {
        self.headers
            .read()
            .keys()
            .map(|name| (name.as_str().to_owned(), NodeKind::File))
            .collect()
    }

    /// Removing a header child succeeds without effect, so removals of
    /// no-longer-present names stay idempotent for scripts.
    pub(crate) fn remove(&self, _name: &str) -> FsResult<()> {
        Ok(())
    }
}

const REQUEST_FILES: &[&str] = &[
    "method",
    "url",
    "requrl",
    "proto",
    "close",
    "host",
    "raw",
    "contentlength",
    "body",
];

const RESPONSE_FILES: &[&str] = &[
    "status",
    "statuscode",
    "proto",
    "close",
    "raw",
    "contentlength",
    "body",
];

/// Fixed-schema directory over one message.
///
/// Children are constructed fresh on every lookup; they are views into the
/// message's cells, never copies.
#[derive(Debug, Clone)]
pub struct MessageDir {
    kind: MessageKind,
}

#[derive(Debug, Clone)]
enum MessageKind {
    Request {
        request: Request,
        forward: Option<mpsc::Sender<()>>,
    },
    Response {
        response: Response,
        forward: Option<mpsc::Sender<()>>,
    },
}

impl MessageDir {
    /// A directory over a request. `forward` is present only for
    /// queue-attached messages.
    pub fn request(request: Request, forward: Option<mpsc::Sender<()>>) -> Self {
        Self {
            kind: MessageKind::Request { request, forward },
        }
    }

    /// A directory over a response. `forward` is present only for
    /// queue-attached messages.
    pub fn response(response: Response, forward: Option<mpsc::Sender<()>>) -> Self {
        Self {
            kind: MessageKind::Response { response, forward },
        }
    }

    pub(crate) fn lookup(&self, name: &str) -> FsResult<Node> {
        match &self.kind {
            MessageKind::Request { request, forward } => {
                Self::lookup_request(request, forward, name)
            }
            MessageKind::Response { response, forward } => {
                Self::lookup_response(response, forward, name)
            }
        }
    }

    fn lookup_request(
        request: &Request,
        forward: &Option<mpsc::Sender<()>>,
        name: &str,
    ) -> FsResult<Node> {
        let node = match name {
            "method" => Node::Str(StrFile::new(request.method.clone())),
            "url" => Node::Uri(UriFile::new(request.url.clone())),
            "requrl" => Node::Str(StrFile::new(request.request_uri.clone())),
            "proto" => Node::Str(StrFile::new(request.proto.clone())),
            "close" => Node::Bool(BoolFile::new(request.close.clone())),
            "host" => Node::Str(StrFile::new(request.host.clone())),
            "headers" => Node::Headers(HeaderDir::new(request.headers.clone())),
            "raw" => Node::RawRequest(RawRequestFile::new(request.clone())),
            "contentlength" => Node::Int64(Int64File::new(request.content_length.clone())),
            "body" => Node::Body(BodyFile::new(
                request.body.clone(),
                request.content_length.clone(),
            )),
            "forward" => match forward {
                Some(signal) => Node::Channel(ChannelFile::new(signal.clone())),
                None => return Err(FsError::NotFound),
            },
            _ => return Err(FsError::NotFound),
        };
        Ok(node)
    }

    fn lookup_response(
        response: &Response,
        forward: &Option<mpsc::Sender<()>>,
        name: &str,
    ) -> FsResult<Node> {
        let node = match name {
            "status" => Node::Str(StrFile::new(response.status.clone())),
            "statuscode" => Node::Int(IntFile::new(response.status_code.clone())),
            "proto" => Node::Str(StrFile::new(response.proto.clone())),
            "close" => Node::Bool(BoolFile::new(response.close.clone())),
            "headers" => Node::Headers(HeaderDir::new(response.headers.clone())),
            // Non-owning view of the owning request, built per lookup.
            "req" => Node::Message(MessageDir::request(response.request.clone(), None)),
            "raw" => Node::RawResponse(RawResponseFile::new(response.clone())),
            "contentlength" => Node::Int64(Int64File::new(response.content_length.clone())),
            "body" => Node::Body(BodyFile::new(
                response.body.clone(),
                response.content_length.clone(),
            )),
            "forward" => match forward {
                Some(signal) => Node::Channel(ChannelFile::new(signal.clone())),
                None => return Err(FsError::NotFound),
            },
            _ => return Err(FsError::NotFound),
        };
        Ok(node)
    }

    pub(crate) fn entries(&self) -> Vec<(String, NodeKind)> {
        let (files, dirs, forward): (&[&str], &[&str], bool) = match &self.kind {
            MessageKind::Request { forward, .. } => (REQUEST_FILES, &["headers"], forward.is_some()),
            MessageKind::Response { forward, .. } => {
                (RESPONSE_FILES, &["headers", "req"], forward.is_some())
            }
        };
        let mut entries: Vec<(String, NodeKind)> = files
            .iter()
            .map(|name| ((*name).to_owned(), NodeKind::File))
            .collect();
        if forward {
            entries.push(("forward".to_owned(), NodeKind::File));
        }
        entries.extend(dirs.iter().map(|name| ((*name).to_owned(), NodeKind::Dir)));
        entries
    }

    /// Children of the fixed schema cannot be removed; succeeding without
    /// effect lets `rm -r` walk a queue entry before removing it.
    pub(crate) fn remove(&self, _name: &str) -> FsResult<()> {
        Ok(())
    }
}

/// The root of the control filesystem.
#[derive(Debug, Clone)]
pub struct RootDir(Arc<RootNodes>);

#[derive(Debug)]
struct RootNodes {
    scope: Node,
    intreq: Node,
    intresp: Node,
    req: Node,
    resp: Node,
}

impl RootDir {
    pub fn new(scope: Node, intreq: Node, intresp: Node, req: Node, resp: Node) -> Self {
        Self(Arc::new(RootNodes {
            scope,
            intreq,
            intresp,
            req,
            resp,
        }))
    }

    pub(crate) fn lookup(&self, name: &str) -> FsResult<Node> {
        let node = match name {
            "scope" => self.0.scope.clone(),
            "intreq" => self.0.intreq.clone(),
            "intresp" => self.0.intresp.clone(),
            "req" => self.0.req.clone(),
            "resp" => self.0.resp.clone(),
            _ => return Err(FsError::NotFound),
        };
        Ok(node)
    }

    pub(crate) fn entries(&self) -> Vec<(String, NodeKind)> {
        vec![
            ("scope".to_owned(), NodeKind::File),
            ("intreq".to_owned(), NodeKind::File),
            ("intresp".to_owned(), NodeKind::File),
            ("req".to_owned(), NodeKind::Dir),
            ("resp".to_owned(), NodeKind::Dir),
        ]
    }
}
