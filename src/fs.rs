//! The virtual filesystem node layer.
//!
//! Every node kind is a variant of [`Node`]; the filesystem server
//! dispatches kernel operations through it. File nodes are thin adaptors
//! over shared cells of the message model; directory nodes enumerate their
//! children at the instant of the call, so listings always reflect the
//! live proxy state.

mod body;
mod channel;
mod dir;
mod queue;
mod raw;
mod value;

pub use body::BodyFile;
pub use channel::ChannelFile;
pub use dir::{HeaderDir, MessageDir, RootDir};
pub use queue::QueueDir;
pub use raw::{RawRequestFile, RawResponseFile};
pub use value::{BoolFile, HeaderFile, Int64File, IntFile, RegexFile, StrFile, UriFile};

use crate::error::{FsError, FsResult};

/// Whether a node is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

/// Attributes reported to the kernel for a node.
#[derive(Debug, Clone, Copy)]
pub struct NodeAttr {
    pub kind: NodeKind,
    pub mode: u32,
    pub size: u64,
}

/// Directory mode for every directory node.
const DIR_MODE: u32 = 0o755;

/// A node in the control filesystem, one variant per node kind.
///
/// Cloning a node clones the underlying cell handles; a clone is another
/// live view of the same state.
#[derive(Debug, Clone)]
pub enum Node {
    Str(StrFile),
    Int(IntFile),
    Int64(Int64File),
    Bool(BoolFile),
    Regex(RegexFile),
    Uri(UriFile),
    Header(HeaderFile),
    Body(BodyFile),
    RawRequest(RawRequestFile),
    RawResponse(RawResponseFile),
    Channel(ChannelFile),
    Headers(HeaderDir),
    Message(MessageDir),
    Queue(QueueDir),
    Root(RootDir),
}

impl Node {
    /// Whether this node is a file or a directory.
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Headers(_) | Node::Message(_) | Node::Queue(_) | Node::Root(_) => NodeKind::Dir,
            _ => NodeKind::File,
        }
    }

    /// Attributes for a kernel attribute query.
    ///
    /// File sizes are the exact byte length of the current rendering, so a
    /// size query may drain (and re-arm) a body stream.
    pub fn attr(&self) -> FsResult<NodeAttr> {
        match self.kind() {
            NodeKind::Dir => Ok(NodeAttr {
                kind: NodeKind::Dir,
                mode: DIR_MODE,
                size: 0,
            }),
            NodeKind::File => Ok(NodeAttr {
                kind: NodeKind::File,
                mode: self.mode(),
                size: self.size()?,
            }),
        }
    }

    fn mode(&self) -> u32 {
        match self {
            Node::Str(f) => f.mode(),
            Node::Int(f) => f.mode(),
            Node::Int64(f) => f.mode(),
            Node::Bool(f) => f.mode(),
            Node::Regex(f) => f.mode(),
            Node::Uri(f) => f.mode(),
            Node::Header(f) => f.mode(),
            Node::Body(f) => f.mode(),
            Node::RawRequest(f) => f.mode(),
            Node::RawResponse(f) => f.mode(),
            Node::Channel(f) => f.mode(),
            _ => DIR_MODE,
        }
    }

    /// Exact byte length of the current rendering.
    pub fn size(&self) -> FsResult<u64> {
        match self {
            Node::Str(f) => Ok(f.size()),
            Node::Int(f) => Ok(f.size()),
            Node::Int64(f) => Ok(f.size()),
            Node::Bool(f) => Ok(f.size()),
            Node::Regex(f) => Ok(f.size()),
            Node::Uri(f) => Ok(f.size()),
            Node::Header(f) => f.size(),
            Node::Body(f) => f.size(),
            Node::RawRequest(f) => f.size(),
            Node::RawResponse(f) => f.size(),
            Node::Channel(f) => Ok(f.size()),
            _ => Ok(0),
        }
    }

    /// Reads the full rendering of a file node.
    pub fn read_all(&self) -> FsResult<Vec<u8>> {
        match self {
            Node::Str(f) => f.read(),
            Node::Int(f) => f.read(),
            Node::Int64(f) => f.read(),
            Node::Bool(f) => f.read(),
            Node::Regex(f) => f.read(),
            Node::Uri(f) => f.read(),
            Node::Header(f) => f.read(),
            Node::Body(f) => f.read(),
            Node::RawRequest(f) => f.read(),
            Node::RawResponse(f) => f.read(),
            Node::Channel(f) => f.read(),
            _ => Err(FsError::PermissionDenied),
        }
    }

    /// Writes the full input through a file node, returning the number of
    /// input bytes consumed.
    pub fn write_all(&self, data: &[u8]) -> FsResult<usize> {
        match self {
            Node::Str(f) => f.write(data),
            Node::Int(f) => f.write(data),
            Node::Int64(f) => f.write(data),
            Node::Bool(f) => f.write(data),
            Node::Regex(f) => f.write(data),
            Node::Uri(f) => f.write(data),
            Node::Header(f) => f.write(data),
            Node::Body(f) => f.write(data),
            Node::RawRequest(f) => f.write(data),
            Node::RawResponse(f) => f.write(data),
            Node::Channel(f) => f.write(data),
            _ => Err(FsError::PermissionDenied),
        }
    }

    /// Resolves a child of a directory node.
    pub fn lookup(&self, name: &str) -> FsResult<Node> {
        match self {
            Node::Headers(d) => d.lookup(name),
            Node::Message(d) => d.lookup(name),
            Node::Queue(d) => d.lookup(name),
            Node::Root(d) => d.lookup(name),
            _ => Err(FsError::NotFound),
        }
    }

    /// Lists the children of a directory node at this instant.
    pub fn entries(&self) -> FsResult<Vec<(String, NodeKind)>> {
        match self {
            Node::Headers(d) => Ok(d.entries()),
            Node::Message(d) => Ok(d.entries()),
            Node::Queue(d) => Ok(d.entries()),
            Node::Root(d) => Ok(d.entries()),
            _ => Err(FsError::NotFound),
        }
    }

    /// Removes a child of a directory node.
    ///
    /// Queue directories fire the entry's drop signal; header and message
    /// directories succeed without effect so `rm -r` can walk them.
    pub fn remove(&self, name: &str) -> FsResult<()> {
        match self {
            Node::Headers(d) => d.remove(name),
            Node::Message(d) => d.remove(name),
            Node::Queue(d) => d.remove(name),
            Node::Root(_) => Err(FsError::PermissionDenied),
            _ => Err(FsError::NotFound),
        }
    }

    /// Creating children is forbidden everywhere in the tree.
    pub fn add(&self, _name: &str) -> FsResult<()> {
        Err(FsError::PermissionDenied)
    }

    /// Whether the kernel should open this node in direct-I/O mode.
    ///
    /// Set on nodes whose rendered size can change between open and read.
    pub fn direct_io(&self) -> bool {
        matches!(
            self,
            Node::Header(_) | Node::Headers(_) | Node::RawRequest(_) | Node::RawResponse(_)
        )
    }
}
