//! The filesystem server: routes kernel operations to node handlers.
//!
//! Inodes map to paths, and paths are resolved against the live node tree
//! on every operation, so names stay valid exactly as long as the tree
//! state they were listed under. Open file handles keep a resolved node
//! clone, so reads and writes through a held handle keep working even
//! after the entry has left its queue.

use std::{
    collections::HashMap,
    ffi::OsStr,
    io,
    path::Path,
    time::{Duration, SystemTime},
};

use fuser::{FileType, MountOption, TimeOrNow};
use tracing::{debug, trace};

use crate::{
    error::{FsError, FsResult},
    fs::{Node, NodeAttr, NodeKind},
};

const ROOT_INODE: u64 = 1;

/// Attribute TTL; zero keeps every kernel query live.
const TTL: Duration = Duration::ZERO;

/// Mounts the tree rooted at `root` and serves until unmounted externally.
pub fn mount(root: Node, mountpoint: &Path) -> io::Result<()> {
    debug!(?mountpoint, "mounting control filesystem");
    fuser::mount2(
        ProxyFs::new(root),
        mountpoint,
        &[
            MountOption::FSName("proxyfs".to_owned()),
            MountOption::AutoUnmount,
        ],
    )
}

/// `fuser::Filesystem` adaptor over the node tree.
pub struct ProxyFs {
    root: Node,
    inodes: InodeTable,
    handles: HashMap<u64, Node>,
    next_handle: u64,
}

impl ProxyFs {
    pub fn new(root: Node) -> Self {
        Self {
            root,
            inodes: InodeTable::new(),
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Resolves an inode against the live tree.
    fn resolve(&self, inode: u64) -> FsResult<Node> {
        let path = self.inodes.path(inode).ok_or(FsError::NotFound)?;
        self.resolve_path(&path)
    }

    fn resolve_path(&self, path: &[String]) -> FsResult<Node> {
        let mut node = self.root.clone();
        for component in path {
            node = node.lookup(component)?;
        }
        Ok(node)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FsResult<Vec<String>> {
        let name = name.to_str().ok_or(FsError::NotFound)?;
        let mut path = self.inodes.path(parent).ok_or(FsError::NotFound)?;
        path.push(name.to_owned());
        Ok(path)
    }

    fn file_attr(&self, inode: u64, attr: NodeAttr) -> fuser::FileAttr {
        let now = SystemTime::now();
        fuser::FileAttr {
            ino: inode,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: match attr.kind {
                NodeKind::Dir => FileType::Directory,
                NodeKind::File => FileType::RegularFile,
            },
            perm: attr.mode as u16,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            flags: 0,
            blksize: 512,
        }
    }
}

/// Bidirectional inode ↔ path map.
struct InodeTable {
    paths: HashMap<u64, Vec<String>>,
    inodes: HashMap<Vec<String>, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inodes: HashMap::new(),
            next: ROOT_INODE + 1,
        };
        table.paths.insert(ROOT_INODE, Vec::new());
        table.inodes.insert(Vec::new(), ROOT_INODE);
        table
    }

    fn path(&self, inode: u64) -> Option<Vec<String>> {
        self.paths.get(&inode).cloned()
    }

    /// Returns the inode for `path`, assigning a fresh one if needed.
    fn intern(&mut self, path: Vec<String>) -> u64 {
        if let Some(inode) = self.inodes.get(&path) {
            return *inode;
        }
        let inode = self.next;
        self.next += 1;
        self.paths.insert(inode, path.clone());
        self.inodes.insert(path, inode);
        inode
    }
}

impl fuser::Filesystem for ProxyFs {
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let result = self
            .child_path(parent, name)
            .and_then(|path| Ok((self.resolve_path(&path)?.attr()?, path)));
        match result {
            Ok((attr, path)) => {
                let inode = self.inodes.intern(path);
                reply.entry(&TTL, &self.file_attr(inode, attr), 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        inode: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        match self.resolve(inode).and_then(|node| node.attr()) {
            Ok(attr) => reply.attr(&TTL, &self.file_attr(inode, attr)),
            Err(err) => reply.error(err.errno()),
        }
    }

    // Shell redirection truncates before writing; echo the current
    // attributes instead of failing, the next write replaces the value.
    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        inode: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        match self.resolve(inode).and_then(|node| node.attr()) {
            Ok(attr) => reply.attr(&TTL, &self.file_attr(inode, attr)),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, _req: &fuser::Request<'_>, inode: u64, _flags: i32, reply: fuser::ReplyOpen) {
        match self.resolve(inode) {
            Ok(node) => {
                let flags = if node.direct_io() {
                    fuser::consts::FOPEN_DIRECT_IO
                } else {
                    0
                };
                let handle = self.next_handle;
                self.next_handle += 1;
                self.handles.insert(handle, node);
                reply.opened(handle, flags);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        inode: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let node = match self.handles.get(&fh) {
            Some(node) => Ok(node.clone()),
            None => self.resolve(inode),
        };
        match node.and_then(|node| node.read_all()) {
            Ok(data) => {
                let start = (offset.max(0) as usize).min(data.len());
                let end = (start + size as usize).min(data.len());
                trace!(inode, offset, size, "read {} bytes", end - start);
                reply.data(&data[start..end]);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        inode: u64,
        fh: u64,
        _offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let node = match self.handles.get(&fh) {
            Some(node) => Ok(node.clone()),
            None => self.resolve(inode),
        };
        match node.and_then(|node| node.write_all(data)) {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        inode: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let path = match self.inodes.path(inode) {
            Some(path) => path,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let entries = match self.resolve_path(&path).and_then(|node| node.entries()) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };
        let mut listing = Vec::with_capacity(entries.len() + 2);
        listing.push((inode, FileType::Directory, ".".to_owned()));
        listing.push((ROOT_INODE, FileType::Directory, "..".to_owned()));
        for (name, kind) in entries {
            let mut child_path = path.clone();
            child_path.push(name.clone());
            let child_inode = self.inodes.intern(child_path);
            let file_type = match kind {
                NodeKind::Dir => FileType::Directory,
                NodeKind::File => FileType::RegularFile,
            };
            listing.push((child_inode, file_type, name));
        }
        let start = offset.max(0) as usize;
        for (idx, (inode, file_type, name)) in listing.into_iter().enumerate().skip(start) {
            if reply.add(inode, (idx + 1) as i64, file_type, name) {
                break;
            }
        }
        reply.ok();
    }

    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.remove_child(parent, name, reply);
    }

    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.remove_child(parent, name, reply);
    }

    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        reply.error(self.add_child(parent, name).errno());
    }

    fn mknod(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: fuser::ReplyEntry,
    ) {
        reply.error(self.add_child(parent, name).errno());
    }

    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        reply.error(self.add_child(parent, name).errno());
    }

    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _inode: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.handles.remove(&fh);
        reply.ok();
    }
}

impl ProxyFs {
    /// Creation is forbidden everywhere in the tree; this resolves the
    /// parent first so stale paths still report not-found.
    fn add_child(&self, parent: u64, name: &OsStr) -> FsError {
        let result = (|| {
            let name = name.to_str().ok_or(FsError::NotFound)?;
            let path = self.inodes.path(parent).ok_or(FsError::NotFound)?;
            self.resolve_path(&path)?.add(name)
        })();
        match result {
            Ok(()) => FsError::PermissionDenied,
            Err(err) => err,
        }
    }

    fn remove_child(&mut self, parent: u64, name: &OsStr, reply: fuser::ReplyEmpty) {
        let result = (|| {
            let name = name.to_str().ok_or(FsError::NotFound)?;
            let path = self.inodes.path(parent).ok_or(FsError::NotFound)?;
            self.resolve_path(&path)?.remove(name)
        })();
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::proxy::Proxy;

    fn server() -> ProxyFs {
        let proxy = Arc::new(Proxy::new(".").unwrap());
        ProxyFs::new(proxy.root())
    }

    #[test]
    fn resolve_root_children() {
        let mut fs = server();
        let scope = fs.inodes.intern(vec!["scope".to_owned()]);
        let node = fs.resolve(scope).unwrap();
        assert_eq!(node.read_all().unwrap(), b".");
    }

    #[test]
    fn stale_paths_fail_to_resolve() {
        let mut fs = server();
        let stale = fs.inodes.intern(vec!["req".to_owned(), "0".to_owned()]);
        assert!(matches!(fs.resolve(stale), Err(FsError::NotFound)));
    }

    #[test]
    fn intern_is_stable_per_path() {
        let mut fs = server();
        let a = fs.inodes.intern(vec!["intreq".to_owned()]);
        let b = fs.inodes.intern(vec!["intreq".to_owned()]);
        assert_eq!(a, b);
        assert_ne!(a, ROOT_INODE);
    }
}
