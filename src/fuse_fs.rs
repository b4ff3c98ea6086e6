//! Thin `fuser::Filesystem` glue: translates kernel inode-based calls into
//! [`FsAdapter`]'s path-based operations.
//!
//! Carries no chunk-store logic of its own. The inode table is lazily
//! populated on `lookup`/`readdir`, the conventional approach for a
//! passthrough-style filesystem — grounded in `cberner-fuser`'s
//! `Filesystem` trait (method signatures, `Reply*` types) and
//! `str4d-tev`'s backup-mount command (inode table assigned on demand,
//! `fuser::mount2` invocation).

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
};

use crate::chunkstore::CHUNK_SIZE;
use crate::fsadapter::{Attr, EntryKind, FsAdapter};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// Bidirectional map between kernel inode numbers and logical paths. Not
/// part of the core's on-disk state; rebuilt fresh on every mount.
struct InodeTable {
    path_to_ino: HashMap<PathBuf, u64>,
    ino_to_path: HashMap<u64, PathBuf>,
    next_ino: AtomicU64,
}

impl InodeTable {
    fn new() -> Self {
        let mut path_to_ino = HashMap::new();
        let mut ino_to_path = HashMap::new();
        path_to_ino.insert(PathBuf::from("/"), ROOT_INO);
        ino_to_path.insert(ROOT_INO, PathBuf::from("/"));
        Self {
            path_to_ino,
            ino_to_path,
            next_ino: AtomicU64::new(ROOT_INO + 1),
        }
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.ino_to_path.get(&ino).cloned()
    }

    /// Returns the inode for `path`, assigning a fresh one if this is the
    /// first time it has been seen.
    fn ino_of(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.path_to_ino.get(path) {
            return ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        self.path_to_ino.insert(path.to_path_buf(), ino);
        self.ino_to_path.insert(ino, path.to_path_buf());
        ino
    }

    fn forget_path(&mut self, path: &Path) {
        if let Some(ino) = self.path_to_ino.remove(path) {
            self.ino_to_path.remove(&ino);
        }
    }

    fn rename_path(&mut self, from: &Path, to: &Path) {
        if let Some(ino) = self.path_to_ino.remove(from) {
            self.ino_to_path.remove(&ino);
            self.path_to_ino.insert(to.to_path_buf(), ino);
            self.ino_to_path.insert(ino, to.to_path_buf());
        }
    }
}

/// The mountable filesystem. Holds the path-based core plus the
/// inode table needed to speak to the kernel.
pub struct JunkNasFs {
    adapter: FsAdapter,
    inodes: Mutex<InodeTable>,
}

impl JunkNasFs {
    pub fn new(adapter: FsAdapter) -> Self {
        Self {
            adapter,
            inodes: Mutex::new(InodeTable::new()),
        }
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.lock().unwrap().path_of(ino)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        Some(self.path_of(parent)?.join(name))
    }

    fn ino_of(&self, path: &Path) -> u64 {
        self.inodes.lock().unwrap().ino_of(path)
    }

    fn attr_for(&self, ino: u64, attr: Attr) -> FileAttr {
        let now = SystemTime::now();
        let kind = match attr.kind {
            EntryKind::File => FileType::RegularFile,
            EntryKind::Directory => FileType::Directory,
        };
        let blocks = (attr.size + CHUNK_SIZE as u64 - 1) / CHUNK_SIZE as u64;
        FileAttr {
            ino,
            size: attr.size,
            blocks,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            perm: match kind {
                FileType::Directory => 0o755,
                _ => 0o644,
            },
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: CHUNK_SIZE as u32,
            flags: 0,
        }
    }
}

impl Filesystem for JunkNasFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.adapter.getattr(&path) {
            Ok(attr) => {
                let ino = self.ino_of(&path);
                reply.entry(&TTL, &self.attr_for(ino, attr), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.adapter.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &self.attr_for(ino, attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Some(new_size) = size {
            // spec §4.5: truncate requires an open handle.
            let Some(fh) = fh else {
                reply.error(libc::EACCES);
                return;
            };
            if let Err(e) = self.adapter.truncate(fh, new_size) {
                reply.error(e.to_errno());
                return;
            }
        }
        match self.adapter.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &self.attr_for(ino, attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Err(e) = self.adapter.mkdir(&path) {
            reply.error(e.to_errno());
            return;
        }
        let ino = self.ino_of(&path);
        let attr = Attr {
            kind: EntryKind::Directory,
            size: 0,
        };
        reply.entry(&TTL, &self.attr_for(ino, attr), 0);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.adapter.rmdir(&path) {
            Ok(()) => {
                self.inodes.lock().unwrap().forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.adapter.unlink(&path) {
            Ok(()) => {
                self.inodes.lock().unwrap().forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.adapter.rename(&from, &to) {
            Ok(()) => {
                self.inodes.lock().unwrap().rename_path(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.adapter.create(&path) {
            Ok(fh) => {
                let ino = self.ino_of(&path);
                let attr = Attr {
                    kind: EntryKind::File,
                    size: 0,
                };
                reply.created(&TTL, &self.attr_for(ino, attr), 0, fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.adapter.open(&path) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.adapter.read(fh, offset as u64, size as usize) {
            Ok(bytes) => reply.data(&bytes),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.adapter.write(fh, offset as u64, data) {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.adapter.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        // Directories carry no per-open state in the adapter; the inode
        // itself is a stable enough "handle" for readdir/releasedir.
        reply.opened(ino, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let entries = match self.adapter.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let mut numbered = Vec::with_capacity(entries.len());
        for entry in entries {
            let child = path.join(&entry.name);
            let kind = match entry.kind {
                EntryKind::File => FileType::RegularFile,
                EntryKind::Directory => FileType::Directory,
            };
            numbered.push((self.ino_of(&child), kind, entry.name));
        }

        for (i, (child_ino, kind, name)) in numbered.into_iter().enumerate().skip(offset as usize) {
            if reply.add(child_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = self.path_of(ino).unwrap_or_else(|| PathBuf::from("/"));
        match self.adapter.statfs(&path) {
            Ok(stat) => reply.statfs(
                stat.total_blocks,
                stat.free_blocks,
                stat.free_blocks,
                0,
                0,
                stat.block_size as u32,
                255,
                stat.block_size as u32,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}
