use crate::config::Config;
use crate::error::{FsError, FsResult};
use crate::handle_table::{Handle, HandleTable};
use crate::node_store::{NodeId, NodeStore, ROOT_NID};
use crate::proto::{
    self, FATTR_GID, FATTR_MODE, FATTR_SIZE, FATTR_UID, FUSE_ATOMIC_O_TRUNC, FUSE_KERNEL_VERSION,
    FUSE_KERNEL_MINOR_VERSION, FUSE_UNKNOWN_INO, Opcode,
};
use crate::util::{attr_from_stat, dirent_type, oflag_from_bits, retry_eintr};
use log::{debug, error, trace, warn};
use nix::dir::Dir;
use nix::fcntl::{OFlag, open, renameat};
use nix::sys::stat::{Mode, SFlag, lstat, mknod};
use nix::sys::statvfs::statvfs;
use nix::sys::uio::{pread, pwrite};
use nix::unistd::{UnlinkatFlags, mkdir, truncate, unlink, unlinkat};
use std::ffi::OsStr;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;

/// Largest read the daemon serves; bigger requests are rejected.
pub const MAX_READ: u32 = 128 * 1024;
/// Write size advertised at INIT; a whole write arrives in one frame.
pub const MAX_WRITE: u32 = 256 * 1024;
/// Channel read buffer: the negotiated max write plus framing headroom.
pub const MAX_REQUEST_SIZE: usize = MAX_WRITE as usize + 128;

const MAX_BACKGROUND: u16 = 32;
const CONGESTION_THRESHOLD: u16 = 32;
/// Entry and attr validity handed to the kernel, in seconds.
const VALIDITY_SECS: u64 = 10;

fn os_path(bytes: &[u8]) -> &OsStr {
    OsStr::from_bytes(bytes)
}

/// The daemon proper: one kernel channel, the node cache, and the open
/// handle table, all owned by the single request loop.
pub struct SdcardFs {
    channel: OwnedFd,
    config: Config,
    nodes: NodeStore,
    handles: HandleTable,
}

impl SdcardFs {
    pub fn new(channel: OwnedFd, config: Config) -> Self {
        let nodes = NodeStore::new(config.backing_path.as_os_str().as_bytes(), config.case_fold);
        Self {
            channel,
            config,
            nodes,
            handles: HandleTable::new(),
        }
    }

    /// Blocking request loop: one read, one dispatch, one reply. Only an
    /// unrecoverable channel read error ends it; the kernel closing the
    /// channel is the normal way out.
    pub fn run(&mut self) {
        let mut buf = vec![0u8; MAX_REQUEST_SIZE];
        loop {
            let len = match retry_eintr(|| nix::unistd::read(self.channel.as_fd(), &mut buf)) {
                Ok(len) => len,
                Err(err) => {
                    error!("request channel read failed: {err}");
                    return;
                }
            };
            self.handle_request(&buf[..len]);
        }
    }

    fn handle_request(&mut self, frame: &[u8]) {
        let Some(hdr) = proto::InHeader::parse(frame) else {
            warn!("dropping malformed request frame ({} bytes)", frame.len());
            return;
        };
        if hdr.len as usize != frame.len() {
            warn!(
                "dropping request frame with inconsistent length ({} header vs {} read)",
                hdr.len,
                frame.len()
            );
            return;
        }
        let payload = &frame[proto::IN_HEADER_SIZE..];

        let opcode = match Opcode::try_from(hdr.opcode) {
            Ok(opcode) => opcode,
            Err(()) => {
                debug!("unimplemented opcode {} uniq={:#x}", hdr.opcode, hdr.unique);
                self.send_status(hdr.unique, -libc::ENOSYS);
                return;
            }
        };

        trace!(
            "{opcode:?} uniq={:#x} nid={:#x} uid={} gid={} pid={}",
            hdr.unique, hdr.nodeid, hdr.uid, hdr.gid, hdr.pid
        );

        let node = if hdr.nodeid != 0 {
            match self.nodes.get(hdr.nodeid) {
                Some(node) => Some(node.nid),
                None => {
                    if opcode == Opcode::Forget {
                        warn!("forget of unknown node {:#x}", hdr.nodeid);
                    } else {
                        self.send_status(hdr.unique, -libc::ENOENT);
                    }
                    return;
                }
            }
        } else {
            None
        };

        let result = match opcode {
            Opcode::Lookup => self.op_lookup(&hdr, node, payload),
            Opcode::Forget => self.op_forget(node, payload),
            Opcode::Getattr => self.op_getattr(&hdr, node, payload),
            Opcode::Setattr => self.op_setattr(&hdr, node, payload),
            Opcode::Mknod => self.op_mknod(&hdr, node, payload),
            Opcode::Mkdir => self.op_mkdir(&hdr, node, payload),
            Opcode::Unlink => self.op_unlink(&hdr, node, payload),
            Opcode::Rmdir => self.op_rmdir(&hdr, node, payload),
            Opcode::Rename => self.op_rename(&hdr, node, payload),
            Opcode::Open => self.op_open(&hdr, node, payload),
            Opcode::Read => self.op_read(&hdr, payload),
            Opcode::Write => self.op_write(&hdr, payload),
            Opcode::Statfs => self.op_statfs(&hdr),
            Opcode::Release | Opcode::Releasedir => self.op_release(&hdr, payload),
            Opcode::Flush => {
                self.send_status(hdr.unique, 0);
                Ok(())
            }
            Opcode::Opendir => self.op_opendir(&hdr, node),
            Opcode::Readdir => self.op_readdir(&hdr, payload),
            Opcode::Init => self.op_init(&hdr, payload),
            Opcode::Readlink
            | Opcode::Symlink
            | Opcode::Link
            | Opcode::Fsync
            | Opcode::Setxattr
            | Opcode::Getxattr
            | Opcode::Listxattr
            | Opcode::Removexattr
            | Opcode::Fsyncdir => Err(FsError::NotImplemented),
        };

        if let Err(err) = result {
            self.send_status(hdr.unique, -err.errno());
        }
    }

    fn send_status(&self, unique: u64, error: i32) {
        proto::send_status(self.channel.as_fd(), unique, error);
    }

    /// Payload reply where a failed write is only logged; the kernel
    /// treats the request as timed out.
    fn send_payload(&self, unique: u64, body: &[u8]) {
        if let Err(err) = proto::reply_payload(self.channel.as_fd(), unique, body) {
            error!("reply for request {unique:#x} failed: {err}");
        }
    }

    fn attr_for_node(&self, nid: NodeId) -> FsResult<proto::Attr> {
        let path = self.nodes.path_for(nid, None)?;
        let stat = lstat(os_path(&path))?;
        Ok(attr_from_stat(&stat, nid))
    }

    /// Lookup-style reply: find or create the child, send the entry
    /// record, and only then take the kernel's reference. A failed reply
    /// write means the kernel never acquired it, so the bump is skipped.
    fn reply_entry(&mut self, unique: u64, parent: NodeId, name: &[u8]) -> FsResult<()> {
        let path = self.nodes.path_for(parent, Some(name))?;
        let stat = lstat(os_path(&path)).map_err(|_| FsError::NotFound)?;
        let nid = self.nodes.lookup_or_create(parent, name)?;
        let generation = self.nodes.resolve(nid)?.generation;

        let out = proto::EntryOut {
            nodeid: nid,
            generation,
            entry_valid: VALIDITY_SECS,
            attr_valid: VALIDITY_SECS,
            entry_valid_nsec: 0,
            attr_valid_nsec: 0,
            attr: attr_from_stat(&stat, nid),
        };
        match proto::reply_payload(self.channel.as_fd(), unique, &out.encode()) {
            Ok(()) => self.nodes.acquire(nid),
            Err(err) => {
                error!("entry reply for request {unique:#x} failed, reference not taken: {err}");
            }
        }
        Ok(())
    }

    fn op_lookup(&mut self, hdr: &proto::InHeader, node: Option<NodeId>, payload: &[u8]) -> FsResult<()> {
        let parent = node.ok_or(FsError::InvalidArgument)?;
        let name = proto::parse_name(payload).ok_or(FsError::InvalidArgument)?;
        trace!(
            "LOOKUP {} @ {parent:#x}",
            String::from_utf8_lossy(name)
        );
        self.reply_entry(hdr.unique, parent, name)
    }

    fn op_forget(&mut self, node: Option<NodeId>, payload: &[u8]) -> FsResult<()> {
        // Forgets are never replied to, not even on bad input.
        let Some(nid) = node else {
            return Ok(());
        };
        let Some(req) = proto::ForgetIn::parse(payload) else {
            return Ok(());
        };
        trace!("FORGET {nid:#x} n={}", req.nlookup);
        self.nodes.forget(nid, req.nlookup);
        Ok(())
    }

    fn op_getattr(&mut self, hdr: &proto::InHeader, node: Option<NodeId>, payload: &[u8]) -> FsResult<()> {
        let nid = node.ok_or(FsError::InvalidArgument)?;
        // The handle hint is ignored; attrs always come from a fresh stat.
        if let Some(req) = proto::GetattrIn::parse(payload) {
            trace!("GETATTR {nid:#x} flags={:#x} fh={}", req.getattr_flags, req.fh);
        } else {
            trace!("GETATTR {nid:#x}");
        }
        let attr = self.attr_for_node(nid)?;
        let out = proto::AttrOut {
            attr_valid: VALIDITY_SECS,
            attr_valid_nsec: 0,
            attr,
        };
        self.send_payload(hdr.unique, &out.encode());
        Ok(())
    }

    fn op_setattr(&mut self, hdr: &proto::InHeader, node: Option<NodeId>, payload: &[u8]) -> FsResult<()> {
        let nid = node.ok_or(FsError::InvalidArgument)?;
        let req = proto::SetattrIn::parse(payload).ok_or(FsError::InvalidArgument)?;
        trace!("SETATTR {nid:#x} valid={:#x} fh={}", req.valid, req.fh);

        // chmod and chown are deliberately dropped: ownership and mode
        // are fixed by policy. Only truncation reaches the backing tree.
        if req.valid & (FATTR_MODE | FATTR_UID | FATTR_GID) != 0 {
            debug!(
                "ignoring mode/ownership change on {nid:#x} (mode={:o} uid={} gid={})",
                req.mode, req.uid, req.gid
            );
        }
        if req.valid & FATTR_SIZE != 0 {
            let path = self.nodes.path_for(nid, None)?;
            truncate(os_path(&path), req.size as libc::off_t)?;
        }

        let attr = self.attr_for_node(nid)?;
        let out = proto::AttrOut {
            attr_valid: VALIDITY_SECS,
            attr_valid_nsec: 0,
            attr,
        };
        self.send_payload(hdr.unique, &out.encode());
        Ok(())
    }

    fn op_mknod(&mut self, hdr: &proto::InHeader, node: Option<NodeId>, payload: &[u8]) -> FsResult<()> {
        let parent = node.ok_or(FsError::InvalidArgument)?;
        let req = proto::MknodIn::parse(payload).ok_or(FsError::InvalidArgument)?;
        let name =
            proto::parse_name(&payload[proto::MKNOD_IN_SIZE..]).ok_or(FsError::InvalidArgument)?;
        trace!("MKNOD {} @ {parent:#x}", String::from_utf8_lossy(name));

        let path = self.nodes.path_for(parent, Some(name))?;
        // Clamp before the backing call so the new entry stats back with
        // the policy permissions; type bits pass through.
        let kind = SFlag::from_bits_truncate(req.mode & libc::S_IFMT);
        mknod(
            os_path(&path),
            kind,
            Mode::from_bits_truncate(0o664),
            req.rdev as libc::dev_t,
        )?;
        self.reply_entry(hdr.unique, parent, name)
    }

    fn op_mkdir(&mut self, hdr: &proto::InHeader, node: Option<NodeId>, payload: &[u8]) -> FsResult<()> {
        let parent = node.ok_or(FsError::InvalidArgument)?;
        let _req = proto::MkdirIn::parse(payload).ok_or(FsError::InvalidArgument)?;
        let name =
            proto::parse_name(&payload[proto::MKDIR_IN_SIZE..]).ok_or(FsError::InvalidArgument)?;
        trace!("MKDIR {} @ {parent:#x}", String::from_utf8_lossy(name));

        let path = self.nodes.path_for(parent, Some(name))?;
        mkdir(os_path(&path), Mode::from_bits_truncate(0o775))?;
        self.reply_entry(hdr.unique, parent, name)
    }

    fn op_unlink(&mut self, hdr: &proto::InHeader, node: Option<NodeId>, payload: &[u8]) -> FsResult<()> {
        let parent = node.ok_or(FsError::InvalidArgument)?;
        let name = proto::parse_name(payload).ok_or(FsError::InvalidArgument)?;
        trace!("UNLINK {} @ {parent:#x}", String::from_utf8_lossy(name));
        let path = self.nodes.path_for(parent, Some(name))?;
        unlink(os_path(&path))?;
        self.send_status(hdr.unique, 0);
        Ok(())
    }

    fn op_rmdir(&mut self, hdr: &proto::InHeader, node: Option<NodeId>, payload: &[u8]) -> FsResult<()> {
        let parent = node.ok_or(FsError::InvalidArgument)?;
        let name = proto::parse_name(payload).ok_or(FsError::InvalidArgument)?;
        trace!("RMDIR {} @ {parent:#x}", String::from_utf8_lossy(name));
        let path = self.nodes.path_for(parent, Some(name))?;
        unlinkat(
            self.config.backing_fd(),
            os_path(&path),
            UnlinkatFlags::RemoveDir,
        )?;
        self.send_status(hdr.unique, 0);
        Ok(())
    }

    fn op_rename(&mut self, hdr: &proto::InHeader, node: Option<NodeId>, payload: &[u8]) -> FsResult<()> {
        let old_parent = node.ok_or(FsError::InvalidArgument)?;
        let req = proto::RenameIn::parse(payload).ok_or(FsError::InvalidArgument)?;
        let (old_name, new_name) = proto::parse_name_pair(&payload[proto::RENAME_IN_SIZE..])
            .ok_or(FsError::InvalidArgument)?;
        trace!(
            "RENAME {} -> {} @ {old_parent:#x}",
            String::from_utf8_lossy(old_name),
            String::from_utf8_lossy(new_name)
        );

        let target = self
            .nodes
            .child_by_name(old_parent, old_name)
            .ok_or(FsError::NotFound)?;
        let old_path = self.nodes.path_for(old_parent, Some(old_name))?;
        let new_parent = self
            .nodes
            .get(req.newdir)
            .map(|node| node.nid)
            .ok_or(FsError::NotFound)?;
        let new_path = self.nodes.path_for(new_parent, Some(new_name))?;

        // The cache moves first; a failing backing rename leaves it
        // moved. The next lookup of either name re-syncs.
        self.nodes.detach_child(old_parent, target)?;
        self.nodes.set_name(target, new_name)?;
        // An overwritten cached sibling would break name uniqueness;
        // evict it and let outstanding forgets destroy it.
        if let Some(stale) = self.nodes.child_by_name(new_parent, new_name) {
            self.nodes.detach_child(new_parent, stale)?;
        }
        self.nodes.attach_child(new_parent, target)?;

        renameat(
            self.config.backing_fd(),
            os_path(&old_path),
            self.config.backing_fd(),
            os_path(&new_path),
        )?;
        self.send_status(hdr.unique, 0);
        Ok(())
    }

    fn op_open(&mut self, hdr: &proto::InHeader, node: Option<NodeId>, payload: &[u8]) -> FsResult<()> {
        let nid = node.ok_or(FsError::InvalidArgument)?;
        let req = proto::OpenIn::parse(payload).ok_or(FsError::InvalidArgument)?;
        let path = self.nodes.path_for(nid, None)?;
        trace!(
            "OPEN {nid:#x} '{}' flags={:#o}",
            String::from_utf8_lossy(&path),
            req.flags
        );

        let fd = open(
            os_path(&path),
            oflag_from_bits(req.flags) | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        let fh = self.handles.insert_file(nid, fd);
        let out = proto::OpenOut { fh, open_flags: 0 };
        self.send_payload(hdr.unique, &out.encode());
        Ok(())
    }

    fn op_read(&mut self, hdr: &proto::InHeader, payload: &[u8]) -> FsResult<()> {
        let req = proto::ReadIn::parse(payload).ok_or(FsError::InvalidArgument)?;
        trace!("READ fh={} {}@{}", req.fh, req.size, req.offset);
        if req.size > MAX_READ {
            return Err(FsError::InvalidArgument);
        }
        let fd = self.handles.get_file(req.fh).ok_or(FsError::NotFound)?;
        let mut buf = vec![0u8; req.size as usize];
        let read = pread(fd, &mut buf, req.offset as libc::off_t)?;
        self.send_payload(hdr.unique, &buf[..read]);
        Ok(())
    }

    fn op_write(&mut self, hdr: &proto::InHeader, payload: &[u8]) -> FsResult<()> {
        let req = proto::WriteIn::parse(payload).ok_or(FsError::InvalidArgument)?;
        trace!("WRITE fh={} {}@{}", req.fh, req.size, req.offset);
        let data = payload
            .get(proto::WRITE_IN_SIZE..proto::WRITE_IN_SIZE + req.size as usize)
            .ok_or(FsError::InvalidArgument)?;
        let fd = self.handles.get_file(req.fh).ok_or(FsError::NotFound)?;
        let written = pwrite(fd, data, req.offset as libc::off_t)?;
        let out = proto::WriteOut {
            size: written as u32,
        };
        self.send_payload(hdr.unique, &out.encode());
        Ok(())
    }

    fn op_statfs(&mut self, hdr: &proto::InHeader) -> FsResult<()> {
        trace!("STATFS");
        let root = self.nodes.resolve(ROOT_NID)?;
        let stat = statvfs(os_path(&root.name))?;
        let out = proto::StatfsOut {
            blocks: stat.blocks() as u64,
            bfree: stat.blocks_free() as u64,
            bavail: stat.blocks_available() as u64,
            files: stat.files() as u64,
            ffree: stat.files_free() as u64,
            bsize: stat.block_size() as u32,
            namelen: stat.name_max() as u32,
            frsize: stat.fragment_size() as u32,
        };
        self.send_payload(hdr.unique, &out.encode());
        Ok(())
    }

    fn op_release(&mut self, hdr: &proto::InHeader, payload: &[u8]) -> FsResult<()> {
        let req = proto::ReleaseIn::parse(payload).ok_or(FsError::InvalidArgument)?;
        // Dropping the handle closes the fd or directory stream.
        match self.handles.remove(req.fh) {
            Some(Handle::File { nid, .. }) => trace!("RELEASE fh={} node={nid:#x}", req.fh),
            Some(Handle::Dir { nid, .. }) => trace!("RELEASEDIR fh={} node={nid:#x}", req.fh),
            None => return Err(FsError::NotFound),
        }
        self.send_status(hdr.unique, 0);
        Ok(())
    }

    fn op_opendir(&mut self, hdr: &proto::InHeader, node: Option<NodeId>) -> FsResult<()> {
        let nid = node.ok_or(FsError::InvalidArgument)?;
        let path = self.nodes.path_for(nid, None)?;
        trace!("OPENDIR {nid:#x} '{}'", String::from_utf8_lossy(&path));

        let dir = Dir::open(
            os_path(&path),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        let fh = self.handles.insert_dir(nid, dir.into_iter());
        let out = proto::OpenOut { fh, open_flags: 0 };
        self.send_payload(hdr.unique, &out.encode());
        Ok(())
    }

    /// One directory entry per request; end of stream is a bare status 0.
    fn op_readdir(&mut self, hdr: &proto::InHeader, payload: &[u8]) -> FsResult<()> {
        let req = proto::ReadIn::parse(payload).ok_or(FsError::InvalidArgument)?;
        trace!("READDIR fh={}", req.fh);
        let stream = self.handles.get_dir_mut(req.fh).ok_or(FsError::NotFound)?;
        match stream.next() {
            None => {
                self.send_status(hdr.unique, 0);
            }
            Some(Err(err)) => return Err(err.into()),
            Some(Ok(entry)) => {
                let record = proto::encode_dirent(
                    FUSE_UNKNOWN_INO,
                    0,
                    dirent_type(entry.file_type()),
                    entry.file_name().to_bytes(),
                );
                self.send_payload(hdr.unique, &record);
            }
        }
        Ok(())
    }

    fn op_init(&mut self, hdr: &proto::InHeader, payload: &[u8]) -> FsResult<()> {
        let req = proto::InitIn::parse(payload).ok_or(FsError::InvalidArgument)?;
        debug!(
            "INIT ver={}.{} max_readahead={} flags={:#x}",
            req.major, req.minor, req.max_readahead, req.flags
        );
        let out = proto::InitOut {
            major: FUSE_KERNEL_VERSION,
            minor: FUSE_KERNEL_MINOR_VERSION,
            max_readahead: req.max_readahead,
            flags: FUSE_ATOMIC_O_TRUNC,
            max_background: MAX_BACKGROUND,
            congestion_threshold: CONGESTION_THRESHOLD,
            max_write: MAX_WRITE,
        };
        self.send_payload(hdr.unique, &out.encode());
        Ok(())
    }
}
