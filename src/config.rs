use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use nix::unistd::{Gid, Uid};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;

/// Runtime settings shared by startup, the repair pass, and the
/// dispatcher.
#[derive(Debug)]
pub struct Config {
    /// Directory tree exported through the mount.
    pub backing_path: PathBuf,
    backing_fd: OwnedFd,
    /// Identity the daemon drops to after mounting; never zero.
    pub uid: Uid,
    pub gid: Gid,
    /// Lower-case reported paths (the `-l` flag).
    pub case_fold: bool,
}

impl Config {
    /// Opens the exported directory up front; the fd anchors the *at
    /// backing syscalls for the daemon's lifetime.
    pub fn open_backing(
        backing_path: PathBuf,
        uid: Uid,
        gid: Gid,
        case_fold: bool,
    ) -> nix::Result<Self> {
        let backing_fd = open(
            &backing_path,
            OFlag::O_RDONLY | OFlag::O_CLOEXEC | OFlag::O_DIRECTORY,
            Mode::empty(),
        )?;

        Ok(Self {
            backing_path,
            backing_fd,
            uid,
            gid,
            case_fold,
        })
    }

    /// Anchor for the *at syscalls. Assembled backing paths are
    /// absolute, so the anchor is never traversed.
    pub fn backing_fd(&self) -> BorrowedFd<'_> {
        self.backing_fd.as_fd()
    }
}
