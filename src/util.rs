use crate::proto::Attr;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::FileStat;

/// Group every exported entry is reported as belonging to (AID_SDCARD_RW).
pub const SDCARD_RW_GID: u32 = 1015;

/// Lower-case ASCII letters in place. Idempotent; bytes outside `A..Z`
/// pass through untouched.
pub fn normalize_name(name: &mut [u8]) {
    for byte in name.iter_mut() {
        if byte.is_ascii_uppercase() {
            *byte = byte.to_ascii_lowercase();
        }
    }
}

/// True if `normalize_name` would change the input. Lets the repair pass
/// skip no-op renames.
pub fn name_needs_normalizing(name: &[u8]) -> bool {
    name.iter().any(|byte| byte.is_ascii_uppercase())
}

fn clamped_mode(mode: u32) -> u32 {
    let type_bits = mode & libc::S_IFMT;
    if mode & 0o111 != 0 {
        type_bits | 0o775
    } else {
        type_bits | 0o664
    }
}

fn wire_time(sec: i64, nsec: i64) -> (u64, u32) {
    if sec < 0 {
        return (0, 0);
    }
    let nanos = if nsec < 0 { 0 } else { nsec as u32 };
    (sec as u64, nanos)
}

/// Translate a backing stat into a wire attr record under the fixed
/// ownership policy: owned by root:sdcard, permissions exactly 0775 when
/// any executable bit was set and 0664 otherwise, inode replaced by the
/// node id the kernel knows.
pub fn attr_from_stat(stat: &FileStat, nid: u64) -> Attr {
    let (atime, atimensec) = wire_time(stat.st_atime, stat.st_atime_nsec);
    let (mtime, mtimensec) = wire_time(stat.st_mtime, stat.st_mtime_nsec);
    let (ctime, ctimensec) = wire_time(stat.st_ctime, stat.st_ctime_nsec);

    Attr {
        ino: nid,
        size: stat.st_size as u64,
        blocks: stat.st_blocks as u64,
        atime,
        mtime,
        ctime,
        atimensec,
        mtimensec,
        ctimensec,
        mode: clamped_mode(stat.st_mode),
        nlink: stat.st_nlink as u32,
        uid: 0,
        gid: SDCARD_RW_GID,
        rdev: stat.st_rdev as u32,
        blksize: stat.st_blksize as u32,
        padding: 0,
    }
}

pub fn oflag_from_bits(flags: u32) -> OFlag {
    OFlag::from_bits_truncate(flags as i32)
}

pub fn dirent_type(file_type: Option<nix::dir::Type>) -> u32 {
    let dt = match file_type {
        Some(nix::dir::Type::Fifo) => libc::DT_FIFO,
        Some(nix::dir::Type::CharacterDevice) => libc::DT_CHR,
        Some(nix::dir::Type::Directory) => libc::DT_DIR,
        Some(nix::dir::Type::BlockDevice) => libc::DT_BLK,
        Some(nix::dir::Type::File) => libc::DT_REG,
        Some(nix::dir::Type::Symlink) => libc::DT_LNK,
        Some(nix::dir::Type::Socket) => libc::DT_SOCK,
        None => libc::DT_UNKNOWN,
    };
    dt as u32
}

pub fn retry_eintr<T, F>(mut op: F) -> Result<T, nix::Error>
where
    F: FnMut() -> Result<T, nix::Error>,
{
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}
