//! FUSE kernel protocol: wire structs, opcode numbering, frame
//! parse/encode, and the two reply writers. Layouts follow
//! include/uapi/linux/fuse.h for the negotiated 7.13 protocol;
//! integers are little-endian on every supported target.

use log::error;
use nix::sys::uio::writev;
use std::io::IoSlice;
use std::os::fd::BorrowedFd;

pub const FUSE_KERNEL_VERSION: u32 = 7;
pub const FUSE_KERNEL_MINOR_VERSION: u32 = 13;

pub const FUSE_ROOT_ID: u64 = 1;
pub const FUSE_UNKNOWN_INO: u64 = 0xffffffff;

/// Support for open(O_TRUNC) handled atomically by the filesystem.
pub const FUSE_ATOMIC_O_TRUNC: u32 = 1 << 3;

// fuse_setattr_in valid bits.
pub const FATTR_MODE: u32 = 1 << 0;
pub const FATTR_UID: u32 = 1 << 1;
pub const FATTR_GID: u32 = 1 << 2;
pub const FATTR_SIZE: u32 = 1 << 3;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Lookup = 1,
    Forget = 2,
    Getattr = 3,
    Setattr = 4,
    Readlink = 5,
    Symlink = 6,
    Mknod = 8,
    Mkdir = 9,
    Unlink = 10,
    Rmdir = 11,
    Rename = 12,
    Link = 13,
    Open = 14,
    Read = 15,
    Write = 16,
    Statfs = 17,
    Release = 18,
    Fsync = 20,
    Setxattr = 21,
    Getxattr = 22,
    Listxattr = 23,
    Removexattr = 24,
    Flush = 25,
    Init = 26,
    Opendir = 27,
    Readdir = 28,
    Releasedir = 29,
    Fsyncdir = 30,
}

impl TryFrom<u32> for Opcode {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, ()> {
        match value {
            1 => Ok(Self::Lookup),
            2 => Ok(Self::Forget),
            3 => Ok(Self::Getattr),
            4 => Ok(Self::Setattr),
            5 => Ok(Self::Readlink),
            6 => Ok(Self::Symlink),
            8 => Ok(Self::Mknod),
            9 => Ok(Self::Mkdir),
            10 => Ok(Self::Unlink),
            11 => Ok(Self::Rmdir),
            12 => Ok(Self::Rename),
            13 => Ok(Self::Link),
            14 => Ok(Self::Open),
            15 => Ok(Self::Read),
            16 => Ok(Self::Write),
            17 => Ok(Self::Statfs),
            18 => Ok(Self::Release),
            20 => Ok(Self::Fsync),
            21 => Ok(Self::Setxattr),
            22 => Ok(Self::Getxattr),
            23 => Ok(Self::Listxattr),
            24 => Ok(Self::Removexattr),
            25 => Ok(Self::Flush),
            26 => Ok(Self::Init),
            27 => Ok(Self::Opendir),
            28 => Ok(Self::Readdir),
            29 => Ok(Self::Releasedir),
            30 => Ok(Self::Fsyncdir),
            _ => Err(()),
        }
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn read_i32(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}

/// Request header, 40 bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct InHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

pub const IN_HEADER_SIZE: usize = 40;

impl InHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < IN_HEADER_SIZE {
            return None;
        }
        Some(Self {
            len: read_u32(data, 0),
            opcode: read_u32(data, 4),
            unique: read_u64(data, 8),
            nodeid: read_u64(data, 16),
            uid: read_u32(data, 24),
            gid: read_u32(data, 28),
            pid: read_u32(data, 32),
        })
    }
}

/// Reply header, 16 bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct OutHeader {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

pub const OUT_HEADER_SIZE: usize = 16;

impl OutHeader {
    pub fn encode(&self) -> [u8; OUT_HEADER_SIZE] {
        let mut buf = [0u8; OUT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.len.to_le_bytes());
        buf[4..8].copy_from_slice(&self.error.to_le_bytes());
        buf[8..16].copy_from_slice(&self.unique.to_le_bytes());
        buf
    }

    #[allow(dead_code)] // decode side, exercised by the tests
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < OUT_HEADER_SIZE {
            return None;
        }
        Some(Self {
            len: read_u32(data, 0),
            error: read_i32(data, 4),
            unique: read_u64(data, 8),
        })
    }
}

/// fuse_attr, 88 bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub padding: u32,
}

pub const ATTR_SIZE: usize = 88;

impl Attr {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.ino.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.blocks.to_le_bytes());
        buf.extend_from_slice(&self.atime.to_le_bytes());
        buf.extend_from_slice(&self.mtime.to_le_bytes());
        buf.extend_from_slice(&self.ctime.to_le_bytes());
        buf.extend_from_slice(&self.atimensec.to_le_bytes());
        buf.extend_from_slice(&self.mtimensec.to_le_bytes());
        buf.extend_from_slice(&self.ctimensec.to_le_bytes());
        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(&self.nlink.to_le_bytes());
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&self.gid.to_le_bytes());
        buf.extend_from_slice(&self.rdev.to_le_bytes());
        buf.extend_from_slice(&self.blksize.to_le_bytes());
        buf.extend_from_slice(&self.padding.to_le_bytes());
    }

    #[allow(dead_code)] // decode side, exercised by the tests
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ATTR_SIZE {
            return None;
        }
        Some(Self {
            ino: read_u64(data, 0),
            size: read_u64(data, 8),
            blocks: read_u64(data, 16),
            atime: read_u64(data, 24),
            mtime: read_u64(data, 32),
            ctime: read_u64(data, 40),
            atimensec: read_u32(data, 48),
            mtimensec: read_u32(data, 52),
            ctimensec: read_u32(data, 56),
            mode: read_u32(data, 60),
            nlink: read_u32(data, 64),
            uid: read_u32(data, 68),
            gid: read_u32(data, 72),
            rdev: read_u32(data, 76),
            blksize: read_u32(data, 80),
            padding: read_u32(data, 84),
        })
    }
}

/// fuse_entry_out: lookup-style reply, 128 bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct EntryOut {
    pub nodeid: u64,
    pub generation: u64,
    pub entry_valid: u64,
    pub attr_valid: u64,
    pub entry_valid_nsec: u32,
    pub attr_valid_nsec: u32,
    pub attr: Attr,
}

pub const ENTRY_OUT_SIZE: usize = 40 + ATTR_SIZE;

impl EntryOut {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENTRY_OUT_SIZE);
        buf.extend_from_slice(&self.nodeid.to_le_bytes());
        buf.extend_from_slice(&self.generation.to_le_bytes());
        buf.extend_from_slice(&self.entry_valid.to_le_bytes());
        buf.extend_from_slice(&self.attr_valid.to_le_bytes());
        buf.extend_from_slice(&self.entry_valid_nsec.to_le_bytes());
        buf.extend_from_slice(&self.attr_valid_nsec.to_le_bytes());
        self.attr.encode_into(&mut buf);
        buf
    }

    #[allow(dead_code)] // decode side, exercised by the tests
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ENTRY_OUT_SIZE {
            return None;
        }
        Some(Self {
            nodeid: read_u64(data, 0),
            generation: read_u64(data, 8),
            entry_valid: read_u64(data, 16),
            attr_valid: read_u64(data, 24),
            entry_valid_nsec: read_u32(data, 32),
            attr_valid_nsec: read_u32(data, 36),
            attr: Attr::parse(&data[40..])?,
        })
    }
}

/// fuse_attr_out, 104 bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct AttrOut {
    pub attr_valid: u64,
    pub attr_valid_nsec: u32,
    pub attr: Attr,
}

pub const ATTR_OUT_SIZE: usize = 16 + ATTR_SIZE;

impl AttrOut {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ATTR_OUT_SIZE);
        buf.extend_from_slice(&self.attr_valid.to_le_bytes());
        buf.extend_from_slice(&self.attr_valid_nsec.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        self.attr.encode_into(&mut buf);
        buf
    }

    #[allow(dead_code)] // decode side, exercised by the tests
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ATTR_OUT_SIZE {
            return None;
        }
        Some(Self {
            attr_valid: read_u64(data, 0),
            attr_valid_nsec: read_u32(data, 8),
            attr: Attr::parse(&data[16..])?,
        })
    }
}

/// fuse_forget_in.
#[derive(Clone, Copy, Debug)]
pub struct ForgetIn {
    pub nlookup: u64,
}

impl ForgetIn {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        Some(Self {
            nlookup: read_u64(data, 0),
        })
    }
}

/// fuse_getattr_in.
#[derive(Clone, Copy, Debug)]
pub struct GetattrIn {
    pub getattr_flags: u32,
    pub fh: u64,
}

impl GetattrIn {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 16 {
            return None;
        }
        Some(Self {
            getattr_flags: read_u32(data, 0),
            fh: read_u64(data, 8),
        })
    }
}

/// fuse_setattr_in, 88 bytes. Only `valid` and `size` matter here; the
/// ownership and mode fields are parsed so callers can log what was
/// ignored.
#[derive(Clone, Copy, Debug)]
pub struct SetattrIn {
    pub valid: u32,
    pub fh: u64,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

pub const SETATTR_IN_SIZE: usize = 88;

impl SetattrIn {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < SETATTR_IN_SIZE {
            return None;
        }
        Some(Self {
            valid: read_u32(data, 0),
            fh: read_u64(data, 8),
            size: read_u64(data, 16),
            mode: read_u32(data, 68),
            uid: read_u32(data, 76),
            gid: read_u32(data, 80),
        })
    }
}

/// fuse_mknod_in (7.12 form with umask), 16 bytes + name.
#[derive(Clone, Copy, Debug)]
pub struct MknodIn {
    pub mode: u32,
    pub rdev: u32,
}

pub const MKNOD_IN_SIZE: usize = 16;

impl MknodIn {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < MKNOD_IN_SIZE {
            return None;
        }
        Some(Self {
            mode: read_u32(data, 0),
            rdev: read_u32(data, 4),
        })
    }
}

/// fuse_mkdir_in, 8 bytes + name.
#[derive(Clone, Copy, Debug)]
pub struct MkdirIn {
    pub mode: u32,
}

pub const MKDIR_IN_SIZE: usize = 8;

impl MkdirIn {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < MKDIR_IN_SIZE {
            return None;
        }
        Some(Self {
            mode: read_u32(data, 0),
        })
    }
}

/// fuse_rename_in, 8 bytes + two names.
#[derive(Clone, Copy, Debug)]
pub struct RenameIn {
    pub newdir: u64,
}

pub const RENAME_IN_SIZE: usize = 8;

impl RenameIn {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < RENAME_IN_SIZE {
            return None;
        }
        Some(Self {
            newdir: read_u64(data, 0),
        })
    }
}

/// fuse_open_in.
#[derive(Clone, Copy, Debug)]
pub struct OpenIn {
    pub flags: u32,
}

impl OpenIn {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        Some(Self {
            flags: read_u32(data, 0),
        })
    }
}

/// fuse_open_out, 16 bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOut {
    pub fh: u64,
    pub open_flags: u32,
}

impl OpenOut {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.fh.to_le_bytes());
        buf.extend_from_slice(&self.open_flags.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf
    }

    #[allow(dead_code)] // decode side, exercised by the tests
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 16 {
            return None;
        }
        Some(Self {
            fh: read_u64(data, 0),
            open_flags: read_u32(data, 8),
        })
    }
}

/// fuse_read_in (7.9+ form), 40 bytes.
#[derive(Clone, Copy, Debug)]
pub struct ReadIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
}

pub const READ_IN_SIZE: usize = 40;

impl ReadIn {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < READ_IN_SIZE {
            return None;
        }
        Some(Self {
            fh: read_u64(data, 0),
            offset: read_u64(data, 8),
            size: read_u32(data, 16),
        })
    }
}

/// fuse_write_in (7.9+ form), 40 bytes + data.
#[derive(Clone, Copy, Debug)]
pub struct WriteIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
}

pub const WRITE_IN_SIZE: usize = 40;

impl WriteIn {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < WRITE_IN_SIZE {
            return None;
        }
        Some(Self {
            fh: read_u64(data, 0),
            offset: read_u64(data, 8),
            size: read_u32(data, 16),
        })
    }
}

/// fuse_write_out, 8 bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOut {
    pub size: u32,
}

impl WriteOut {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf
    }

    #[allow(dead_code)] // decode side, exercised by the tests
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        Some(Self {
            size: read_u32(data, 0),
        })
    }
}

/// fuse_release_in.
#[derive(Clone, Copy, Debug)]
pub struct ReleaseIn {
    pub fh: u64,
}

impl ReleaseIn {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        Some(Self {
            fh: read_u64(data, 0),
        })
    }
}

/// fuse_init_in.
#[derive(Clone, Copy, Debug)]
pub struct InitIn {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

impl InitIn {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 16 {
            return None;
        }
        Some(Self {
            major: read_u32(data, 0),
            minor: read_u32(data, 4),
            max_readahead: read_u32(data, 8),
            flags: read_u32(data, 12),
        })
    }
}

/// fuse_init_out (pre-7.23 form), 24 bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct InitOut {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
}

impl InitOut {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        buf.extend_from_slice(&self.major.to_le_bytes());
        buf.extend_from_slice(&self.minor.to_le_bytes());
        buf.extend_from_slice(&self.max_readahead.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.max_background.to_le_bytes());
        buf.extend_from_slice(&self.congestion_threshold.to_le_bytes());
        buf.extend_from_slice(&self.max_write.to_le_bytes());
        buf
    }
}

/// fuse_statfs_out (fuse_kstatfs), 80 bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatfsOut {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

impl StatfsOut {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(80);
        buf.extend_from_slice(&self.blocks.to_le_bytes());
        buf.extend_from_slice(&self.bfree.to_le_bytes());
        buf.extend_from_slice(&self.bavail.to_le_bytes());
        buf.extend_from_slice(&self.files.to_le_bytes());
        buf.extend_from_slice(&self.ffree.to_le_bytes());
        buf.extend_from_slice(&self.bsize.to_le_bytes());
        buf.extend_from_slice(&self.namelen.to_le_bytes());
        buf.extend_from_slice(&self.frsize.to_le_bytes());
        buf.resize(80, 0);
        buf
    }
}

const DIRENT_HEADER_SIZE: usize = 24;

fn dirent_align(len: usize) -> usize {
    (len + 7) & !7
}

/// Encode one fuse_dirent: header, name bytes, zero padding up to the
/// next 8-byte boundary.
pub fn encode_dirent(ino: u64, off: u64, kind: u32, name: &[u8]) -> Vec<u8> {
    let record_len = dirent_align(DIRENT_HEADER_SIZE + name.len());
    let mut buf = Vec::with_capacity(record_len);
    buf.extend_from_slice(&ino.to_le_bytes());
    buf.extend_from_slice(&off.to_le_bytes());
    buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
    buf.extend_from_slice(&kind.to_le_bytes());
    buf.extend_from_slice(name);
    buf.resize(record_len, 0);
    buf
}

/// Bytes of a NUL-terminated payload name, without the terminator.
pub fn parse_name(data: &[u8]) -> Option<&[u8]> {
    let nul = data.iter().position(|&b| b == 0)?;
    Some(&data[..nul])
}

/// The two consecutive NUL-terminated names of a rename payload.
pub fn parse_name_pair(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let first = parse_name(data)?;
    let rest = &data[first.len() + 1..];
    let second = parse_name(rest)?;
    Some((first, second))
}

/// Header-only reply carrying zero or a negative errno.
pub fn reply_status(fd: BorrowedFd<'_>, unique: u64, error: i32) -> nix::Result<()> {
    let hdr = OutHeader {
        len: OUT_HEADER_SIZE as u32,
        error,
        unique,
    };
    nix::unistd::write(fd, &hdr.encode())?;
    Ok(())
}

/// Header plus payload written as one frame via a vectored write.
pub fn reply_payload(fd: BorrowedFd<'_>, unique: u64, body: &[u8]) -> nix::Result<()> {
    let hdr = OutHeader {
        len: (OUT_HEADER_SIZE + body.len()) as u32,
        error: 0,
        unique,
    };
    let encoded = hdr.encode();
    let iov = [IoSlice::new(&encoded), IoSlice::new(body)];
    writev(fd, &iov)?;
    Ok(())
}

/// Best-effort status reply; a failed write is logged, never retried.
pub fn send_status(fd: BorrowedFd<'_>, unique: u64, error: i32) {
    if let Err(err) = reply_status(fd, unique, error) {
        error!("status reply for request {unique:#x} failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_header_parses_all_fields() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&48u32.to_le_bytes());
        frame.extend_from_slice(&(Opcode::Lookup as u32).to_le_bytes());
        frame.extend_from_slice(&0xdead_beefu64.to_le_bytes());
        frame.extend_from_slice(&FUSE_ROOT_ID.to_le_bytes());
        frame.extend_from_slice(&1000u32.to_le_bytes());
        frame.extend_from_slice(&1001u32.to_le_bytes());
        frame.extend_from_slice(&4242u32.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());

        let hdr = InHeader::parse(&frame).expect("parse header");
        assert_eq!(hdr.len, 48);
        assert_eq!(hdr.opcode, Opcode::Lookup as u32);
        assert_eq!(hdr.unique, 0xdead_beef);
        assert_eq!(hdr.nodeid, FUSE_ROOT_ID);
        assert_eq!(hdr.uid, 1000);
        assert_eq!(hdr.pid, 4242);
    }

    #[test]
    fn short_header_is_rejected() {
        assert!(InHeader::parse(&[0u8; IN_HEADER_SIZE - 1]).is_none());
    }

    #[test]
    fn entry_out_round_trips() {
        let out = EntryOut {
            nodeid: 42,
            generation: 7,
            entry_valid: 10,
            attr_valid: 10,
            entry_valid_nsec: 0,
            attr_valid_nsec: 0,
            attr: Attr {
                ino: 42,
                size: 512,
                mode: libc::S_IFREG | 0o664,
                nlink: 1,
                gid: 1015,
                ..Attr::default()
            },
        };
        let bytes = out.encode();
        assert_eq!(bytes.len(), ENTRY_OUT_SIZE);
        let back = EntryOut::parse(&bytes).expect("parse entry");
        assert_eq!(back.nodeid, 42);
        assert_eq!(back.generation, 7);
        assert_eq!(back.attr.size, 512);
        assert_eq!(back.attr.mode, libc::S_IFREG | 0o664);
        assert_eq!(back.attr.gid, 1015);
    }

    #[test]
    fn dirents_are_8_byte_aligned() {
        for name_len in 1..=16usize {
            let name = vec![b'a'; name_len];
            let record = encode_dirent(FUSE_UNKNOWN_INO, 0, libc::DT_REG as u32, &name);
            assert_eq!(record.len() % 8, 0, "name_len {name_len}");
            assert!(record.len() >= DIRENT_HEADER_SIZE + name_len);
            assert_eq!(&record[..8], &FUSE_UNKNOWN_INO.to_le_bytes());
            assert_eq!(
                u32::from_le_bytes(record[16..20].try_into().unwrap()),
                name_len as u32
            );
        }
    }

    #[test]
    fn name_parsing_requires_terminator() {
        assert_eq!(parse_name(b"foo\0"), Some(&b"foo"[..]));
        assert_eq!(parse_name(b"foo"), None);
        assert_eq!(
            parse_name_pair(b"old\0new\0"),
            Some((&b"old"[..], &b"new"[..]))
        );
        assert_eq!(parse_name_pair(b"old\0new"), None);
    }

    #[test]
    fn setattr_reads_ignored_ownership_fields() {
        let mut data = vec![0u8; SETATTR_IN_SIZE];
        data[0..4].copy_from_slice(&(FATTR_UID | FATTR_GID).to_le_bytes());
        data[76..80].copy_from_slice(&1234u32.to_le_bytes());
        data[80..84].copy_from_slice(&5678u32.to_le_bytes());
        let req = SetattrIn::parse(&data).expect("parse setattr");
        assert_eq!(req.valid, FATTR_UID | FATTR_GID);
        assert_eq!(req.uid, 1234);
        assert_eq!(req.gid, 5678);
    }
}
