use std::io;

#[derive(Debug, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    NameTooLong,
    NoMemory,
    InvalidArgument,
    NotImplemented,
    Os(nix::errno::Errno),
}

impl FsError {
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => FsError::NotFound,
            libc::ENAMETOOLONG => FsError::NameTooLong,
            libc::ENOMEM => FsError::NoMemory,
            libc::EINVAL => FsError::InvalidArgument,
            libc::ENOSYS => FsError::NotImplemented,
            _ => FsError::Os(nix::errno::Errno::from_raw(errno)),
        }
    }

    /// Positive errno value; the reply layer negates it on the wire.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::NoMemory => libc::ENOMEM,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NotImplemented => libc::ENOSYS,
            FsError::Os(errno) => *errno as i32,
        }
    }
}

impl From<nix::Error> for FsError {
    fn from(value: nix::Error) -> Self {
        FsError::from_errno(value as i32)
    }
}

impl From<io::Error> for FsError {
    fn from(value: io::Error) -> Self {
        match value.raw_os_error() {
            Some(errno) => FsError::from_errno(errno),
            None => FsError::Os(nix::errno::Errno::EIO),
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trips_through_variants() {
        for errno in [
            libc::ENOENT,
            libc::ENAMETOOLONG,
            libc::ENOMEM,
            libc::EINVAL,
            libc::ENOSYS,
            libc::EACCES,
            libc::EIO,
        ] {
            assert_eq!(FsError::from_errno(errno).errno(), errno);
        }
    }

    #[test]
    fn nix_errors_map_to_named_variants() {
        assert_eq!(FsError::from(nix::errno::Errno::ENOENT), FsError::NotFound);
        assert_eq!(
            FsError::from(nix::errno::Errno::EACCES),
            FsError::Os(nix::errno::Errno::EACCES)
        );
    }
}
