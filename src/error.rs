use std::io;

/// Errors raised while decoding or applying a bsdiff patch.
#[derive(thiserror::Error, Debug)]
pub enum PatchError {
    #[error("corrupt patch: {0}")]
    Corrupt(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by the container codec.
#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    #[error("invalid patch file: bad magic header")]
    BadMagic,
    #[error("patch version too old: {found} (minimum {minimum})")]
    VersionTooLow { found: u8, minimum: u8 },
    #[error("unknown compression kind: {0}")]
    UnknownCompression(u8),
    #[error("unknown block type {0}")]
    UnknownBlock(u8),
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("path is too long for a block record ({0} bytes)")]
    PathTooLong(usize),
    #[error("invalid block path: {0:?}")]
    InvalidPath(String),
    #[error("payload truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
