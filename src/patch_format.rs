//! Container layout.
//!
//! ```text
//! Header (38 bytes):
//!   magic          16
//!   version         1
//!   compression     1
//!   md5            16   over every byte after the header
//!   block_count     4   u32 LE
//!
//! Block:
//!   type            1
//!   path_len        2   u16 LE
//!   path            n   UTF-8, '/'-separated, relative to the tree root
//!   [payload_len]   8   u64 LE, CreateFile / ModifyFile only
//!   [payload]       m   compressed file (CreateFile) or bsdiff patch (ModifyFile)
//! ```

use std::fmt;
use std::path::{Component, Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Serialize, Serializer};

use crate::compress::CompressionKind;
use crate::error::FormatError;

pub const MAGIC: &[u8; 16] = b"NonsensicalPatch";
pub const FORMAT_VERSION: u8 = 1;
pub const MIN_FORMAT_VERSION: u8 = 1;
pub const HEADER_LEN: u64 = 38;
/// Position of the checksum field, relative to the start of the header.
pub const CHECKSUM_OFFSET: u64 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum BlockKind {
    RemoveFile = 0,
    CreateFile = 1,
    ModifyFile = 2,
    RemoveFolder = 3,
    CreateFolder = 4,
}

impl BlockKind {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether the record carries a length-prefixed payload.
    pub fn has_payload(self) -> bool {
        matches!(self, Self::CreateFile | Self::ModifyFile)
    }
}

impl TryFrom<u8> for BlockKind {
    type Error = FormatError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::RemoveFile),
            1 => Ok(Self::CreateFile),
            2 => Ok(Self::ModifyFile),
            3 => Ok(Self::RemoveFolder),
            4 => Ok(Self::CreateFolder),
            other => Err(FormatError::UnknownBlock(other)),
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RemoveFile => "RemoveFile",
            Self::CreateFile => "CreateFile",
            Self::ModifyFile => "ModifyFile",
            Self::RemoveFolder => "RemoveFolder",
            Self::CreateFolder => "CreateFolder",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub version: u8,
    pub compression: CompressionKind,
    pub checksum: [u8; 16],
    pub block_count: u32,
}

impl ContainerHeader {
    /// A header for a container being written; checksum and count are filled in last.
    pub fn new(compression: CompressionKind) -> Self {
        Self {
            version: FORMAT_VERSION,
            compression,
            checksum: [0; 16],
            block_count: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN as usize] {
        let mut out = [0u8; HEADER_LEN as usize];
        out[..16].copy_from_slice(MAGIC);
        out[16] = self.version;
        out[17] = self.compression.as_byte();
        out[18..34].copy_from_slice(&self.checksum);
        out[34..38].copy_from_slice(&self.block_count.to_le_bytes());
        out
    }

    /// Decode a header. Only the magic and compression byte are validated here.
    pub fn parse(bytes: &[u8; HEADER_LEN as usize]) -> Result<Self, FormatError> {
        if &bytes[..16] != MAGIC {
            return Err(FormatError::BadMagic);
        }
        let mut checksum = [0u8; 16];
        checksum.copy_from_slice(&bytes[18..34]);
        Ok(Self {
            version: bytes[16],
            compression: CompressionKind::try_from(bytes[17])?,
            checksum,
            block_count: u32::from_le_bytes([bytes[34], bytes[35], bytes[36], bytes[37]]),
        })
    }

    pub fn check_version(&self) -> Result<(), FormatError> {
        if self.version < MIN_FORMAT_VERSION {
            return Err(FormatError::VersionTooLow {
                found: self.version,
                minimum: MIN_FORMAT_VERSION,
            });
        }
        Ok(())
    }
}

/// Encode the fixed part of a block record: type, path and (if any) payload length.
pub fn encode_block_head(
    kind: BlockKind,
    path: &str,
    payload_len: Option<u64>,
) -> Result<Vec<u8>, FormatError> {
    let path_bytes = path.as_bytes();
    let path_len = u16::try_from(path_bytes.len()).map_err(|_| FormatError::PathTooLong(path_bytes.len()))?;

    let mut head = Vec::with_capacity(1 + 2 + path_bytes.len() + 8);
    head.write_u8(kind.as_byte())?;
    head.write_u16::<LittleEndian>(path_len)?;
    head.extend_from_slice(path_bytes);
    if let Some(len) = payload_len {
        head.write_u64::<LittleEndian>(len)?;
    }
    Ok(head)
}

/// Resolve a stored block path into a native relative path.
///
/// Rejects anything that could land outside the target root.
pub fn native_relative_path(stored: &str) -> Result<PathBuf, FormatError> {
    let invalid = || FormatError::InvalidPath(stored.to_string());
    if stored.is_empty() {
        return Err(invalid());
    }
    let mut out = PathBuf::new();
    for part in stored.split(['/', '\\']) {
        if part.is_empty() || part == "." {
            continue;
        }
        match Path::new(part).components().next() {
            Some(Component::Normal(name)) if Path::new(part).components().count() == 1 => {
                out.push(name);
            }
            _ => return Err(invalid()),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(invalid());
    }
    Ok(out)
}

/// Lowercase hex rendering of a digest.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn serialize_hex<S: Serializer>(bytes: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&to_hex(bytes))
}

/// One decoded block record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub kind: BlockKind,
    pub path: String,
    /// Payload length in bytes; 0 for records without a payload.
    pub data_size: u64,
}

/// Summary of a container, produced without applying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchInfo {
    pub version: u8,
    pub compression: CompressionKind,
    #[serde(serialize_with = "serialize_hex")]
    pub checksum: [u8; 16],
    pub block_count: u32,
    pub blocks: Vec<BlockInfo>,
}

impl PatchInfo {
    pub fn from_header(header: &ContainerHeader) -> Self {
        Self {
            version: header.version,
            compression: header.compression,
            checksum: header.checksum,
            block_count: header.block_count,
            blocks: Vec::new(),
        }
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for block in &self.blocks {
            summary.record(block.kind);
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub dirs_created: usize,
    pub files_added: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    pub dirs_deleted: usize,
}

impl Summary {
    pub fn record(&mut self, kind: BlockKind) {
        match kind {
            BlockKind::RemoveFile => self.files_deleted += 1,
            BlockKind::CreateFile => self.files_added += 1,
            BlockKind::ModifyFile => self.files_modified += 1,
            BlockKind::RemoveFolder => self.dirs_deleted += 1,
            BlockKind::CreateFolder => self.dirs_created += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut header = ContainerHeader::new(CompressionKind::Bzip2);
        header.checksum = [0xAB; 16];
        header.block_count = 0x0102_0304;
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..16], MAGIC);
        assert_eq!(bytes[16], FORMAT_VERSION);
        assert_eq!(bytes[17], 1);
        assert_eq!(&bytes[CHECKSUM_OFFSET as usize..34], &[0xAB; 16]);
        assert_eq!(&bytes[34..], &[4, 3, 2, 1]);
        assert_eq!(ContainerHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_wire_bytes() {
        let bytes = ContainerHeader::new(CompressionKind::Gzip).to_bytes();
        assert_eq!(
            &bytes[..18],
            &[
                0x4e, 0x6f, 0x6e, 0x73, 0x65, 0x6e, 0x73, 0x69, 0x63, 0x61, 0x6c, 0x50, 0x61, 0x74,
                0x63, 0x68, 1, 0,
            ]
        );
        assert_eq!(&bytes[18..], &[0u8; 20]);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = ContainerHeader::new(CompressionKind::Gzip).to_bytes();
        bytes[3] ^= 0xFF;
        assert!(matches!(ContainerHeader::parse(&bytes), Err(FormatError::BadMagic)));
    }

    #[test]
    fn test_version_floor() {
        let mut header = ContainerHeader::new(CompressionKind::Gzip);
        assert!(header.check_version().is_ok());
        header.version = 0;
        assert!(matches!(
            header.check_version(),
            Err(FormatError::VersionTooLow { found: 0, minimum: 1 })
        ));
    }

    #[test]
    fn test_block_head_encoding() {
        let head = encode_block_head(BlockKind::ModifyFile, "a/b.txt", Some(300)).unwrap();
        assert_eq!(head[0], 2);
        assert_eq!(&head[1..3], &[7, 0]);
        assert_eq!(&head[3..10], b"a/b.txt");
        assert_eq!(&head[10..], &300u64.to_le_bytes());

        let bare = encode_block_head(BlockKind::RemoveFolder, "old", None).unwrap();
        assert_eq!(bare, vec![3, 3, 0, b'o', b'l', b'd']);
    }

    #[test]
    fn test_path_too_long() {
        let long = "x".repeat(70_000);
        assert!(matches!(
            encode_block_head(BlockKind::RemoveFile, &long, None),
            Err(FormatError::PathTooLong(70_000))
        ));
    }

    #[test]
    fn test_native_relative_path() {
        assert_eq!(
            native_relative_path("config/settings.json").unwrap(),
            Path::new("config").join("settings.json")
        );
        assert_eq!(native_relative_path("a\\b").unwrap(), Path::new("a").join("b"));
        for bad in ["", "../escape", "a/../../b", "/", "./"] {
            assert!(native_relative_path(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_summary_counts() {
        let mut info = PatchInfo::from_header(&ContainerHeader::new(CompressionKind::Gzip));
        for kind in [
            BlockKind::CreateFolder,
            BlockKind::CreateFile,
            BlockKind::CreateFile,
            BlockKind::RemoveFile,
        ] {
            info.blocks.push(BlockInfo { kind, path: "p".into(), data_size: 0 });
        }
        let summary = info.summary();
        assert_eq!(summary.dirs_created, 1);
        assert_eq!(summary.files_added, 2);
        assert_eq!(summary.files_deleted, 1);
        assert_eq!(summary.files_modified, 0);
    }
}
