use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::io::{self, Read};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Chunk size used when comparing two files byte by byte.
pub const COMPARE_CHUNK: usize = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Path relative to the walk base, '/'-separated.
    pub relative_path: String,
    pub kind: EntryKind,
    pub full_path: PathBuf,
}

/// Render `full` relative to `base` with forward slashes, the form stored in containers.
pub fn relative_path(base: &Path, full: &Path) -> Result<String> {
    let relative = full
        .strip_prefix(base)
        .with_context(|| format!("{} is not inside {}", full.display(), base.display()))?;
    let parts = relative
        .components()
        .map(|c| {
            c.as_os_str()
                .to_str()
                .with_context(|| format!("Non-UTF8 path: {}", relative.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("/"))
}

/// The immediate children of `dir`, split into files and folders, each sorted by name.
pub fn list_dir(dir: &Path) -> Result<(Vec<String>, Vec<String>)> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to read directory {}", dir.display()))?;
        let name = entry
            .file_name()
            .to_str()
            .with_context(|| format!("Non-UTF8 path: {}", entry.path().display()))?
            .to_string();
        if entry.file_type().is_dir() {
            dirs.push(name);
        } else {
            files.push(name);
        }
    }
    Ok((files, dirs))
}

/// Every entry below `dir` in walk order (a folder before its contents, names sorted),
/// with paths relative to `base`.
pub fn walk_tree(base: &Path, dir: &Path) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to read directory entry in {}", dir.display()))?;
        let full_path = entry.path().to_path_buf();
        let kind = if entry.file_type().is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        entries.push(DirEntry {
            relative_path: relative_path(base, &full_path)?,
            kind,
            full_path,
        });
    }
    Ok(entries)
}

/// Read-only contents of a whole file. Empty files cannot be mapped, so they get their
/// own variant.
pub enum FileData {
    Mapped(Mmap),
    Empty,
}

impl Deref for FileData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => map,
            Self::Empty => &[],
        }
    }
}

/// Memory-map a file for read-only access.
///
/// Callers must not truncate or replace the file while the mapping is live.
pub fn map_file(path: &Path) -> Result<FileData> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("Failed to read metadata: {}", path.display()))?
        .len();
    if len == 0 {
        return Ok(FileData::Empty);
    }
    // SAFETY: the mapping is only read from, and the file is not modified while mapped.
    let map = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to memory-map file: {}", path.display()))?;
    Ok(FileData::Mapped(map))
}

/// Whether two files differ in length or content.
///
/// Lengths are compared first; contents are then compared one chunk at a time, and only
/// over the bytes each read actually produced.
pub fn files_differ(a: &Path, b: &Path) -> Result<bool> {
    let open = |p: &Path| File::open(p).with_context(|| format!("Failed to open file: {}", p.display()));
    let mut left = open(a)?;
    let mut right = open(b)?;
    let left_len = left.metadata()?.len();
    let right_len = right.metadata()?.len();
    if left_len != right_len {
        return Ok(true);
    }

    let mut left_buf = vec![0u8; COMPARE_CHUNK];
    let mut right_buf = vec![0u8; COMPARE_CHUNK];
    loop {
        let n = read_full(&mut left, &mut left_buf).with_context(|| format!("Failed to read {}", a.display()))?;
        let m = read_full(&mut right, &mut right_buf).with_context(|| format!("Failed to read {}", b.display()))?;
        if n != m || left_buf[..n] != right_buf[..m] {
            return Ok(true);
        }
        if n == 0 {
            return Ok(false);
        }
    }
}

/// Fill `buf` as far as the reader allows; short only at end of input.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
