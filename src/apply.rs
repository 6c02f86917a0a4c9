use anyhow::{bail, Context, Result};
use md5::{Digest, Md5};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWriteExt};

use crate::binary_patch;
use crate::compress::{self, CompressionKind};
use crate::error::FormatError;
use crate::logger::{NoopLogger, PatchLogger};
use crate::patch_format::{self, BlockInfo, BlockKind, ContainerHeader, PatchInfo, HEADER_LEN};
use crate::pipeline::{ErrorList, Progress, ProgressFn, Report, TaskGroup};
use crate::source::{PatchSource, PatchStream};
use crate::util;

const COPY_CHUNK: usize = 64 * 1024;

/// Decodes a container and, given a target directory, replays it.
pub struct PatchReader {
    source: Arc<dyn PatchSource>,
    target: Option<PathBuf>,
    logger: Arc<dyn PatchLogger>,
    progress: Progress,
}

impl PatchReader {
    pub fn new(source: Arc<dyn PatchSource>) -> Self {
        Self {
            source,
            target: None,
            logger: Arc::new(NoopLogger),
            progress: Progress::default(),
        }
    }

    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        let target = target.into();
        assert!(!target.as_os_str().is_empty(), "target directory must not be empty");
        self.target = Some(target);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn PatchLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_progress(mut self, callback: ProgressFn) -> Self {
        self.progress = Progress::new(callback);
        self
    }

    /// Walk the block index without touching any tree.
    pub async fn read(&self) -> Report {
        match self.inspect().await {
            Ok(info) => Report::new(Some(info), Vec::new()),
            Err(err) => {
                let errors = ErrorList::default();
                errors.record(&err);
                Report::new(None, errors.snapshot())
            }
        }
    }

    /// Verify the container and apply every block to the target directory.
    pub async fn run(&self) -> Report {
        let errors = ErrorList::default();
        let info = match &self.target {
            Some(target) => match self.apply(target, &errors).await {
                Ok(info) => Some(info),
                Err(err) => {
                    errors.record(&err);
                    None
                }
            },
            None => {
                errors.push("No target directory set");
                None
            }
        };
        if errors.is_empty() {
            self.logger.log("Patch applied");
        }
        Report::new(info, errors.snapshot())
    }

    async fn acquire(&self) -> Result<(Box<dyn PatchStream>, u64)> {
        let origin = self.source.describe();
        self.logger.log(&format!("Patch source: {origin}"));
        self.progress.busy(format!("Fetching {origin}"));
        let mut stream = self.source.open().await?;
        let total_len = stream.seek(SeekFrom::End(0)).await?;
        stream.seek(SeekFrom::Start(0)).await?;
        self.progress.step(format!("Fetched {origin}"), total_len, total_len);
        Ok((stream, total_len))
    }

    async fn inspect(&self) -> Result<PatchInfo> {
        let (mut stream, total_len) = self.acquire().await?;
        let header = read_header(&mut stream).await?;
        let mut info = PatchInfo::from_header(&header);
        for _ in 0..header.block_count {
            let block = read_block_head(&mut stream).await?;
            if block.data_size > 0 {
                let start = stream.seek(SeekFrom::Current(0)).await?;
                let available = total_len.saturating_sub(start);
                if block.data_size > available {
                    return Err(FormatError::Truncated { expected: block.data_size, actual: available })
                        .with_context(|| format!("Payload for {} is cut short", block.path));
                }
                stream.seek(SeekFrom::Current(block.data_size as i64)).await?;
            }
            info.blocks.push(block);
        }
        Ok(info)
    }

    async fn apply(&self, target: &Path, errors: &ErrorList) -> Result<PatchInfo> {
        if !target.is_dir() {
            bail!("Target directory does not exist: {}", target.display());
        }
        let (mut stream, total_len) = self.acquire().await?;
        let header = read_header(&mut stream).await?;
        header.check_version()?;
        self.verify(&mut stream, &header, total_len).await?;

        let mut info = PatchInfo::from_header(&header);
        let mut group = TaskGroup::without_cancellation(errors.clone());
        let count = u64::from(header.block_count);
        // Workers already started are joined even when the block walk fails.
        let walked: Result<()> = async {
            for done in 0..count {
                let block = read_block_head(&mut stream).await?;
                self.progress.step(format!("Applying {}", block.path), done, count);
                self.logger.log(&format!("{} | {}", block.kind, block.path));

                let dest = target.join(patch_format::native_relative_path(&block.path)?);
                match block.kind {
                    BlockKind::RemoveFile | BlockKind::RemoveFolder | BlockKind::CreateFolder => {
                        if let Err(err) = apply_bare(block.kind, &dest).await {
                            errors.record(&err);
                        }
                    }
                    BlockKind::CreateFile | BlockKind::ModifyFile => {
                        let label = format!("Extracting {}", block.path);
                        let spool = spool_payload(&mut stream, block.data_size, &self.progress, &label).await?;
                        let (kind, compression, path) = (block.kind, header.compression, block.path.clone());
                        group.spawn(move |_| {
                            let result = if kind == BlockKind::ModifyFile {
                                patch_file(&dest, &spool, compression)
                            } else {
                                create_file(&dest, &spool, compression)
                            };
                            result.with_context(|| format!("Failed to apply {kind} for {path}"))
                        });
                    }
                }
                info.blocks.push(block);
            }
            Ok(())
        }
        .await;

        group.wait().await;
        walked?;
        self.progress.step("Done", count, count);
        Ok(info)
    }

    async fn verify<S>(&self, stream: &mut S, header: &ContainerHeader, total_len: u64) -> Result<()>
    where
        S: AsyncRead + AsyncSeek + Unpin + ?Sized,
    {
        let body = total_len.saturating_sub(HEADER_LEN);
        self.progress.step("Verifying", 0, body);
        stream.seek(SeekFrom::Start(HEADER_LEN)).await?;

        let mut hasher = Md5::new();
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut hashed = 0u64;
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            hashed += n as u64;
            self.progress.step("Verifying", hashed, body);
        }

        let mut actual = [0u8; 16];
        actual.copy_from_slice(&hasher.finalize());
        if actual != header.checksum {
            return Err(FormatError::ChecksumMismatch {
                expected: patch_format::to_hex(&header.checksum),
                actual: patch_format::to_hex(&actual),
            }
            .into());
        }
        stream.seek(SeekFrom::Start(HEADER_LEN)).await?;
        Ok(())
    }
}

async fn read_header<S: AsyncRead + Unpin + ?Sized>(stream: &mut S) -> Result<ContainerHeader> {
    let mut bytes = [0u8; HEADER_LEN as usize];
    stream
        .read_exact(&mut bytes)
        .await
        .context("Patch file is too short to hold a header")?;
    Ok(ContainerHeader::parse(&bytes)?)
}

async fn read_block_head<S: AsyncRead + Unpin + ?Sized>(stream: &mut S) -> Result<BlockInfo> {
    let kind = BlockKind::try_from(stream.read_u8().await.context("Block index ended early")?)?;
    let path_len = stream.read_u16_le().await? as usize;
    let mut raw = vec![0u8; path_len];
    stream.read_exact(&mut raw).await?;
    let path = String::from_utf8(raw)
        .map_err(|e| FormatError::InvalidPath(String::from_utf8_lossy(e.as_bytes()).into_owned()))?;
    let data_size = if kind.has_payload() {
        stream.read_u64_le().await?
    } else {
        0
    };
    Ok(BlockInfo { kind, path, data_size })
}

/// Copy the next `len` bytes of the container into a temp file for one worker.
async fn spool_payload<S: AsyncRead + Unpin + ?Sized>(
    stream: &mut S,
    len: u64,
    progress: &Progress,
    label: &str,
) -> Result<NamedTempFile> {
    let spool = NamedTempFile::new().context("Failed to create temp file")?;
    let mut out = tokio::fs::File::from_std(spool.as_file().try_clone()?);
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut copied = 0u64;
    while copied < len {
        let want = (len - copied).min(COPY_CHUNK as u64) as usize;
        let n = stream.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(FormatError::Truncated { expected: len, actual: copied }.into());
        }
        out.write_all(&buf[..n]).await?;
        copied += n as u64;
        progress.step(label, copied, len);
    }
    out.flush().await?;
    Ok(spool)
}

async fn apply_bare(kind: BlockKind, dest: &Path) -> Result<()> {
    if kind == BlockKind::CreateFolder {
        return tokio::fs::create_dir_all(dest)
            .await
            .with_context(|| format!("Failed to create directory: {}", dest.display()));
    }
    let result = if kind == BlockKind::RemoveFolder {
        tokio::fs::remove_dir_all(dest).await
    } else {
        tokio::fs::remove_file(dest).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::from(e))
            .with_context(|| format!("Failed to remove {}", dest.display())),
    }
}

fn output_for(dest: &Path) -> Result<NamedTempFile> {
    let parent = dest
        .parent()
        .with_context(|| format!("No parent directory for {}", dest.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    NamedTempFile::new_in(parent).with_context(|| format!("Failed to create temp file in {}", parent.display()))
}

fn create_file(dest: &Path, spool: &NamedTempFile, compression: CompressionKind) -> Result<()> {
    let mut out = output_for(dest)?;
    let payload = File::open(spool.path())?;
    {
        let mut writer = BufWriter::new(out.as_file_mut());
        compress::decompress_stream(compression, payload, &mut writer)?;
        writer.flush()?;
    }
    out.persist(dest)
        .with_context(|| format!("Failed to write file: {}", dest.display()))?;
    Ok(())
}

fn patch_file(dest: &Path, spool: &NamedTempFile, compression: CompressionKind) -> Result<()> {
    let mut out = output_for(dest)?;
    {
        // Dropped before the rename; some platforms refuse to replace a mapped file.
        let old = util::map_file(dest)?;
        let mut writer = BufWriter::new(out.as_file_mut());
        binary_patch::apply_patch_with(&old, || File::open(spool.path()), compression, &mut writer)?;
        writer.flush()?;
    }
    out.persist(dest)
        .with_context(|| format!("Failed to write patched file: {}", dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch_format::encode_block_head;
    use crate::source::MemorySource;

    fn container(blocks: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = blocks.concat();
        let mut header = ContainerHeader::new(CompressionKind::Gzip);
        header.block_count = blocks.len() as u32;
        header.checksum.copy_from_slice(&Md5::digest(&body));
        [header.to_bytes().to_vec(), body].concat()
    }

    fn reader(bytes: Vec<u8>) -> PatchReader {
        PatchReader::new(Arc::new(MemorySource::new(bytes)))
    }

    #[tokio::test]
    async fn test_read_mode_lists_blocks() {
        let payload = compress::compress_bytes(CompressionKind::Gzip, b"content").unwrap();
        let mut file_block = encode_block_head(BlockKind::CreateFile, "dir/a.txt", Some(payload.len() as u64)).unwrap();
        file_block.extend_from_slice(&payload);
        let bytes = container(&[encode_block_head(BlockKind::CreateFolder, "dir", None).unwrap(), file_block]);

        let report = reader(bytes).read().await;
        assert!(!report.has_error(), "{:?}", report.errors());
        let info = report.info.unwrap();
        assert_eq!(info.block_count, 2);
        assert_eq!(info.blocks[1].path, "dir/a.txt");
        assert_eq!(info.blocks[1].data_size, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_read_mode_detects_truncated_payload() {
        let mut block = encode_block_head(BlockKind::CreateFile, "a", Some(100)).unwrap();
        block.extend_from_slice(&[0u8; 10]);
        let report = reader(container(&[block])).read().await;
        assert!(report.has_error());
        assert!(report.errors()[0].contains("payload truncated"));
    }

    #[tokio::test]
    async fn test_run_rejects_escaping_path() {
        let target = tempfile::TempDir::new().unwrap();
        let bytes = container(&[encode_block_head(BlockKind::CreateFolder, "../outside", None).unwrap()]);
        let report = reader(bytes).with_target(target.path()).run().await;
        assert!(report.has_error());
        assert!(report.errors()[0].contains("invalid block path"));
        assert!(!target.path().parent().unwrap().join("outside").exists());
    }

    #[tokio::test]
    async fn test_run_requires_target() {
        let report = reader(container(&[])).run().await;
        assert_eq!(report.errors(), &["No target directory set".to_string()]);
    }

    #[tokio::test]
    async fn test_bad_magic_is_reported() {
        let mut bytes = container(&[]);
        bytes[0] = b'X';
        let report = reader(bytes).read().await;
        assert!(report.errors()[0].contains("bad magic"));
    }

    #[tokio::test]
    async fn test_remove_missing_file_is_tolerated() {
        let target = tempfile::TempDir::new().unwrap();
        let bytes = container(&[encode_block_head(BlockKind::RemoveFile, "never-existed.txt", None).unwrap()]);
        let report = reader(bytes).with_target(target.path()).run().await;
        assert!(!report.has_error(), "{:?}", report.errors());
        assert_eq!(report.summary().files_deleted, 1);
    }
}
