use anyhow::{bail, Context, Result};
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::binary_patch;
use crate::compress::{self, CompressionKind};
use crate::error::FormatError;
use crate::logger::{NoopLogger, PatchLogger};
use crate::patch_format::{self, BlockInfo, BlockKind, ContainerHeader, PatchInfo, CHECKSUM_OFFSET};
use crate::pipeline::{ErrorList, Progress, ProgressFn, Report, TaskGroup};
use crate::tree_diff::{self, PlannedBlock};
use crate::util;

const COPY_CHUNK: usize = 64 * 1024;

/// Serialized writer for one container.
///
/// Every block is written while holding the lock, so concurrent workers never
/// interleave. The checksum is accumulated over everything after the header.
pub struct ContainerSink<W> {
    state: Mutex<SinkState<W>>,
    header: ContainerHeader,
}

struct SinkState<W> {
    out: W,
    hasher: Md5,
    start: u64,
    position: u64,
    blocks: Vec<BlockInfo>,
}

impl<W: Write + Seek> SinkState<W> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.out.write_all(data)?;
        self.hasher.update(data);
        self.position += data.len() as u64;
        Ok(())
    }
}

impl<W: Write + Seek> ContainerSink<W> {
    /// Write a placeholder header at the current position of `out`.
    pub fn new(mut out: W, compression: CompressionKind) -> Result<Self> {
        let header = ContainerHeader::new(compression);
        let start = out.stream_position()?;
        out.write_all(&header.to_bytes()).context("Failed to write container header")?;
        Ok(Self {
            state: Mutex::new(SinkState {
                out,
                hasher: Md5::new(),
                start,
                position: start + patch_format::HEADER_LEN,
                blocks: Vec::new(),
            }),
            header,
        })
    }

    pub fn compression(&self) -> CompressionKind {
        self.header.compression
    }

    fn lock(&self) -> MutexGuard<'_, SinkState<W>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write a block without payload.
    pub fn write_block(&self, kind: BlockKind, path: &str, logger: &dyn PatchLogger) -> Result<()> {
        debug_assert!(!kind.has_payload());
        let head = patch_format::encode_block_head(kind, path, None)?;
        let mut state = self.lock();
        logger.log(&format!("{} | {kind} | {path}", state.position));
        state
            .write(&head)
            .with_context(|| format!("Failed to write {kind} block for {path}"))?;
        state.blocks.push(BlockInfo { kind, path: path.to_string(), data_size: 0 });
        Ok(())
    }

    /// Write a block whose payload is the next `len` bytes of `payload`.
    pub fn write_payload_block<R: Read + ?Sized>(
        &self,
        kind: BlockKind,
        path: &str,
        payload: &mut R,
        len: u64,
        logger: &dyn PatchLogger,
    ) -> Result<()> {
        debug_assert!(kind.has_payload());
        let head = patch_format::encode_block_head(kind, path, Some(len))?;
        let mut buf = vec![0u8; COPY_CHUNK];

        let mut state = self.lock();
        logger.log(&format!("{} | {kind} | {path}", state.position));
        state
            .write(&head)
            .with_context(|| format!("Failed to write {kind} block for {path}"))?;
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(COPY_CHUNK as u64) as usize;
            let n = payload.read(&mut buf[..want])?;
            if n == 0 {
                return Err(FormatError::Truncated { expected: len, actual: len - remaining })
                    .with_context(|| format!("Payload for {path} ended early"));
            }
            state.write(&buf[..n])?;
            remaining -= n as u64;
        }
        state.blocks.push(BlockInfo { kind, path: path.to_string(), data_size: len });
        Ok(())
    }

    /// Patch the checksum and block count into the header and flush.
    pub fn finish(&self) -> Result<PatchInfo> {
        let mut state = self.lock();
        let mut header = self.header;
        header.checksum.copy_from_slice(&state.hasher.clone().finalize());
        header.block_count = u32::try_from(state.blocks.len()).context("Too many blocks for one container")?;

        let bytes = header.to_bytes();
        let start = state.start;
        let end = state.position;
        let out = &mut state.out;
        out.seek(SeekFrom::Start(start + CHECKSUM_OFFSET))?;
        out.write_all(&bytes[CHECKSUM_OFFSET as usize..])?;
        out.seek(SeekFrom::Start(end))?;
        out.flush().context("Failed to flush container")?;

        let mut info = PatchInfo::from_header(&header);
        info.blocks = state.blocks.clone();
        Ok(info)
    }
}

/// Builds a container that turns `old` into `new`.
pub struct PatchWriter {
    old_root: PathBuf,
    new_root: PathBuf,
    compression: CompressionKind,
    logger: Arc<dyn PatchLogger>,
    progress: Progress,
}

impl PatchWriter {
    pub fn new(old_root: impl Into<PathBuf>, new_root: impl Into<PathBuf>, compression: CompressionKind) -> Self {
        let old_root = old_root.into();
        let new_root = new_root.into();
        assert!(!old_root.as_os_str().is_empty(), "old directory must not be empty");
        assert!(!new_root.as_os_str().is_empty(), "new directory must not be empty");
        Self {
            old_root,
            new_root,
            compression,
            logger: Arc::new(NoopLogger),
            progress: Progress::default(),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn PatchLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_progress(mut self, callback: ProgressFn) -> Self {
        self.progress = Progress::new(callback);
        self
    }

    /// Write the container to `output`.
    ///
    /// On failure the header keeps a zero checksum, so the partial file never verifies.
    pub async fn run(&self, output: &Path) -> Report {
        let errors = ErrorList::default();
        let info = match self.build(output, &errors).await {
            Ok(info) => info,
            Err(err) => {
                errors.record(&err);
                None
            }
        };
        if info.is_some() {
            self.logger.log(&format!("Patch written to {}", output.display()));
        }
        Report::new(info, errors.snapshot())
    }

    async fn build(&self, output: &Path, errors: &ErrorList) -> Result<Option<PatchInfo>> {
        for (label, dir) in [("Old", &self.old_root), ("New", &self.new_root)] {
            if !dir.is_dir() {
                bail!("{label} directory does not exist: {}", dir.display());
            }
        }

        self.progress.busy("Comparing directories");
        let (old_root, new_root) = (self.old_root.clone(), self.new_root.clone());
        let plan = tokio::task::spawn_blocking(move || tree_diff::plan(&old_root, &new_root)).await??;
        tracing::debug!(blocks = plan.len(), "directory comparison finished");

        let file = File::create(output)
            .with_context(|| format!("Failed to create output file: {}", output.display()))?;
        let sink = Arc::new(ContainerSink::new(file, self.compression)?);
        self.write_plan(plan, sink, errors).await
    }

    /// Write every planned block into `sink`, joining all workers before returning.
    async fn write_plan<W>(
        &self,
        plan: Vec<PlannedBlock>,
        sink: Arc<ContainerSink<W>>,
        errors: &ErrorList,
    ) -> Result<Option<PatchInfo>>
    where
        W: Write + Seek + Send + 'static,
    {
        let mut group = TaskGroup::new(errors.clone());
        let mut walked = Ok(());

        let total = plan.len() as u64;
        for (done, block) in plan.into_iter().enumerate() {
            if group.is_cancelled() {
                break;
            }
            self.progress.step("Writing blocks", done as u64, total);
            let kind = block.kind();
            match block {
                PlannedBlock::RemoveFile { path }
                | PlannedBlock::RemoveFolder { path }
                | PlannedBlock::CreateFolder { path } => {
                    if let Err(err) = sink.write_block(kind, &path, &*self.logger) {
                        walked = Err(err);
                        break;
                    }
                }
                PlannedBlock::ModifyFile { path, old, new } => {
                    let sink = sink.clone();
                    let logger = self.logger.clone();
                    group.spawn(move |token| {
                        if token.is_cancelled() {
                            return Ok(());
                        }
                        let mut spool = spool_diff(&old, &new, sink.compression())
                            .with_context(|| format!("Failed to diff {path}"))?;
                        if token.is_cancelled() {
                            return Ok(());
                        }
                        write_spooled(&*sink, kind, &path, &mut spool, &*logger)
                    });
                }
                PlannedBlock::CreateFile { path, source } => {
                    let sink = sink.clone();
                    let logger = self.logger.clone();
                    group.spawn(move |token| {
                        if token.is_cancelled() {
                            return Ok(());
                        }
                        let mut spool = spool_compressed(&source, sink.compression())
                            .with_context(|| format!("Failed to compress {path}"))?;
                        if token.is_cancelled() {
                            return Ok(());
                        }
                        write_spooled(&*sink, kind, &path, &mut spool, &*logger)
                    });
                }
            }
        }

        if let Err(err) = walked {
            errors.record(&err);
            group.cancel();
        }
        group.wait().await;
        if !errors.is_empty() {
            return Ok(None);
        }
        self.progress.step("Writing blocks", total, total);
        let info = sink.finish()?;
        tracing::debug!(blocks = info.block_count, checksum = %patch_format::to_hex(&info.checksum), "container finished");
        Ok(Some(info))
    }
}

fn spool_diff(old: &Path, new: &Path, compression: CompressionKind) -> Result<File> {
    let old_data = util::map_file(old)?;
    let new_data = util::map_file(new)?;
    let mut spool = tempfile::tempfile().context("Failed to create temp file")?;
    binary_patch::create_patch(&old_data, &new_data, compression, &mut spool)?;
    Ok(spool)
}

fn spool_compressed(source: &Path, compression: CompressionKind) -> Result<File> {
    let mut input = File::open(source).with_context(|| format!("Failed to open file: {}", source.display()))?;
    let mut spool = tempfile::tempfile().context("Failed to create temp file")?;
    compress::compress_stream(compression, &mut input, &mut spool)?;
    Ok(spool)
}

fn write_spooled<W: Write + Seek>(
    sink: &ContainerSink<W>,
    kind: BlockKind,
    path: &str,
    spool: &mut File,
    logger: &dyn PatchLogger,
) -> Result<()> {
    let len = spool.seek(SeekFrom::End(0))?;
    spool.rewind()?;
    sink.write_payload_block(kind, path, spool, len, logger)
}
