//! Binary deltas between directory trees.
//!
//! A container bundles one tree changeset: removed and created files and folders, plus a
//! bsdiff patch for every modified file, behind an MD5 over the block stream.

pub mod apply;
pub mod binary_diff;
pub mod binary_patch;
pub mod compress;
pub mod create;
pub mod error;
pub mod logger;
pub mod patch_format;
pub mod pipeline;
pub mod source;
pub mod suffix;
pub mod tree_diff;
pub mod util;

pub use apply::PatchReader;
pub use compress::CompressionKind;
pub use create::PatchWriter;
pub use error::{FormatError, PatchError};
pub use logger::{NoopLogger, PatchLogger, TracingLogger};
pub use patch_format::{BlockInfo, BlockKind, PatchInfo, Summary};
pub use pipeline::{MissionState, ProgressFn, Report};
pub use source::{FileSource, MemorySource, PatchSource};
