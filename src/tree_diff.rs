//! Paired breadth-first walk of an old and a new tree.

use anyhow::Result;
use rayon::prelude::*;
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use crate::patch_format::BlockKind;
use crate::util::{self, EntryKind};

/// One block the writer has to produce, in container order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedBlock {
    RemoveFile { path: String },
    RemoveFolder { path: String },
    ModifyFile { path: String, old: PathBuf, new: PathBuf },
    CreateFile { path: String, source: PathBuf },
    CreateFolder { path: String },
}

impl PlannedBlock {
    pub fn kind(&self) -> BlockKind {
        match self {
            Self::RemoveFile { .. } => BlockKind::RemoveFile,
            Self::RemoveFolder { .. } => BlockKind::RemoveFolder,
            Self::ModifyFile { .. } => BlockKind::ModifyFile,
            Self::CreateFile { .. } => BlockKind::CreateFile,
            Self::CreateFolder { .. } => BlockKind::CreateFolder,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::RemoveFile { path }
            | Self::RemoveFolder { path }
            | Self::ModifyFile { path, .. }
            | Self::CreateFile { path, .. }
            | Self::CreateFolder { path } => path,
        }
    }
}

fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Compare `old_root` against `new_root` and list the blocks that turn one into the other.
///
/// Each level is emitted as removed files, removed folders, modified files, created
/// files, then created folders with their whole contents. Matched subfolders are
/// compared on a later level.
pub fn plan(old_root: &Path, new_root: &Path) -> Result<Vec<PlannedBlock>> {
    let mut blocks = Vec::new();
    let mut queue = VecDeque::from([String::new()]);

    while let Some(dir) = queue.pop_front() {
        let old_dir = old_root.join(&dir);
        let new_dir = new_root.join(&dir);
        let (old_files, old_dirs) = util::list_dir(&old_dir)?;
        let (new_files, new_dirs) = util::list_dir(&new_dir)?;

        let old_files: BTreeSet<String> = old_files.into_iter().collect();
        let new_files: BTreeSet<String> = new_files.into_iter().collect();
        let old_dirs: BTreeSet<String> = old_dirs.into_iter().collect();
        let new_dirs: BTreeSet<String> = new_dirs.into_iter().collect();

        for name in old_files.difference(&new_files) {
            blocks.push(PlannedBlock::RemoveFile { path: join_rel(&dir, name) });
        }
        for name in old_dirs.difference(&new_dirs) {
            blocks.push(PlannedBlock::RemoveFolder { path: join_rel(&dir, name) });
        }

        let shared: Vec<&String> = old_files.intersection(&new_files).collect();
        let modified = shared
            .par_iter()
            .map(|name| -> Result<Option<PlannedBlock>> {
                let old = old_dir.join(name.as_str());
                let new = new_dir.join(name.as_str());
                if util::files_differ(&old, &new)? {
                    Ok(Some(PlannedBlock::ModifyFile { path: join_rel(&dir, name), old, new }))
                } else {
                    Ok(None)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        blocks.extend(modified.into_iter().flatten());

        for name in new_files.difference(&old_files) {
            blocks.push(PlannedBlock::CreateFile {
                path: join_rel(&dir, name),
                source: new_dir.join(name),
            });
        }

        for name in new_dirs.difference(&old_dirs) {
            let created = new_dir.join(name);
            blocks.push(PlannedBlock::CreateFolder { path: join_rel(&dir, name) });
            for entry in util::walk_tree(new_root, &created)? {
                blocks.push(match entry.kind {
                    EntryKind::Dir => PlannedBlock::CreateFolder { path: entry.relative_path },
                    EntryKind::File => PlannedBlock::CreateFile {
                        path: entry.relative_path,
                        source: entry.full_path,
                    },
                });
            }
        }

        for name in old_dirs.intersection(&new_dirs) {
            queue.push_back(join_rel(&dir, name));
        }
    }

    Ok(blocks)
}
