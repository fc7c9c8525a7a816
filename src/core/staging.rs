//! Reproducible-run snapshots.
//!
//! Layout produced under the run's log directory:
//!
//! ```text
//! <log_dir>/src-<yy-mm-dd-HH-MM-SS-ffffff>/<support-root-name>/...   full copy
//! <log_dir>/src-<yy-mm-dd-HH-MM-SS-ffffff>/<model-short-name>/data.rs
//! <log_dir>/src-<yy-mm-dd-HH-MM-SS-ffffff>/<model-short-name>/model.rs
//! ```

use crate::utils::error::{HarnessError, Result};
use chrono::{DateTime, Local};
use std::fs::{self, File, FileTimes};
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::{FileOptions, ZipWriter};

pub const SNAPSHOT_PREFIX: &str = "src-";
pub const TIMESTAMP_FORMAT: &str = "%y-%m-%d-%H-%M-%S-%6f";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDirectory {
    pub created_at: DateTime<Local>,
    pub root: PathBuf,
    pub model_dir: PathBuf,
    pub support_dir: PathBuf,
    pub archive: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Staged(SnapshotDirectory),
    /// No log directory configured.
    Skipped,
}

impl StageOutcome {
    pub fn snapshot(&self) -> Option<&SnapshotDirectory> {
        match self {
            StageOutcome::Staged(snapshot) => Some(snapshot),
            StageOutcome::Skipped => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStager {
    support_root: PathBuf,
    archive: bool,
}

impl SnapshotStager {
    pub fn new(support_root: impl Into<PathBuf>) -> Self {
        Self {
            support_root: support_root.into(),
            archive: false,
        }
    }

    pub fn with_archive(mut self, archive: bool) -> Self {
        self.archive = archive;
        self
    }

    pub fn support_root(&self) -> &Path {
        &self.support_root
    }

    pub fn snapshot_name(timestamp: &DateTime<Local>) -> String {
        format!("{}{}", SNAPSHOT_PREFIX, timestamp.format(TIMESTAMP_FORMAT))
    }

    pub fn stage(
        &self,
        log_dir: Option<&Path>,
        model_short_name: &str,
        data_source: &Path,
        model_source: &Path,
    ) -> Result<StageOutcome> {
        self.stage_at(log_dir, model_short_name, data_source, model_source, Local::now())
    }

    /// Stage with an explicit timestamp.
    pub fn stage_at(
        &self,
        log_dir: Option<&Path>,
        model_short_name: &str,
        data_source: &Path,
        model_source: &Path,
        timestamp: DateTime<Local>,
    ) -> Result<StageOutcome> {
        let Some(log_dir) = log_dir else {
            tracing::info!("No log directory configured, skipping source snapshot");
            return Ok(StageOutcome::Skipped);
        };
        if !log_dir.is_dir() {
            return Err(HarnessError::staging(log_dir, "log directory does not exist"));
        }

        let support_name = self
            .support_root
            .file_name()
            .ok_or_else(|| {
                HarnessError::staging(&self.support_root, "support library root has no name")
            })?;
        // 兩者共用快照根目錄，同名時會互相覆蓋
        if support_name == model_short_name {
            return Err(HarnessError::staging(
                &self.support_root,
                format!(
                    "support library and experiment are both named '{}'; rename one of them or pass another --support-dir",
                    model_short_name
                ),
            ));
        }

        let root = log_dir.join(Self::snapshot_name(&timestamp));
        let model_dir = root.join(model_short_name);
        fs::create_dir_all(&model_dir).map_err(|e| HarnessError::staging(&model_dir, e))?;
        let support_dir = root.join(support_name);
        copy_tree_excluding(&self.support_root, &support_dir, &root)?;

        for source in [data_source, model_source] {
            let file_name = source
                .file_name()
                .ok_or_else(|| HarnessError::staging(source, "source path has no file name"))?;
            copy_file_preserving(source, &model_dir.join(file_name))?;
        }

        let archive = if self.archive {
            Some(archive_snapshot(&root)?)
        } else {
            None
        };

        tracing::info!("📦 Sources snapshot staged at {}", root.display());
        Ok(StageOutcome::Staged(SnapshotDirectory {
            created_at: timestamp,
            root,
            model_dir,
            support_dir,
            archive,
        }))
    }
}

/// Recursively copy `src` into the new directory `dst`.
///
/// `dst` must not exist yet; an existing destination is reported as a
/// collision and left untouched. Symlinks are followed.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    copy_tree_excluding(src, dst, dst)
}

/// Like [`copy_tree`], skipping everything under `exclude` (which must be
/// `dst` or one of its ancestors). Keeps a log dir nested inside `src` from
/// copying a snapshot into itself.
pub fn copy_tree_excluding(src: &Path, dst: &Path, exclude: &Path) -> Result<()> {
    let src = src
        .canonicalize()
        .map_err(|e| HarnessError::staging(src, format!("support library unavailable: {}", e)))?;
    if !src.is_dir() {
        return Err(HarnessError::staging(&src, "support library root is not a directory"));
    }

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| HarnessError::staging(parent, e))?;
    }
    match fs::create_dir(dst) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(HarnessError::SnapshotCollisionError {
                path: dst.display().to_string(),
            });
        }
        Err(e) => return Err(HarnessError::staging(dst, e)),
    }
    let excluded = exclude
        .canonicalize()
        .map_err(|e| HarnessError::staging(exclude, e))?;

    let mut directories = vec![(src.clone(), dst.to_path_buf())];
    let walker = WalkDir::new(&src)
        .follow_links(true)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !entry.path().starts_with(&excluded));

    for entry in walker {
        let entry = entry.map_err(|e| HarnessError::staging(&src, e))?;
        let relative = entry
            .path()
            .strip_prefix(&src)
            .map_err(|e| HarnessError::staging(entry.path(), e))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir(&target).map_err(|e| HarnessError::staging(&target, e))?;
            directories.push((entry.path().to_path_buf(), target));
        } else {
            copy_file_preserving(entry.path(), &target)?;
        }
    }

    // 目錄權限最後才套用，避免唯讀目錄擋住內部檔案的複製
    for (from, to) in directories.iter().rev() {
        let permissions = fs::metadata(from)
            .map_err(|e| HarnessError::staging(from, e))?
            .permissions();
        fs::set_permissions(to, permissions).map_err(|e| HarnessError::staging(to, e))?;
    }

    Ok(())
}

/// Copy one file, keeping permissions and access/modify times. Overwrites.
pub fn copy_file_preserving(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst).map_err(|e| {
        HarnessError::staging(dst, format!("copy from {} failed: {}", src.display(), e))
    })?;

    let metadata = fs::metadata(src).map_err(|e| HarnessError::staging(src, e))?;
    let mut times = FileTimes::new();
    if let Ok(accessed) = metadata.accessed() {
        times = times.set_accessed(accessed);
    }
    if let Ok(modified) = metadata.modified() {
        times = times.set_modified(modified);
    }

    // 唯讀檔案無法以寫入模式開啟，改用唯讀 handle 設定時間
    File::options()
        .write(true)
        .open(dst)
        .or_else(|_| File::open(dst))
        .and_then(|file| file.set_times(times))
        .map_err(|e| HarnessError::staging(dst, e))?;

    Ok(())
}

/// Zip a staged snapshot into `<log_dir>/<snapshot-name>.zip`.
pub fn archive_snapshot(root: &Path) -> Result<PathBuf> {
    let archive_path = root.with_extension("zip");
    let file = File::create(&archive_path).map_err(|e| HarnessError::staging(&archive_path, e))?;
    let mut zip = ZipWriter::new(file);

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| HarnessError::staging(root, e))?;
        let name = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| HarnessError::staging(entry.path(), e))?
            .to_string_lossy()
            .replace('\\', "/");

        if entry.file_type().is_dir() {
            zip.add_directory::<_, ()>(name, FileOptions::default())?;
        } else {
            zip.start_file::<_, ()>(name, FileOptions::default())?;
            let data = fs::read(entry.path()).map_err(|e| HarnessError::staging(entry.path(), e))?;
            zip.write_all(&data)
                .map_err(|e| HarnessError::staging(&archive_path, e))?;
        }
    }

    zip.finish()?;
    tracing::debug!("Snapshot archived to {}", archive_path.display());
    Ok(archive_path)
}
