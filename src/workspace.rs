//! Staging workspace
//!
//! Every run builds its output inside a temporary directory that sits next
//! to the requested output path. The directory is removed when the
//! `Workspace` is dropped, unless it was promoted.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::inspect::AddonSource;
use crate::pipeline::BuildError;

pub const PAYLOAD_DIR: &str = "payload";
pub const BUNDLE_MANIFEST_FILE: &str = "bundle-manifest.json";

pub struct Workspace {
    staging: TempDir,
}

impl Workspace {
    /// Create a staging directory in the parent of `output_dir`.
    pub fn create(output_dir: &Path) -> Result<Self, BuildError> {
        let parent = parent_of(output_dir);
        fs::create_dir_all(&parent).map_err(|e| BuildError::io(&parent, e))?;

        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}-staging-", stem_of(output_dir)))
            .tempdir_in(&parent)
            .map_err(|e| BuildError::io(&parent, e))?;
        tracing::debug!(staging = %staging.path().display(), "created staging directory");
        Ok(Self { staging })
    }

    pub fn root(&self) -> &Path {
        self.staging.path()
    }

    pub fn payload(&self) -> PathBuf {
        self.root().join(PAYLOAD_DIR)
    }

    pub fn write_file(&self, name: &str, content: &[u8]) -> Result<PathBuf, BuildError> {
        let path = self.root().join(name);
        fs::write(&path, content).map_err(|e| BuildError::io(&path, e))?;
        Ok(path)
    }

    /// Move the staged tree to `output_dir`, replacing what was there.
    ///
    /// A previous output is moved aside first and put back if the swap
    /// fails. It is deleted only once the new tree is in place.
    pub fn promote(self, output_dir: &Path) -> Result<(), BuildError> {
        let previous = match output_dir.symlink_metadata() {
            Ok(_) => {
                let parent = parent_of(output_dir);
                let holder = tempfile::Builder::new()
                    .prefix(&format!(".{}-previous-", stem_of(output_dir)))
                    .tempdir_in(&parent)
                    .map_err(|e| BuildError::io(&parent, e))?;
                let aside = holder.path().join("previous");
                fs::rename(output_dir, &aside).map_err(|e| BuildError::io(output_dir, e))?;
                Some((holder, aside))
            }
            Err(_) => None,
        };

        let staged = self.staging.keep();
        if let Err(e) = fs::rename(&staged, output_dir) {
            let _ = fs::remove_dir_all(&staged);
            if let Some((holder, aside)) = previous {
                if let Err(restore) = fs::rename(&aside, output_dir) {
                    let kept = holder.keep();
                    tracing::error!(
                        previous = %kept.join("previous").display(),
                        error = %restore,
                        "could not restore previous output"
                    );
                }
            }
            return Err(BuildError::io(output_dir, e));
        }
        tracing::info!(output = %output_dir.display(), "output tree written");
        Ok(())
    }
}

fn parent_of(output_dir: &Path) -> PathBuf {
    match output_dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn stem_of(output_dir: &Path) -> &str {
    output_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("bundle")
}

/// Absolute form of a path that may not exist yet.
fn resolve(path: &Path) -> Result<PathBuf, BuildError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| BuildError::io(path, e))?
            .join(path)
    };

    let mut existing = absolute.as_path();
    let mut rest = vec![];
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return Ok(rest.iter().rev().fold(canonical, |acc, part| acc.join(part)));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(absolute.clone()),
        }
    }
}

/// Refuse output paths that would destroy inputs or unrelated data.
///
/// The output may not overlap any input tree, and an existing output must
/// be empty or a previous bundle (it holds `bundle-manifest.json`).
pub fn check_output_dir(output_dir: &Path, inputs: &[&Path]) -> Result<(), BuildError> {
    let output = resolve(output_dir)?;
    for input in inputs {
        let input = resolve(input)?;
        if output.starts_with(&input) || input.starts_with(&output) {
            return Err(BuildError::InvalidOutput(format!(
                "'{}' overlaps input '{}'",
                output_dir.display(),
                input.display()
            )));
        }
    }

    let Ok(metadata) = output_dir.symlink_metadata() else {
        return Ok(());
    };
    if !metadata.is_dir() {
        return Err(BuildError::InvalidOutput(format!(
            "'{}' exists and is not a directory",
            output_dir.display()
        )));
    }
    if output_dir.join(BUNDLE_MANIFEST_FILE).is_file() {
        return Ok(());
    }
    let mut entries = fs::read_dir(output_dir).map_err(|e| BuildError::io(output_dir, e))?;
    if entries.next().is_some() {
        return Err(BuildError::InvalidOutput(format!(
            "'{}' is not empty and holds no {}",
            output_dir.display(),
            BUNDLE_MANIFEST_FILE
        )));
    }
    Ok(())
}

/// Copy a directory tree. Symlinks are recreated, not followed.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<Vec<PathBuf>, BuildError> {
    let mut copied = vec![];
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| BuildError::Io {
            context: format!("walking '{}'", src.display()),
            source: e.into(),
        })?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| BuildError::io(&target, e))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
            copied.push(relative.to_path_buf());
        } else {
            copy_file(entry.path(), &target)?;
            copied.push(relative.to_path_buf());
        }
    }
    Ok(copied)
}

fn copy_file(src: &Path, dest: &Path) -> Result<(), BuildError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    }
    if dest.is_symlink() {
        fs::remove_file(dest).map_err(|e| BuildError::io(dest, e))?;
    }
    fs::copy(src, dest)
        .map_err(|e| BuildError::Io {
            context: format!("copying '{}' to '{}'", src.display(), dest.display()),
            source: e,
        })?;
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dest: &Path) -> Result<(), BuildError> {
    let target = fs::read_link(src).map_err(|e| BuildError::io(src, e))?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    }
    if dest.symlink_metadata().is_ok() {
        fs::remove_file(dest).map_err(|e| BuildError::io(dest, e))?;
    }
    std::os::unix::fs::symlink(&target, dest).map_err(|e| BuildError::io(dest, e))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dest: &Path) -> Result<(), BuildError> {
    copy_file(src, dest)
}

/// Which add-on (by index) last wrote each merged path.
pub type MergeReport = BTreeMap<PathBuf, usize>;

/// Merge add-ons over `base` in order. Later add-ons overwrite earlier ones.
pub fn merge_addons(base: &Path, addons: &[AddonSource]) -> Result<MergeReport, BuildError> {
    let mut report = MergeReport::new();

    for (index, addon) in addons.iter().enumerate() {
        let destination = base.join(addon.resolved_destination());
        let written: Vec<PathBuf> = if addon.source.is_dir() {
            copy_tree(&addon.source, &destination)?
                .into_iter()
                .map(|rel| destination.join(rel))
                .collect()
        } else {
            let target = file_target(addon, &destination)?;
            copy_file(&addon.source, &target)?;
            vec![target]
        };

        for path in written {
            let relative = path.strip_prefix(base).unwrap_or(&path).to_path_buf();
            if let Some(previous) = report.insert(relative.clone(), index) {
                tracing::debug!(
                    path = %relative.display(),
                    previous,
                    current = index,
                    "add-on overrides earlier add-on"
                );
            }
        }
        tracing::info!(addon = %addon.source.display(), index, "merged add-on");
    }

    Ok(report)
}

/// Where a single-file add-on lands, following `mv` semantics: a
/// destination that is a directory (or ends in `/`) receives the file under
/// its own name, anything else is the new file path.
fn file_target(addon: &AddonSource, destination: &Path) -> Result<PathBuf, BuildError> {
    let into_directory = match &addon.destination {
        None => true,
        Some(dest) => {
            let raw = dest.as_os_str().to_string_lossy();
            raw.is_empty()
                || raw.ends_with('/')
                || raw.ends_with(std::path::MAIN_SEPARATOR)
                || destination.is_dir()
        }
    };
    if !into_directory {
        return Ok(destination.to_path_buf());
    }
    let file_name = addon.source.file_name().ok_or_else(|| {
        BuildError::InvalidAddon(format!("'{}' has no file name", addon.source.display()))
    })?;
    Ok(destination.join(file_name))
}

/// Remove platform-specific files and directories (paths relative to `base`).
pub fn strip_paths<'a>(
    base: &Path,
    paths: impl IntoIterator<Item = &'a PathBuf>,
) -> Result<usize, BuildError> {
    let mut removed = 0;
    for relative in paths {
        let path = base.join(relative);
        let Ok(metadata) = path.symlink_metadata() else {
            continue;
        };
        let result = if metadata.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|e| BuildError::io(&path, e))?;
        tracing::debug!(path = %relative.display(), "stripped platform-specific path");
        removed += 1;
    }
    Ok(removed)
}
