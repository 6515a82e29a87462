//! Source Patcher - data-home redirection and recompilation
//!
//! Ren'Py's launcher module resolves the save directory from the literal
//! `"~/.renpy/"`. Inside the sandbox that path is not writable, so the
//! literal is replaced with an expression that reads `XDG_DATA_HOME`
//! (pointed at the app's private data directory by the sandbox) and falls
//! back to the original value elsewhere.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::pipeline::BuildError;

pub const STORAGE_ANCHOR: &str = r#""~/.renpy/""#;
pub const STORAGE_REPLACEMENT: &str = r#"(os.environ.get("XDG_DATA_HOME", "~/.renpy") + "/")"#;

/// Arguments passed to the launcher to regenerate `.rpyc` files.
pub const COMPILE_ARGS: [&str; 3] = [".", "compile", "--keep-orphan-rpyc"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PatchOutcome {
    /// Files rewritten, relative to the base directory.
    Applied { files: Vec<PathBuf> },
    /// Redirection already present; nothing touched.
    AlreadyPatched { files: Vec<PathBuf> },
}

impl PatchOutcome {
    pub fn was_applied(&self) -> bool {
        matches!(self, PatchOutcome::Applied { .. })
    }
}

/// Top-level Python modules of the base directory, sorted by name.
fn launcher_modules(base: &Path) -> Result<Vec<PathBuf>, BuildError> {
    let mut modules = vec![];
    for entry in fs::read_dir(base).map_err(|e| BuildError::io(base, e))? {
        let path = entry.map_err(|e| BuildError::io(base, e))?.path();
        if path.is_file() && path.extension().map_or(false, |e| e == "py") {
            modules.push(path);
        }
    }
    modules.sort();
    Ok(modules)
}

fn imports_os(source: &str) -> bool {
    source.lines().any(|line| {
        let line = line.trim();
        line.starts_with("import ")
            && line
                .split([',', ' '])
                .any(|part| part == "os" || part.starts_with("os."))
    })
}

/// Redirect the save directory of every launcher module in `base`.
///
/// Fails with `PatchTargetNotFound` when no module carries the anchor and
/// none is already redirected, or when a module carries the anchor but
/// does not import `os` (the redirection could not run there).
pub fn apply_storage_patch(base: &Path) -> Result<PatchOutcome, BuildError> {
    let modules = launcher_modules(base)?;
    let mut pending: Vec<(PathBuf, String)> = vec![];
    let mut already: Vec<PathBuf> = vec![];
    let mut unpatchable: Vec<PathBuf> = vec![];

    for path in &modules {
        let source = fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
        let relative = path.strip_prefix(base).unwrap_or(path).to_path_buf();

        if source.contains(STORAGE_ANCHOR) {
            if imports_os(&source) {
                pending.push((relative, source.replace(STORAGE_ANCHOR, STORAGE_REPLACEMENT)));
            } else {
                unpatchable.push(path.clone());
            }
        } else if source.contains(STORAGE_REPLACEMENT) {
            already.push(relative);
        }
    }

    if !unpatchable.is_empty() {
        return Err(BuildError::PatchTargetNotFound {
            anchor: STORAGE_ANCHOR.to_string(),
            searched: unpatchable,
        });
    }

    if pending.is_empty() {
        if already.is_empty() {
            return Err(BuildError::PatchTargetNotFound {
                anchor: STORAGE_ANCHOR.to_string(),
                searched: modules,
            });
        }
        tracing::info!(modules = already.len(), "storage path already redirected");
        return Ok(PatchOutcome::AlreadyPatched { files: already });
    }

    // All anchors are located before anything is written.
    let mut files = Vec::with_capacity(pending.len());
    for (relative, patched) in pending {
        let path = base.join(&relative);
        fs::write(&path, patched).map_err(|e| BuildError::io(&path, e))?;
        tracing::info!(module = %relative.display(), "redirected save directory to XDG_DATA_HOME");
        files.push(relative);
    }
    Ok(PatchOutcome::Applied { files })
}

/// Recompile only when the source changed.
pub fn needs_recompile(patch: &PatchOutcome, addons_merged: usize) -> bool {
    patch.was_applied() || addons_merged > 0
}

/// Regenerates the engine's bytecode for a source tree.
pub trait EngineCompiler {
    fn compile(&self, base: &Path, launcher: &str) -> Result<(), BuildError>;
}

/// Runs the game's own launcher in compile mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct LauncherCompiler;

impl EngineCompiler for LauncherCompiler {
    fn compile(&self, base: &Path, launcher: &str) -> Result<(), BuildError> {
        tracing::info!(launcher, base = %base.display(), "recompiling game scripts");
        let output = Command::new("sh")
            .arg(launcher)
            .args(COMPILE_ARGS)
            .current_dir(base)
            .env("RENPY_PERFORMANCE_TEST", "0")
            .output()
            .map_err(|e| BuildError::Compile {
                launcher: launcher.to_string(),
                status: None,
                stderr: format!("failed to start compiler: {}", e),
            })?;

        if output.status.success() {
            return Ok(());
        }
        Err(BuildError::Compile {
            launcher: launcher.to_string(),
            status: output.status.code(),
            stderr: tail(&String::from_utf8_lossy(&output.stderr), 40),
        })
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
