//! Build Pipeline - Single Entry Point
//!
//! `BuildPipeline::compile` is the only way to produce an output tree.
//! Stages run in a fixed order inside a staging directory; the output path
//! is only touched once every stage has succeeded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::descriptor::{ProjectDescriptor, SchemaError};
use crate::desktop::{self, RUN_SCRIPT};
use crate::flatpak;
use crate::hashing::sha256_file;
use crate::inspect::{self, AddonSource, InspectOptions, SourceFacts};
use crate::manifest::{
    self, ArtifactKind, AssemblyInput, BuildStep, BundleManifest, GeneratedFile, IconPlacement,
    RuntimeSpec,
};
use crate::metainfo;
use crate::patcher::{self, EngineCompiler, LauncherCompiler};
use crate::workspace::{self, Workspace, PAYLOAD_DIR};

pub use crate::workspace::BUNDLE_MANIFEST_FILE;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Asset not found: {asset} (searched {})", display_paths(.searched))]
    AssetNotFound { asset: String, searched: Vec<PathBuf> },

    #[error("Patch target not found: {anchor} cannot be redirected (searched {})", display_paths(.searched))]
    PatchTargetNotFound { anchor: String, searched: Vec<PathBuf> },

    #[error("Compile error: {launcher} exited with {}: {stderr}", display_status(.status))]
    Compile { launcher: String, status: Option<i32>, stderr: String },

    #[error("Invalid add-on: {0}")]
    InvalidAddon(String),

    #[error("Invalid output directory: {0}")]
    InvalidOutput(String),

    #[error("Inconsistent bundle: {0}")]
    Inconsistent(String),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl BuildError {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        BuildError::Io {
            context: format!("accessing '{}'", path.as_ref().display()),
            source,
        }
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::Schema(_) => "schema",
            BuildError::AssetNotFound { .. } => "asset_not_found",
            BuildError::PatchTargetNotFound { .. } => "patch_target_not_found",
            BuildError::Compile { .. } => "compile",
            BuildError::InvalidAddon(_) => "invalid_addon",
            BuildError::InvalidOutput(_) => "invalid_output",
            BuildError::Inconsistent(_) => "inconsistent",
            BuildError::Io { .. } => "io",
            BuildError::SerializationError(_) => "serialization",
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "no status".to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub source_root: PathBuf,
    #[serde(default)]
    pub addons: Vec<AddonSource>,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub runtime: RuntimeSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOutput {
    pub output_dir: PathBuf,
    pub manifest: BundleManifest,
    pub recompiled: bool,
}

/// The build pipeline - single entry point for bundle generation
pub struct BuildPipeline<C: EngineCompiler = LauncherCompiler> {
    compiler: C,
    options: BuildOptions,
}

impl BuildPipeline<LauncherCompiler> {
    pub fn new(options: BuildOptions) -> Self {
        Self::with_compiler(LauncherCompiler, options)
    }
}

impl Default for BuildPipeline<LauncherCompiler> {
    fn default() -> Self {
        Self::new(BuildOptions::default())
    }
}

impl<C: EngineCompiler> BuildPipeline<C> {
    pub fn with_compiler(compiler: C, options: BuildOptions) -> Self {
        Self { compiler, options }
    }

    pub fn compiler(&self) -> &C {
        &self.compiler
    }

    /// Inspect without building.
    pub fn inspect(
        &self,
        descriptor: &ProjectDescriptor,
        source_root: &Path,
        addons: &[AddonSource],
    ) -> Result<SourceFacts, BuildError> {
        let options = InspectOptions { require_icon: descriptor.install_icon };
        inspect::inspect(source_root, addons, options)
    }

    /// Compile the bundle.
    ///
    /// Order: check output, inspect, stage, strip, merge, patch, recompile,
    /// generate, assemble, promote. Any error drops the staging directory.
    pub fn compile(
        &self,
        descriptor: &ProjectDescriptor,
        request: &BuildRequest,
    ) -> Result<BuildOutput, BuildError> {
        tracing::info!(id = %descriptor.app_id, source = %request.source_root.display(), "starting build");
        let mut inputs = vec![request.source_root.as_path()];
        inputs.extend(request.addons.iter().map(|a| a.source.as_path()));
        workspace::check_output_dir(&request.output_dir, &inputs)?;

        let facts = self.inspect(descriptor, &request.source_root, &request.addons)?;

        let workspace = Workspace::create(&request.output_dir)?;
        let payload = workspace.payload();
        workspace::copy_tree(&facts.base_directory, &payload)?;

        let mut steps = vec![];

        workspace::strip_paths(&payload, &facts.platform_specific_paths)?;
        steps.push(BuildStep::StripPlatformFiles {
            paths: facts.platform_specific_paths.iter().cloned().collect(),
        });

        if !facts.addons.is_empty() {
            let report = workspace::merge_addons(&payload, &facts.addons)?;
            steps.push(BuildStep::MergeAddons {
                sources: facts.addons.iter().map(|a| a.source.clone()).collect(),
                files: report.len(),
            });
        }

        let outcome = patcher::apply_storage_patch(&payload)?;
        let recompile = patcher::needs_recompile(&outcome, facts.addons.len());
        steps.push(BuildStep::ApplyStoragePatch { outcome });

        if recompile {
            self.compiler.compile(&payload, &facts.launcher_script)?;
            steps.push(BuildStep::Recompile { launcher: facts.launcher_script.clone() });
        } else {
            tracing::info!("source unchanged, skipping recompilation");
        }

        let app_id = descriptor.app_id.as_str();
        steps.push(BuildStep::InstallPayload { directory: PAYLOAD_DIR.to_string() });

        let run_script = GeneratedFile {
            file_name: RUN_SCRIPT.to_string(),
            content: desktop::render_run_script(&facts.launcher_script),
        };
        steps.push(BuildStep::InstallRunScript { file: run_script.file_name.clone() });

        let icon = if descriptor.install_icon {
            // Add-ons may have replaced the icon, so it is resolved again.
            let asset = inspect::find_icon(&payload)?;
            let sha256 = sha256_file(&asset.path).map_err(|e| BuildError::io(&asset.path, e))?;
            let placement = IconPlacement::new(app_id, &asset, &payload, sha256);
            fs::copy(&asset.path, workspace.root().join(&placement.file_name))
                .map_err(|e| BuildError::io(&asset.path, e))?;
            steps.push(BuildStep::InstallIcon {
                file: placement.file_name.clone(),
                theme_size: placement.theme_size.clone(),
            });
            Some(placement)
        } else {
            None
        };

        let desktop_entry = GeneratedFile {
            file_name: desktop::file_name(app_id),
            content: desktop::render(descriptor),
        };
        steps.push(BuildStep::InstallDesktopEntry { file: desktop_entry.file_name.clone() });

        let metadata = GeneratedFile {
            file_name: metainfo::file_name(app_id),
            content: metainfo::render(descriptor),
        };
        steps.push(BuildStep::InstallMetadata { file: metadata.file_name.clone() });

        let mut generated_files = BTreeMap::new();
        generated_files.insert(ArtifactKind::RunScript, run_script);
        generated_files.insert(ArtifactKind::DesktopEntry, desktop_entry);
        generated_files.insert(ArtifactKind::Metadata, metadata);

        let manifest = manifest::assemble(AssemblyInput {
            descriptor,
            facts: &facts,
            steps,
            generated_files,
            icon,
            runtime: self.options.runtime.clone(),
        })?;

        for file in manifest.generated_files.values() {
            workspace.write_file(&file.file_name, file.content.as_bytes())?;
        }
        workspace.write_file(&flatpak::file_name(app_id), flatpak::render(&manifest)?.as_bytes())?;
        let mut manifest_json = serde_json::to_string_pretty(&manifest)?;
        manifest_json.push('\n');
        workspace.write_file(BUNDLE_MANIFEST_FILE, manifest_json.as_bytes())?;

        workspace.promote(&request.output_dir)?;

        Ok(BuildOutput {
            output_dir: request.output_dir.clone(),
            manifest,
            recompiled: recompile,
        })
    }
}
