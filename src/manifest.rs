//! Manifest Assembler
//!
//! The bundle manifest is the contract handed to the build toolchain:
//! ordered build steps, a fixed permission set and the generated files.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::descriptor::ProjectDescriptor;
use crate::hashing::compute_manifest_hash;
use crate::inspect::{IconAsset, SourceFacts};
use crate::patcher::PatchOutcome;
use crate::pipeline::BuildError;
use crate::COMPILER_VERSION;

/// Sandbox capabilities. The set is fixed and never derived from input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    Audio,
    Display,
    PrivateData,
}

pub fn sandbox_permissions() -> BTreeSet<Permission> {
    [Permission::Audio, Permission::Display, Permission::PrivateData]
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum BuildStep {
    StripPlatformFiles { paths: Vec<PathBuf> },
    MergeAddons { sources: Vec<PathBuf>, files: usize },
    ApplyStoragePatch { outcome: PatchOutcome },
    Recompile { launcher: String },
    InstallPayload { directory: String },
    InstallRunScript { file: String },
    InstallIcon { file: String, theme_size: String },
    InstallDesktopEntry { file: String },
    InstallMetadata { file: String },
}

impl BuildStep {
    /// Position in the mandatory sequence. Equal ranks may not repeat.
    pub fn rank(&self) -> u8 {
        match self {
            BuildStep::StripPlatformFiles { .. } => 0,
            BuildStep::MergeAddons { .. } => 1,
            BuildStep::ApplyStoragePatch { .. } => 2,
            BuildStep::Recompile { .. } => 3,
            BuildStep::InstallPayload { .. } => 4,
            BuildStep::InstallRunScript { .. } => 5,
            BuildStep::InstallIcon { .. } => 6,
            BuildStep::InstallDesktopEntry { .. } => 7,
            BuildStep::InstallMetadata { .. } => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuildStep::StripPlatformFiles { .. } => "strip_platform_files",
            BuildStep::MergeAddons { .. } => "merge_addons",
            BuildStep::ApplyStoragePatch { .. } => "apply_storage_patch",
            BuildStep::Recompile { .. } => "recompile",
            BuildStep::InstallPayload { .. } => "install_payload",
            BuildStep::InstallRunScript { .. } => "install_run_script",
            BuildStep::InstallIcon { .. } => "install_icon",
            BuildStep::InstallDesktopEntry { .. } => "install_desktop_entry",
            BuildStep::InstallMetadata { .. } => "install_metadata",
        }
    }
}

/// Reject step sequences that mutate source after compiling or installing.
pub fn ensure_step_order(steps: &[BuildStep]) -> Result<(), BuildError> {
    for pair in steps.windows(2) {
        if pair[0].rank() >= pair[1].rank() {
            return Err(BuildError::Inconsistent(format!(
                "'{}' cannot follow '{}'",
                pair[1].name(),
                pair[0].name()
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Metadata,
    DesktopEntry,
    RunScript,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub file_name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub runtime: String,
    pub sdk: String,
    pub version: String,
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        Self {
            runtime: "org.freedesktop.Platform".to_string(),
            sdk: "org.freedesktop.Sdk".to_string(),
            version: "23.08".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IconPlacement {
    /// File name inside the output tree.
    pub file_name: String,
    pub theme_size: String,
    /// `asset.path` is relative to the payload.
    pub asset: IconAsset,
    pub sha256: String,
}

impl IconPlacement {
    pub fn new(app_id: &str, asset: &IconAsset, payload: &Path, sha256: String) -> Self {
        let relative = asset.path.strip_prefix(payload).unwrap_or(&asset.path).to_path_buf();
        Self {
            file_name: format!("{}.{}", app_id, asset.format.extension()),
            theme_size: asset.theme_size(),
            asset: IconAsset { path: relative, ..asset.clone() },
            sha256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub id: String,
    pub name: String,
    pub permissions: BTreeSet<Permission>,
    pub build_steps: Vec<BuildStep>,
    pub generated_files: BTreeMap<ArtifactKind, GeneratedFile>,
    pub runtime: RuntimeSpec,
    pub launcher_script: String,
    pub engine_version: Option<semver::Version>,
    pub icon: Option<IconPlacement>,
    pub compiler_version: String,
    pub fingerprint: String,
}

impl BundleManifest {
    pub fn generated(&self, kind: ArtifactKind) -> Option<&GeneratedFile> {
        self.generated_files.get(&kind)
    }

    /// Recompute the fingerprint over every other field.
    pub fn compute_fingerprint(&self) -> Result<String, BuildError> {
        let unsigned = BundleManifest {
            fingerprint: String::new(),
            ..self.clone()
        };
        Ok(compute_manifest_hash(&unsigned)?)
    }
}

/// Everything the assembler needs from the earlier stages.
pub struct AssemblyInput<'a> {
    pub descriptor: &'a ProjectDescriptor,
    pub facts: &'a SourceFacts,
    pub steps: Vec<BuildStep>,
    pub generated_files: BTreeMap<ArtifactKind, GeneratedFile>,
    pub icon: Option<IconPlacement>,
    pub runtime: RuntimeSpec,
}

pub fn assemble(input: AssemblyInput<'_>) -> Result<BundleManifest, BuildError> {
    ensure_step_order(&input.steps)?;

    let id = input.descriptor.app_id.clone();
    for (kind, file) in &input.generated_files {
        if !file.file_name.starts_with(&id) && *kind != ArtifactKind::RunScript {
            return Err(BuildError::Inconsistent(format!(
                "generated {:?} '{}' does not carry the application id",
                kind, file.file_name
            )));
        }
    }

    if let Some(icon) = &input.icon {
        if !icon.file_name.starts_with(&id) {
            return Err(BuildError::Inconsistent(format!(
                "icon '{}' does not carry the application id",
                icon.file_name
            )));
        }
    }

    let mut manifest = BundleManifest {
        id,
        name: input.descriptor.name.clone(),
        permissions: sandbox_permissions(),
        build_steps: input.steps,
        generated_files: input.generated_files,
        runtime: input.runtime,
        launcher_script: input.facts.launcher_script.clone(),
        engine_version: input.facts.engine_version.clone(),
        icon: input.icon,
        compiler_version: COMPILER_VERSION.to_string(),
        fingerprint: String::new(),
    };
    manifest.fingerprint = manifest.compute_fingerprint()?;

    tracing::info!(
        id = %manifest.id,
        steps = manifest.build_steps.len(),
        fingerprint = %manifest.fingerprint,
        "assembled bundle manifest"
    );
    Ok(manifest)
}
