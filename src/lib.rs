//! vnpack Core - Ren'Py to Flatpak build specification compiler
//!
//! # Guarantees
//! 1. The descriptor is validated before any file is touched
//! 2. The save directory is always redirected into the sandbox
//! 3. Recompilation happens exactly when the source changed
//! 4. Permissions are fixed, never derived from input
//! 5. Deterministic output
//! 6. An output tree exists only if the whole run succeeded

pub mod descriptor;
pub mod validation;
pub mod inspect;
pub mod workspace;
pub mod patcher;
pub mod hashing;
pub mod metainfo;
pub mod desktop;
pub mod manifest;
pub mod flatpak;
pub mod pipeline;

pub use descriptor::{Category, License, ProjectDescriptor, RatingLevel, SchemaError};
pub use validation::{ValidationResult, ValidationRule, ValidationViolation, ViolationSeverity};
pub use hashing::{canonical_json, compute_manifest_hash};
pub use inspect::{AddonSource, IconAsset, SourceFacts};
pub use patcher::{EngineCompiler, LauncherCompiler, PatchOutcome};
pub use manifest::{BuildStep, BundleManifest, Permission, RuntimeSpec};
pub use pipeline::{BuildError, BuildOptions, BuildOutput, BuildPipeline, BuildRequest};

pub const COMPILER_VERSION: &str = env!("CARGO_PKG_VERSION");
