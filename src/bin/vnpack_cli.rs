//! vnpack CLI - local front end for the build compiler
//!
//! Commands: compile, validate, inspect
//! Outputs JSON to stdout, logs to stderr
//! Exit codes: 0 success, 1 usage or I/O failure, 2 build failure

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::prelude::*;

use vnpack_core::{
    descriptor::RawDescriptor,
    inspect::{self, InspectOptions},
    validation::Validator,
    AddonSource, BuildError, BuildOptions, BuildPipeline, BuildRequest, ProjectDescriptor,
    RuntimeSpec,
};

#[derive(Parser)]
#[command(name = "vnpack-cli")]
#[command(about = "vnpack CLI - Ren'Py to Flatpak build compiler")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a source tree into a flatpak-builder output tree
    Compile {
        /// Unpacked game distribution
        source: PathBuf,

        /// Project descriptor (TOML)
        descriptor: PathBuf,

        /// Output directory, replaced on success
        #[arg(short, long)]
        output: PathBuf,

        /// Extra tree or file merged over the game, as SRC[=DEST]; repeatable
        #[arg(long = "addon")]
        addons: Vec<String>,

        /// Flatpak runtime version
        #[arg(long)]
        runtime_version: Option<String>,
    },

    /// Validate a descriptor
    Validate {
        /// Project descriptor (TOML)
        descriptor: PathBuf,
    },

    /// Report what would be built from a source tree
    Inspect {
        /// Unpacked game distribution
        source: PathBuf,

        /// Extra tree or file merged over the game, as SRC[=DEST]; repeatable
        #[arg(long = "addon")]
        addons: Vec<String>,

        /// Do not require an icon
        #[arg(long)]
        no_icon: bool,
    },
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "vnpack_core=info".into()),
    );
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn emit(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => println!(r#"{{"success": false, "error": "serialization failed: {}"}}"#, e),
    }
}

fn failure(kind: &str, message: impl ToString) -> Value {
    json!({
        "success": false,
        "error_kind": kind,
        "error": message.to_string(),
    })
}

fn exit_code_for(err: &BuildError) -> ExitCode {
    match err {
        BuildError::Io { .. } | BuildError::InvalidAddon(_) | BuildError::InvalidOutput(_) => {
            ExitCode::FAILURE
        }
        _ => ExitCode::from(2),
    }
}

fn parse_addons(specs: &[String]) -> Result<Vec<AddonSource>, BuildError> {
    specs.iter().map(|s| AddonSource::parse(s)).collect()
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile { source, descriptor, output, addons, runtime_version } => {
            let descriptor = match ProjectDescriptor::from_path(&descriptor) {
                Ok(d) => d,
                Err(e) => {
                    emit(&failure("schema", e));
                    return ExitCode::from(2);
                }
            };
            let addons = match parse_addons(&addons) {
                Ok(a) => a,
                Err(e) => {
                    emit(&failure(e.kind(), e));
                    return ExitCode::FAILURE;
                }
            };

            let mut runtime = RuntimeSpec::default();
            if let Some(version) = runtime_version {
                runtime.version = version;
            }
            let pipeline = BuildPipeline::new(BuildOptions { runtime });
            let request = BuildRequest { source_root: source, addons, output_dir: output };

            match pipeline.compile(&descriptor, &request) {
                Ok(out) => {
                    emit(&json!({
                        "success": true,
                        "output_dir": out.output_dir,
                        "id": out.manifest.id,
                        "fingerprint": out.manifest.fingerprint,
                        "recompiled": out.recompiled,
                        "build_steps": out.manifest.build_steps,
                    }));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    emit(&failure(e.kind(), &e));
                    exit_code_for(&e)
                }
            }
        }

        Commands::Validate { descriptor } => {
            let content = match fs::read_to_string(&descriptor) {
                Ok(c) => c,
                Err(e) => {
                    emit(&json!({
                        "valid": false,
                        "error": format!("cannot read '{}': {}", descriptor.display(), e),
                    }));
                    return ExitCode::FAILURE;
                }
            };
            let raw: RawDescriptor = match toml::from_str(&content) {
                Ok(r) => r,
                Err(e) => {
                    emit(&json!({ "valid": false, "error": format!("Malformed descriptor: {}", e) }));
                    return ExitCode::from(2);
                }
            };

            let result = Validator::new().validate(&raw);
            emit(&json!(result));
            if result.valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }

        Commands::Inspect { source, addons, no_icon } => {
            let addons = match parse_addons(&addons) {
                Ok(a) => a,
                Err(e) => {
                    emit(&failure(e.kind(), e));
                    return ExitCode::FAILURE;
                }
            };
            let options = InspectOptions { require_icon: !no_icon };

            match inspect::inspect(&source, &addons, options) {
                Ok(facts) => {
                    emit(&json!({ "success": true, "facts": facts }));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    emit(&failure(e.kind(), &e));
                    exit_code_for(&e)
                }
            }
        }
    }
}
