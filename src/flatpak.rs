//! flatpak-builder manifest rendering
//!
//! Turns a `BundleManifest` into the JSON document `flatpak-builder`
//! consumes. All source paths are relative to the output tree so the tree
//! can be moved and rebuilt byte-for-byte.

use serde_json::{json, Value};

use crate::desktop::{GAME_INSTALL_DIR, RUN_SCRIPT};
use crate::hashing::sha256_hex;
use crate::inspect::ImageFormat;
use crate::manifest::{ArtifactKind, BundleManifest, IconPlacement, Permission};
use crate::workspace::PAYLOAD_DIR;

/// Engines from this release on can talk to Wayland directly.
const WAYLAND_MIN_ENGINE: semver::Version = semver::Version::new(7, 4, 0);

/// Files left behind in the payload after compilation.
const CLEANUP: [&str; 2] = ["*.rpy", "*.rpyc.bak"];

pub fn file_name(app_id: &str) -> String {
    format!("{}.json", app_id)
}

/// Sandbox arguments for the fixed permission set.
///
/// Filesystem and network access are never granted; the private data
/// directory is the sandbox default and needs no argument.
pub fn finish_args(manifest: &BundleManifest) -> Vec<String> {
    let mut args = vec![];
    for permission in &manifest.permissions {
        match permission {
            Permission::Audio => args.push("--socket=pulseaudio".to_string()),
            Permission::Display => {
                let wayland = manifest
                    .engine_version
                    .as_ref()
                    .map_or(false, |v| *v >= WAYLAND_MIN_ENGINE);
                if wayland {
                    args.push("--socket=wayland".to_string());
                    args.push("--socket=fallback-x11".to_string());
                } else {
                    args.push("--socket=x11".to_string());
                }
                args.push("--device=dri".to_string());
            }
            Permission::PrivateData => {}
        }
    }
    args
}

fn file_source(file_name: &str, content: &str) -> Value {
    json!({
        "type": "file",
        "path": file_name,
        "sha256": sha256_hex(content.as_bytes()),
    })
}

fn install_module(name: &str, file_name: &str, content: &str, dest_dir: &str) -> Value {
    json!({
        "name": name,
        "buildsystem": "simple",
        "sources": [file_source(file_name, content)],
        "build-commands": [format!("install -Dm644 {} {}/{}", file_name, dest_dir, file_name)],
    })
}

fn icon_module(app_id: &str, icon: &IconPlacement) -> Value {
    let dir = format!("/app/share/icons/hicolor/{}/apps", icon.theme_size);
    let target = format!("{}/{}.png", dir, app_id);
    // Some games ship WebP files named .png; those are converted.
    let commands = match icon.asset.format {
        ImageFormat::Png => vec![format!("install -Dm644 {} {}", icon.file_name, target)],
        ImageFormat::Webp => vec![
            format!("mkdir -p {}", dir),
            format!("dwebp {} -o {}", icon.file_name, target),
        ],
    };
    json!({
        "name": "icon",
        "buildsystem": "simple",
        "sources": [{
            "type": "file",
            "path": icon.file_name,
            "sha256": icon.sha256,
        }],
        "build-commands": commands,
    })
}

/// Render the flatpak-builder JSON document.
pub fn render(manifest: &BundleManifest) -> Result<String, serde_json::Error> {
    let mut modules = vec![json!({
        "name": crate::descriptor::normalize_name(&manifest.name),
        "buildsystem": "simple",
        "sources": [{ "type": "dir", "path": PAYLOAD_DIR }],
        "build-commands": [
            format!("mkdir -p {}", GAME_INSTALL_DIR),
            format!("cp -a . {}/", GAME_INSTALL_DIR),
        ],
        "cleanup": CLEANUP,
    })];

    if let Some(script) = manifest.generated(ArtifactKind::RunScript) {
        modules.push(json!({
            "name": "run_script",
            "buildsystem": "simple",
            "sources": [file_source(&script.file_name, &script.content)],
            "build-commands": [format!("install -Dm755 {} /app/bin/{}", script.file_name, RUN_SCRIPT)],
        }));
    }

    // The icon has to be in place before the metainfo is composed.
    if let Some(icon) = &manifest.icon {
        modules.push(icon_module(&manifest.id, icon));
    }

    if let Some(entry) = manifest.generated(ArtifactKind::DesktopEntry) {
        modules.push(install_module(
            "desktop_file",
            &entry.file_name,
            &entry.content,
            "/app/share/applications",
        ));
    }
    if let Some(metainfo) = manifest.generated(ArtifactKind::Metadata) {
        modules.push(install_module(
            "appdata_file",
            &metainfo.file_name,
            &metainfo.content,
            "/app/share/metainfo",
        ));
    }

    let document = json!({
        "app-id": manifest.id,
        "runtime": manifest.runtime.runtime,
        "runtime-version": manifest.runtime.version,
        "sdk": manifest.runtime.sdk,
        "command": RUN_SCRIPT,
        "build-options": {
            "no-debuginfo": true,
            "strip": false,
        },
        "finish-args": finish_args(manifest),
        "modules": modules,
    });

    let mut out = serde_json::to_string_pretty(&document)?;
    out.push('\n');
    Ok(out)
}
