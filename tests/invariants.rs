//! Contract Invariant Tests
//!
//! These tests run the whole pipeline over fixture trees with a recording
//! compiler in place of the game's launcher.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use vnpack_core::{
    descriptor::SchemaError,
    manifest::ArtifactKind,
    AddonSource, BuildError, BuildOptions, BuildOutput, BuildPipeline, BuildRequest, BuildStep,
    EngineCompiler, PatchOutcome, Permission, ProjectDescriptor,
};

const DESCRIPTOR: &str = r#"
[common]
name = "Demo"
reverse_url = "com.example.jdoe"
categories = ["Simulation"]
"#;

const LAUNCHER_PY: &str = r#"#!/usr/bin/env python3
import os
import sys

def path_to_saves(gamedir, save_directory=None):
    return os.path.expanduser("~/.renpy/" + save_directory)
"#;

fn png(size: u32) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&size.to_be_bytes());
    bytes.extend_from_slice(&size.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
    bytes
}

#[derive(Default)]
struct RecordingCompiler {
    calls: Cell<usize>,
    fail: bool,
}

impl EngineCompiler for RecordingCompiler {
    fn compile(&self, base: &Path, launcher: &str) -> Result<(), BuildError> {
        self.calls.set(self.calls.get() + 1);
        assert!(base.join(launcher).is_file());
        if self.fail {
            return Err(BuildError::Compile {
                launcher: launcher.to_string(),
                status: Some(1),
                stderr: "game/broken.rpy: expected statement".to_string(),
            });
        }
        Ok(())
    }
}

fn touch(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// A game unpacked into a single top-level folder, as archives ship.
fn source_tree(root: &Path, launcher_py: &str) -> PathBuf {
    let base = root.join("src").join("Demo-1.0-pc");
    touch(&base, "Demo.sh", b"#!/bin/sh\nexec python Demo.py \"$@\"\n");
    touch(&base, "Demo.py", launcher_py.as_bytes());
    touch(&base, "Demo.exe", b"MZ");
    touch(&base, "renpy/__init__.py", b"version_tuple = (7, 3, 5, vc_version)\n");
    touch(&base, "game/script.rpy", b"label start:\n    return\n");
    touch(&base, "game/gui/window_icon.png", &png(256));
    touch(&base, "game/icon.png", &png(512));
    touch(&base, "lib/py2-windows-i686/python.exe", b"MZ");
    touch(&base, "lib/py2-linux-x86_64/python", b"\x7fELF");
    root.join("src")
}

fn descriptor() -> ProjectDescriptor {
    ProjectDescriptor::from_toml_str(DESCRIPTOR).unwrap()
}

fn build(
    compiler: RecordingCompiler,
    source: &Path,
    addons: Vec<AddonSource>,
    output: &Path,
) -> (Result<BuildOutput, BuildError>, usize) {
    build_with(&descriptor(), compiler, source, addons, output)
}

fn build_with(
    descriptor: &ProjectDescriptor,
    compiler: RecordingCompiler,
    source: &Path,
    addons: Vec<AddonSource>,
    output: &Path,
) -> (Result<BuildOutput, BuildError>, usize) {
    let pipeline = BuildPipeline::with_compiler(compiler, BuildOptions::default());
    let request = BuildRequest {
        source_root: source.to_path_buf(),
        addons,
        output_dir: output.to_path_buf(),
    };
    let result = pipeline.compile(descriptor, &request);
    (result, pipeline.compiler().calls.get())
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

#[test]
fn invariant_end_to_end_bundle() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    let output = temp.path().join("out");

    let (result, calls) = build(RecordingCompiler::default(), &source, vec![], &output);
    let out = result.unwrap();
    assert_eq!(calls, 1);
    assert!(out.recompiled);

    let manifest = &out.manifest;
    assert_eq!(manifest.id, "com.example.jdoe.Demo");
    let permissions: Vec<_> = manifest.permissions.iter().copied().collect();
    assert_eq!(permissions, vec![Permission::Audio, Permission::Display, Permission::PrivateData]);

    let metainfo = read(&output.join("com.example.jdoe.Demo.metainfo.xml"));
    assert!(metainfo.contains("<id>com.example.jdoe.Demo</id>"));
    assert_eq!(metainfo.matches("<category>").count(), 1);
    assert!(metainfo.contains("<category>Simulation</category>"));

    assert!(output.join("com.example.jdoe.Demo.desktop").is_file());
    assert!(output.join("com.example.jdoe.Demo.json").is_file());
    assert!(output.join("bundle-manifest.json").is_file());
    assert!(output.join("game.sh").is_file());
    assert_eq!(manifest.generated(ArtifactKind::RunScript).unwrap().file_name, "game.sh");

    let patched = read(&output.join("payload/Demo.py"));
    assert!(patched.contains("XDG_DATA_HOME"));
    assert!(!patched.contains(r#""~/.renpy/""#));
}

#[test]
fn invariant_source_tree_is_never_modified() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    let output = temp.path().join("out");

    build(RecordingCompiler::default(), &source, vec![], &output).0.unwrap();

    let original = source.join("Demo-1.0-pc");
    assert_eq!(read(&original.join("Demo.py")), LAUNCHER_PY);
    assert!(original.join("Demo.exe").is_file());
}

#[test]
fn invariant_platform_files_stripped() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    let output = temp.path().join("out");

    let out = build(RecordingCompiler::default(), &source, vec![], &output).0.unwrap();

    let payload = output.join("payload");
    assert!(!payload.join("Demo.exe").exists());
    assert!(!payload.join("lib/py2-windows-i686").exists());
    assert!(payload.join("lib/py2-linux-x86_64/python").is_file());
    assert!(payload.join("Demo.sh").is_file());
    assert!(payload.join("Demo.py").is_file());

    match &out.manifest.build_steps[0] {
        BuildStep::StripPlatformFiles { paths } => {
            assert_eq!(
                paths,
                &vec![PathBuf::from("Demo.exe"), PathBuf::from("lib/py2-windows-i686")]
            );
        }
        other => panic!("unexpected first step {:?}", other),
    }
}

#[test]
fn invariant_id_consistent_across_artifacts() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    let output = temp.path().join("out");

    let out = build(RecordingCompiler::default(), &source, vec![], &output).0.unwrap();
    let id = out.manifest.id.as_str();

    let flatpak: serde_json::Value =
        serde_json::from_str(&read(&output.join(format!("{}.json", id)))).unwrap();
    assert_eq!(flatpak["app-id"], id);

    let desktop = read(&output.join(format!("{}.desktop", id)));
    assert!(desktop.contains(&format!("Icon={}\n", id)));

    let metainfo = read(&output.join(format!("{}.metainfo.xml", id)));
    assert!(metainfo.contains(&format!("<launchable type=\"desktop-id\">{}.desktop</launchable>", id)));

    let icon = out.manifest.icon.as_ref().unwrap();
    assert_eq!(icon.file_name, format!("{}.png", id));
}

#[test]
fn invariant_no_filesystem_or_network_access() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    let output = temp.path().join("out");

    build(RecordingCompiler::default(), &source, vec![], &output).0.unwrap();

    let flatpak: serde_json::Value =
        serde_json::from_str(&read(&output.join("com.example.jdoe.Demo.json"))).unwrap();
    let args = flatpak["finish-args"].as_array().unwrap();
    assert!(!args.is_empty());
    for arg in args {
        let arg = arg.as_str().unwrap();
        assert!(!arg.starts_with("--filesystem"), "{}", arg);
        assert!(!arg.starts_with("--share=network"), "{}", arg);
    }
}

#[test]
fn invariant_icon_precedence_is_deterministic() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);

    for run in 0..2 {
        let output = temp.path().join(format!("out{}", run));
        let out = build(RecordingCompiler::default(), &source, vec![], &output).0.unwrap();
        let icon = out.manifest.icon.unwrap();
        assert_eq!(icon.asset.path, PathBuf::from("game/gui/window_icon.png"));
        assert_eq!(icon.theme_size, "256x256");
        assert_eq!(fs::read(output.join(&icon.file_name)).unwrap(), png(256));
    }
}

#[test]
fn invariant_addon_icon_replaces_base_icon() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    touch(temp.path(), "hd/game/gui/window_icon.png", &png(512));
    let output = temp.path().join("out");

    let addons = vec![AddonSource::new(temp.path().join("hd"))];
    let out = build(RecordingCompiler::default(), &source, addons, &output).0.unwrap();

    let icon = out.manifest.icon.unwrap();
    assert_eq!(icon.theme_size, "512x512");
    assert_eq!(fs::read(output.join(&icon.file_name)).unwrap(), png(512));
}

#[test]
fn invariant_missing_icon_aborts_before_staging() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    let base = source.join("Demo-1.0-pc");
    fs::remove_file(base.join("game/gui/window_icon.png")).unwrap();
    fs::remove_file(base.join("game/icon.png")).unwrap();
    let output = temp.path().join("out");

    let (result, calls) = build(RecordingCompiler::default(), &source, vec![], &output);
    assert!(matches!(result, Err(BuildError::AssetNotFound { .. })));
    assert_eq!(calls, 0);
    assert!(!output.exists());
}

#[test]
fn invariant_patch_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    let first_out = temp.path().join("first");
    build(RecordingCompiler::default(), &source, vec![], &first_out).0.unwrap();
    let patched = read(&first_out.join("payload/Demo.py"));

    // Feed the already-patched launcher back in.
    let again = TempDir::new().unwrap();
    let source_again = source_tree(again.path(), &patched);
    let second_out = again.path().join("second");
    let (result, calls) = build(RecordingCompiler::default(), &source_again, vec![], &second_out);
    let out = result.unwrap();

    assert_eq!(read(&second_out.join("payload/Demo.py")), patched);
    assert_eq!(calls, 0);
    assert!(!out.recompiled);
    assert!(out.manifest.build_steps.iter().any(|s| matches!(
        s,
        BuildStep::ApplyStoragePatch { outcome: PatchOutcome::AlreadyPatched { .. } }
    )));
    assert!(!out.manifest.build_steps.iter().any(|s| matches!(s, BuildStep::Recompile { .. })));
}

#[test]
fn invariant_recompile_iff_patched_or_merged() {
    let temp = TempDir::new().unwrap();
    let first = TempDir::new().unwrap();
    let source = source_tree(first.path(), LAUNCHER_PY);
    let out = build(RecordingCompiler::default(), &source, vec![], &first.path().join("out"))
        .0
        .unwrap();
    let patched = read(&first.path().join("out/payload/Demo.py"));
    assert!(out.recompiled);

    // Already patched, one add-on: the merge alone forces recompilation.
    let source = source_tree(temp.path(), &patched);
    touch(temp.path(), "mod/game/extra.rpy", b"label extra:\n    return\n");
    let (result, calls) = build(
        RecordingCompiler::default(),
        &source,
        vec![AddonSource::new(temp.path().join("mod"))],
        &temp.path().join("out"),
    );
    assert!(result.unwrap().recompiled);
    assert_eq!(calls, 1);
}

#[test]
fn invariant_missing_anchor_aborts_without_compiling() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), "import os\nprint('no saves here')\n");
    let output = temp.path().join("out");

    let (result, calls) = build(RecordingCompiler::default(), &source, vec![], &output);
    assert!(matches!(result, Err(BuildError::PatchTargetNotFound { .. })));
    assert_eq!(calls, 0);
    assert!(!output.exists());

    // The staging directory is gone too.
    let leftovers: Vec<_> = fs::read_dir(temp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("src")]);
}

#[test]
fn invariant_last_addon_wins() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    touch(temp.path(), "first/game/script.rpy", b"# first\n");
    touch(temp.path(), "first/game/only_first.rpy", b"# kept\n");
    touch(temp.path(), "second/game/script.rpy", b"# second\n");
    let output = temp.path().join("out");

    let addons = vec![
        AddonSource::new(temp.path().join("first")),
        AddonSource::new(temp.path().join("second")),
    ];
    let (result, calls) = build(RecordingCompiler::default(), &source, addons, &output);
    let out = result.unwrap();

    assert_eq!(calls, 1);
    assert_eq!(read(&output.join("payload/game/script.rpy")), "# second\n");
    assert_eq!(read(&output.join("payload/game/only_first.rpy")), "# kept\n");
    assert!(out.manifest.build_steps.iter().any(|s| matches!(
        s,
        BuildStep::MergeAddons { sources, .. } if sources.len() == 2
    )));
}

#[test]
fn invariant_compile_failure_leaves_no_output() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    let output = temp.path().join("out");

    let compiler = RecordingCompiler { fail: true, ..Default::default() };
    let (result, calls) = build(compiler, &source, vec![], &output);
    match result {
        Err(BuildError::Compile { launcher, status, .. }) => {
            assert_eq!(launcher, "Demo.sh");
            assert_eq!(status, Some(1));
        }
        other => panic!("unexpected {:?}", other.map(|o| o.manifest.id)),
    }
    assert_eq!(calls, 1);
    assert!(!output.exists());
}

#[test]
fn invariant_failed_run_keeps_previous_output() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    let output = temp.path().join("out");
    build(RecordingCompiler::default(), &source, vec![], &output).0.unwrap();
    let before = read(&output.join("bundle-manifest.json"));

    let compiler = RecordingCompiler { fail: true, ..Default::default() };
    assert!(build(compiler, &source, vec![], &output).0.is_err());
    assert_eq!(read(&output.join("bundle-manifest.json")), before);
}

#[test]
fn invariant_output_is_byte_stable() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    let a = temp.path().join("a");
    let b = temp.path().join("b");

    let first = build(RecordingCompiler::default(), &source, vec![], &a).0.unwrap();
    let second = build(RecordingCompiler::default(), &source, vec![], &b).0.unwrap();

    assert_eq!(first.manifest.fingerprint, second.manifest.fingerprint);
    assert_eq!(first.manifest.fingerprint, first.manifest.compute_fingerprint().unwrap());
    for name in [
        "com.example.jdoe.Demo.json",
        "com.example.jdoe.Demo.metainfo.xml",
        "com.example.jdoe.Demo.desktop",
        "game.sh",
        "bundle-manifest.json",
    ] {
        assert_eq!(fs::read(a.join(name)).unwrap(), fs::read(b.join(name)).unwrap(), "{}", name);
    }
}

#[test]
fn invariant_releases_ordered_regardless_of_input() {
    let descriptor = ProjectDescriptor::from_toml_str(&format!(
        "{}\n[appdata.releases]\n\"1.10\" = \"2024-03-01\"\n\"1.2\" = \"2023-05-01\"\n\"1.9.1\" = \"2023-11-20\"\n",
        DESCRIPTOR
    ))
    .unwrap();
    let versions: Vec<_> = descriptor.releases.iter().map(|r| r.version.raw.as_str()).collect();
    assert_eq!(versions, vec!["1.2", "1.9.1", "1.10"]);

    let xml = vnpack_core::metainfo::render(&descriptor);
    let positions: Vec<_> = versions
        .iter()
        .map(|v| xml.find(&format!("version=\"{}\"", v)).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn invariant_invalid_descriptor_rejected() {
    let cases = [
        // unknown category
        DESCRIPTOR.replace("Simulation", "Racing"),
        // rating outside the scale
        format!("{}\n[appdata.content_rating]\nviolence-cartoon = \"extreme\"\n", DESCRIPTOR),
        // unknown rating attribute
        format!("{}\n[appdata.content_rating]\nviolence-pixelated = \"mild\"\n", DESCRIPTOR),
        // impossible date
        format!("{}\n[appdata.releases]\n\"1.0\" = \"2023-02-30\"\n", DESCRIPTOR),
        // missing field
        "[common]\nname = \"Demo\"\ncategories = []\n".to_string(),
        // unknown key
        format!("{}\n[appdata]\nhomepage = \"https://example.com\"\n", DESCRIPTOR),
    ];
    for case in &cases {
        match ProjectDescriptor::from_toml_str(case) {
            Err(SchemaError::Malformed(_)) | Err(SchemaError::Invalid(_)) => {}
            Ok(d) => panic!("accepted invalid descriptor {:?}", d.app_id),
        }
    }
}

#[test]
fn invariant_output_never_overlaps_source() {
    let temp = TempDir::new().unwrap();
    let project = temp.path().join("project");
    let base = source_tree(&project, LAUNCHER_PY).join("Demo-1.0-pc");
    touch(&project, "my_notes.txt", b"do not delete");

    for output in [project.clone(), project.join("src"), base.clone(), base.join("out")] {
        let (result, calls) = build(RecordingCompiler::default(), &project.join("src"), vec![], &output);
        assert!(matches!(result, Err(BuildError::InvalidOutput(_))), "{}", output.display());
        assert_eq!(calls, 0);
    }
    assert_eq!(read(&base.join("Demo.py")), LAUNCHER_PY);
    assert_eq!(read(&project.join("my_notes.txt")), "do not delete");
    assert!(!base.join("out").exists());
}

#[test]
fn invariant_unrelated_directory_never_replaced() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    let output = temp.path().join("documents");
    touch(&output, "thesis.txt", b"draft");

    let (result, calls) = build(RecordingCompiler::default(), &source, vec![], &output);
    assert!(matches!(result, Err(BuildError::InvalidOutput(_))));
    assert_eq!(calls, 0);
    assert_eq!(read(&output.join("thesis.txt")), "draft");
}

#[test]
fn invariant_previous_bundle_is_replaced() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    let output = temp.path().join("out");
    build(RecordingCompiler::default(), &source, vec![], &output).0.unwrap();
    touch(&output, "stale.txt", b"from an older run");

    build(RecordingCompiler::default(), &source, vec![], &output).0.unwrap();
    assert!(!output.join("stale.txt").exists());
    assert!(output.join("bundle-manifest.json").is_file());
}

#[test]
fn invariant_icon_workaround_builds_without_icon() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    let base = source.join("Demo-1.0-pc");
    fs::remove_file(base.join("game/gui/window_icon.png")).unwrap();
    fs::remove_file(base.join("game/icon.png")).unwrap();
    let output = temp.path().join("out");

    let descriptor =
        ProjectDescriptor::from_toml_str(&format!("{}
[workarounds]
icon = false
", DESCRIPTOR))
            .unwrap();
    let out = build_with(&descriptor, RecordingCompiler::default(), &source, vec![], &output)
        .0
        .unwrap();

    assert!(out.manifest.icon.is_none());
    assert!(!out.manifest.build_steps.iter().any(|s| matches!(s, BuildStep::InstallIcon { .. })));
    assert!(!output.join("com.example.jdoe.Demo.png").exists());

    let desktop = read(&output.join("com.example.jdoe.Demo.desktop"));
    assert!(!desktop.contains("Icon="));

    let flatpak: serde_json::Value =
        serde_json::from_str(&read(&output.join("com.example.jdoe.Demo.json"))).unwrap();
    let modules: Vec<_> = flatpak["modules"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(modules, vec!["Demo", "run_script", "desktop_file", "appdata_file"]);
}

#[test]
fn invariant_addon_launcher_is_patched() {
    let temp = TempDir::new().unwrap();
    // The shipped launcher has no anchor; only the merged one does.
    let source = source_tree(temp.path(), "import os\nprint('no saves here')\n");
    touch(temp.path(), "launcher-fix/Demo.py", LAUNCHER_PY.as_bytes());
    let output = temp.path().join("out");

    let addons = vec![AddonSource::new(temp.path().join("launcher-fix"))];
    let (result, calls) = build(RecordingCompiler::default(), &source, addons, &output);
    let out = result.unwrap();

    assert_eq!(calls, 1);
    let patched = read(&output.join("payload/Demo.py"));
    assert!(patched.contains("XDG_DATA_HOME"));
    assert!(out.manifest.build_steps.iter().any(|s| matches!(
        s,
        BuildStep::ApplyStoragePatch { outcome: PatchOutcome::Applied { files } }
            if files == &vec![PathBuf::from("Demo.py")]
    )));
}

#[test]
fn invariant_single_file_addon_renamed_on_merge() {
    let temp = TempDir::new().unwrap();
    let source = source_tree(temp.path(), LAUNCHER_PY);
    touch(temp.path(), "fix.rpy", b"init python:\n    pass\n");
    let output = temp.path().join("out");

    let addon = AddonSource::parse(&format!("{}=game/00fix.rpy", temp.path().join("fix.rpy").display()))
        .unwrap();
    build(RecordingCompiler::default(), &source, vec![addon], &output).0.unwrap();

    assert!(output.join("payload/game/00fix.rpy").is_file());
    assert!(!output.join("payload/game/fix.rpy").exists());
}
