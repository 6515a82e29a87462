//! Source Tree Inspector
//!
//! Discovers facts about an unpacked Ren'Py distribution. Nothing here
//! mutates the tree.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::pipeline::BuildError;

/// Icon candidates relative to the base directory, highest precedence first.
pub const ICON_CANDIDATES: [&str; 5] = [
    "game/gui/window_icon.png",
    "game/gui/window_icon.webp",
    "game/window_icon.png",
    "game/gui/icon.png",
    "game/icon.png",
];

/// `lib/` sub-directories holding binaries for other platforms.
const FOREIGN_LIB_PREFIXES: [&str; 2] = ["darwin-", "windows-"];
const FOREIGN_LIB_INFIXES: [&str; 2] = ["-darwin-", "-windows-"];
const FOREIGN_LIB_SUFFIXES: [&str; 1] = ["-i686"];
const WINDOWS_FILE_EXTENSIONS: [&str; 3] = ["exe", "bat", "cmd"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Webp,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
        }
    }

    /// Identify an image from its leading bytes.
    pub fn sniff(header: &[u8]) -> Option<Self> {
        if header.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(ImageFormat::Png)
        } else if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP" {
            Some(ImageFormat::Webp)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IconAsset {
    pub path: PathBuf,
    pub format: ImageFormat,
    /// Width and height, when the header could be read.
    pub dimensions: Option<[u32; 2]>,
}

impl IconAsset {
    /// hicolor theme directory the icon belongs in.
    ///
    /// The smallest standard size that holds the image, so the export
    /// check (image no larger than its directory) passes. Images past the
    /// largest standard size get a directory of their own size.
    pub fn theme_size(&self) -> String {
        let Some([w, h]) = self.dimensions else {
            return format!("{0}x{0}", UNKNOWN_ICON_SIZE);
        };
        let side = w.max(h);
        let size = STANDARD_ICON_SIZES
            .iter()
            .copied()
            .find(|s| *s >= side)
            .unwrap_or(side);
        format!("{0}x{0}", size)
    }
}

const STANDARD_ICON_SIZES: [u32; 8] = [16, 24, 32, 48, 64, 128, 256, 512];
const UNKNOWN_ICON_SIZE: u32 = 256;

/// An extra tree or file merged on top of the base directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonSource {
    pub source: PathBuf,
    /// Relative to the base directory.
    pub destination: Option<PathBuf>,
}

impl AddonSource {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self { source: source.into(), destination: None }
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Parse the `SRC[=DEST]` command line form.
    pub fn parse(spec: &str) -> Result<Self, BuildError> {
        let (src, dest) = match spec.split_once('=') {
            Some((src, dest)) => (src, Some(dest)),
            None => (spec, None),
        };
        if src.is_empty() {
            return Err(BuildError::InvalidAddon(format!("'{}' has an empty source", spec)));
        }
        let addon = Self {
            source: PathBuf::from(src),
            destination: dest.map(PathBuf::from),
        };
        addon.check_destination()?;
        Ok(addon)
    }

    /// Destination inside the base directory the add-on lands in.
    ///
    /// Directories default to the base root, single files to `game/`.
    pub fn resolved_destination(&self) -> PathBuf {
        match &self.destination {
            Some(dest) => dest.clone(),
            None if self.source.is_dir() => PathBuf::new(),
            None => PathBuf::from("game"),
        }
    }

    pub fn check_destination(&self) -> Result<(), BuildError> {
        let Some(dest) = &self.destination else {
            return Ok(());
        };
        if dest.is_absolute() {
            return Err(BuildError::InvalidAddon(format!(
                "destination must be relative, got '{}'",
                dest.display()
            )));
        }
        for component in dest.components() {
            if !matches!(component, Component::Normal(_) | Component::CurDir) {
                return Err(BuildError::InvalidAddon(format!(
                    "destination '{}' escapes the game directory",
                    dest.display()
                )));
            }
        }
        Ok(())
    }
}

/// Facts discovered from the raw source tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFacts {
    pub base_directory: PathBuf,
    pub icon: Option<IconAsset>,
    /// File name of the Linux launcher script.
    pub launcher_script: String,
    pub engine_version: Option<semver::Version>,
    pub addons: Vec<AddonSource>,
    /// Relative to `base_directory`, sorted.
    pub platform_specific_paths: BTreeSet<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct InspectOptions {
    pub require_icon: bool,
}

impl Default for InspectOptions {
    fn default() -> Self {
        Self { require_icon: true }
    }
}

/// Inspect a source tree and the add-ons that will be merged into it.
pub fn inspect(
    source_root: &Path,
    addons: &[AddonSource],
    options: InspectOptions,
) -> Result<SourceFacts, BuildError> {
    let base_directory = find_base_directory(source_root)?;
    tracing::debug!(base = %base_directory.display(), "found engine project root");

    let icon = if options.require_icon {
        Some(find_icon(&base_directory)?)
    } else {
        None
    };
    let launcher_script = find_launcher_script(&base_directory)?;
    let engine_version = detect_engine_version(&base_directory);

    for addon in addons {
        addon.check_destination()?;
        if !addon.source.exists() {
            return Err(BuildError::AssetNotFound {
                asset: "add-on source".to_string(),
                searched: vec![addon.source.clone()],
            });
        }
    }

    let platform_specific_paths = find_platform_specific_paths(&base_directory)?;

    tracing::info!(
        launcher = %launcher_script,
        engine = ?engine_version.as_ref().map(ToString::to_string),
        stripped = platform_specific_paths.len(),
        addons = addons.len(),
        "inspected source tree"
    );

    Ok(SourceFacts {
        base_directory,
        icon,
        launcher_script,
        engine_version,
        addons: addons.to_vec(),
        platform_specific_paths,
    })
}

fn is_engine_root(dir: &Path) -> bool {
    dir.join("game").is_dir() && dir.join("renpy").is_dir()
}

/// The source root itself, or its single child that holds the project.
pub fn find_base_directory(source_root: &Path) -> Result<PathBuf, BuildError> {
    if is_engine_root(source_root) {
        return Ok(source_root.to_path_buf());
    }

    let mut candidates = vec![];
    if source_root.is_dir() {
        for entry in fs::read_dir(source_root).map_err(|e| BuildError::io(source_root, e))? {
            let path = entry.map_err(|e| BuildError::io(source_root, e))?.path();
            if path.is_dir() && is_engine_root(&path) {
                candidates.push(path);
            }
        }
    }

    if candidates.len() == 1 {
        return Ok(candidates.remove(0));
    }
    Err(BuildError::AssetNotFound {
        asset: "engine project root (directory with game/ and renpy/)".to_string(),
        searched: vec![source_root.to_path_buf()],
    })
}

pub fn find_icon(base: &Path) -> Result<IconAsset, BuildError> {
    for candidate in ICON_CANDIDATES {
        let path = base.join(candidate);
        if !path.is_file() {
            continue;
        }
        let header = read_header(&path)?;
        let Some(format) = ImageFormat::sniff(&header) else {
            tracing::warn!(path = %path.display(), "icon candidate is not a PNG or WebP image");
            continue;
        };
        let dimensions = match format {
            ImageFormat::Png => png_dimensions(&header),
            ImageFormat::Webp => webp_dimensions(&header),
        };
        tracing::debug!(path = %path.display(), ?format, ?dimensions, "selected icon");
        return Ok(IconAsset { path, format, dimensions });
    }

    Err(BuildError::AssetNotFound {
        asset: "icon".to_string(),
        searched: ICON_CANDIDATES.iter().map(|c| base.join(c)).collect(),
    })
}

fn read_header(path: &Path) -> Result<Vec<u8>, BuildError> {
    let mut file = fs::File::open(path).map_err(|e| BuildError::io(path, e))?;
    let mut header = Vec::with_capacity(32);
    file.by_ref()
        .take(32)
        .read_to_end(&mut header)
        .map_err(|e| BuildError::io(path, e))?;
    Ok(header)
}

/// Width and height from the IHDR chunk.
fn png_dimensions(header: &[u8]) -> Option<[u32; 2]> {
    if header.len() < 24 || &header[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([header[16], header[17], header[18], header[19]]);
    let height = u32::from_be_bytes([header[20], header[21], header[22], header[23]]);
    Some([width, height])
}

fn le24(bytes: &[u8]) -> u32 {
    u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16
}

/// Canvas size from the first chunk of a `VP8 `, `VP8L` or `VP8X` file.
fn webp_dimensions(header: &[u8]) -> Option<[u32; 2]> {
    if header.len() < 30 {
        return None;
    }
    match &header[12..16] {
        b"VP8X" => Some([le24(&header[24..27]) + 1, le24(&header[27..30]) + 1]),
        b"VP8L" if header[20] == 0x2f => {
            let bits = u32::from_le_bytes([header[21], header[22], header[23], header[24]]);
            Some([(bits & 0x3fff) + 1, ((bits >> 14) & 0x3fff) + 1])
        }
        b"VP8 " if header[23..26] == [0x9d, 0x01, 0x2a] => {
            let width = u16::from_le_bytes([header[26], header[27]]) & 0x3fff;
            let height = u16::from_le_bytes([header[28], header[29]]) & 0x3fff;
            Some([u32::from(width), u32::from(height)])
        }
        _ => None,
    }
}

pub fn find_launcher_script(base: &Path) -> Result<String, BuildError> {
    let mut scripts = vec![];
    for entry in fs::read_dir(base).map_err(|e| BuildError::io(base, e))? {
        let path = entry.map_err(|e| BuildError::io(base, e))?.path();
        if path.is_file() && path.extension().map_or(false, |e| e == "sh") {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                scripts.push(name.to_string());
            }
        }
    }
    scripts.sort();
    scripts.into_iter().next().ok_or_else(|| BuildError::AssetNotFound {
        asset: "launcher script (*.sh)".to_string(),
        searched: vec![base.to_path_buf()],
    })
}

/// Engine version from `renpy/vc_version.py`, falling back to `renpy/__init__.py`.
pub fn detect_engine_version(base: &Path) -> Option<semver::Version> {
    let from_vc = fs::read_to_string(base.join("renpy/vc_version.py"))
        .ok()
        .and_then(|src| version_from_vc_module(&src));
    from_vc.or_else(|| {
        fs::read_to_string(base.join("renpy/__init__.py"))
            .ok()
            .and_then(|src| version_from_version_tuple(&src))
    })
}

fn version_from_vc_module(src: &str) -> Option<semver::Version> {
    src.lines().find_map(|line| {
        let value = line.trim().strip_prefix("version")?.trim_start().strip_prefix('=')?;
        let value = value.trim().trim_matches(|c| c == '\'' || c == '"');
        leading_numbers(value.split('.'))
    })
}

fn version_from_version_tuple(src: &str) -> Option<semver::Version> {
    src.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("version_tuple")?.trim_start().strip_prefix('=')?;
        let open = rest.find('(')?;
        let close = rest[open..].find(')')? + open;
        leading_numbers(rest[open + 1..close].split(','))
    })
}

fn leading_numbers<'a>(parts: impl Iterator<Item = &'a str>) -> Option<semver::Version> {
    let numbers: Vec<u64> = parts
        .map(str::trim)
        .take(3)
        .map_while(|p| p.parse().ok())
        .collect();
    match numbers.as_slice() {
        [major, minor, patch] => Some(semver::Version::new(*major, *minor, *patch)),
        [major, minor] => Some(semver::Version::new(*major, *minor, 0)),
        _ => None,
    }
}

/// Paths under `base` that only make sense on Windows or macOS.
pub fn find_platform_specific_paths(base: &Path) -> Result<BTreeSet<PathBuf>, BuildError> {
    let mut found = BTreeSet::new();
    let mut walker = WalkDir::new(base).follow_links(false).sort_by_file_name().into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| BuildError::Io {
            context: format!("walking '{}'", base.display()),
            source: e.into(),
        })?;
        let Ok(relative) = entry.path().strip_prefix(base) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        if is_platform_specific(relative, entry.file_type().is_dir()) {
            found.insert(relative.to_path_buf());
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
        }
    }
    Ok(found)
}

/// Classify one relative path. Shared scripts and data never match.
pub fn is_platform_specific(relative: &Path, is_dir: bool) -> bool {
    let name = match relative.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return false,
    };
    let extension = relative.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);

    if is_dir {
        if extension.as_deref() == Some("app") {
            return true;
        }
        let parent_is_lib = relative.parent().map_or(false, |p| p == Path::new("lib"));
        return parent_is_lib
            && (FOREIGN_LIB_PREFIXES.iter().any(|p| name.starts_with(p))
                || FOREIGN_LIB_INFIXES.iter().any(|p| name.contains(p))
                || FOREIGN_LIB_SUFFIXES.iter().any(|s| name.ends_with(s)));
    }

    extension.map_or(false, |e| WINDOWS_FILE_EXTENSIONS.contains(&e.as_str()))
}
