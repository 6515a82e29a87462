//! Project Descriptor - Validated Identity Contract
//!
//! The descriptor is parsed into a raw, string-typed layer first. Validation
//! rules inspect the raw layer, then the typed `ProjectDescriptor` is built.
//! Nothing unknown is accepted and nothing is coerced.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::validation::{ValidationViolation, Validator, ViolationSeverity};

/// Proprietary sentinel used when the descriptor carries no license.
pub const PROPRIETARY_LICENSE: &str = "LicenseRef-proprietary";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Malformed descriptor: {0}")]
    Malformed(String),

    #[error("Descriptor validation failed: {}", summarize(.0))]
    Invalid(Vec<ValidationViolation>),
}

fn summarize(violations: &[ValidationViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.rule, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

// --- Raw layer (exactly what the TOML file says) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDescriptor {
    pub common: RawCommon,
    #[serde(default)]
    pub appdata: Option<RawAppData>,
    #[serde(default)]
    pub workarounds: RawWorkarounds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawCommon {
    pub name: String,
    pub reverse_url: String,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawAppData {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub content_rating: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub releases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawWorkarounds {
    #[serde(default = "default_true")]
    pub icon: bool,
}

impl Default for RawWorkarounds {
    fn default() -> Self {
        Self { icon: true }
    }
}

fn default_true() -> bool { true }

// --- Typed layer ---

/// Freedesktop menu categories a packaged game may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    ActionGame,
    AdventureGame,
    ArcadeGame,
    BoardGame,
    BlocksGame,
    CardGame,
    KidsGame,
    LogicGame,
    RolePlaying,
    Shooter,
    Simulation,
    SportsGame,
    StrategyGame,
    Education,
    Amusement,
}

impl Category {
    pub const ALL: [Category; 15] = [
        Category::ActionGame,
        Category::AdventureGame,
        Category::ArcadeGame,
        Category::BoardGame,
        Category::BlocksGame,
        Category::CardGame,
        Category::KidsGame,
        Category::LogicGame,
        Category::RolePlaying,
        Category::Shooter,
        Category::Simulation,
        Category::SportsGame,
        Category::StrategyGame,
        Category::Education,
        Category::Amusement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::ActionGame => "ActionGame",
            Category::AdventureGame => "AdventureGame",
            Category::ArcadeGame => "ArcadeGame",
            Category::BoardGame => "BoardGame",
            Category::BlocksGame => "BlocksGame",
            Category::CardGame => "CardGame",
            Category::KidsGame => "KidsGame",
            Category::LogicGame => "LogicGame",
            Category::RolePlaying => "RolePlaying",
            Category::Shooter => "Shooter",
            Category::Simulation => "Simulation",
            Category::SportsGame => "SportsGame",
            Category::StrategyGame => "StrategyGame",
            Category::Education => "Education",
            Category::Amusement => "Amusement",
        }
    }

    /// Whether the category is a sub-category of `Game` in the menu spec.
    pub fn is_game_subcategory(&self) -> bool {
        !matches!(self, Category::Education | Category::Amusement)
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unrecognized category '{}'", s))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OARS intensity scale. Ordering follows severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatingLevel {
    None,
    Mild,
    Moderate,
    Intense,
}

impl RatingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RatingLevel::None => "none",
            RatingLevel::Mild => "mild",
            RatingLevel::Moderate => "moderate",
            RatingLevel::Intense => "intense",
        }
    }
}

impl FromStr for RatingLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(RatingLevel::None),
            "mild" => Ok(RatingLevel::Mild),
            "moderate" => Ok(RatingLevel::Moderate),
            "intense" => Ok(RatingLevel::Intense),
            other => Err(format!(
                "rating '{}' is not one of none, mild, moderate, intense",
                other
            )),
        }
    }
}

/// OARS 1.0 attribute ids.
pub const OARS_ATTRIBUTES: [&str; 20] = [
    "violence-cartoon",
    "violence-fantasy",
    "violence-realistic",
    "violence-bloodshed",
    "violence-sexual",
    "drugs-alcohol",
    "drugs-narcotics",
    "drugs-tobacco",
    "sex-nudity",
    "sex-themes",
    "language-profanity",
    "language-humor",
    "language-discrimination",
    "social-chat",
    "social-info",
    "social-audio",
    "social-location",
    "social-contacts",
    "money-purchasing",
    "money-gambling",
];

pub fn is_oars_attribute(id: &str) -> bool {
    OARS_ATTRIBUTES.contains(&id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum License {
    Spdx { expression: String },
    Proprietary { url: Option<String> },
}

impl License {
    /// Parse the descriptor's license string. Absent means proprietary.
    pub fn parse(raw: Option<&str>) -> Result<Self, String> {
        let Some(raw) = raw.map(str::trim) else {
            return Ok(License::Proprietary { url: None });
        };
        if raw.is_empty() {
            return Err("license must not be empty".to_string());
        }

        let (head, url) = match raw.split_once('=') {
            Some((head, url)) => (head.trim(), Some(url.trim())),
            None => (raw, None),
        };
        if head.eq_ignore_ascii_case(PROPRIETARY_LICENSE) {
            return match url {
                Some("") => Err("license reference URL must not be empty".to_string()),
                Some(url) => Ok(License::Proprietary { url: Some(url.to_string()) }),
                None => Ok(License::Proprietary { url: None }),
            };
        }
        if url.is_some() {
            return Err(format!(
                "only {} may carry a reference URL",
                PROPRIETARY_LICENSE
            ));
        }
        validate_spdx_expression(raw)?;
        Ok(License::Spdx { expression: raw.to_string() })
    }

    /// The `project_license` value written into metainfo.
    pub fn render(&self) -> String {
        match self {
            License::Spdx { expression } => expression.clone(),
            License::Proprietary { url: None } => PROPRIETARY_LICENSE.to_string(),
            License::Proprietary { url: Some(url) } => format!("{}={}", PROPRIETARY_LICENSE, url),
        }
    }
}

fn validate_spdx_expression(expr: &str) -> Result<(), String> {
    let spaced = expr.replace('(', " ( ").replace(')', " ) ");
    let mut depth = 0i32;
    let mut expect_operand = true;

    for token in spaced.split_whitespace() {
        match token {
            "(" if expect_operand => depth += 1,
            ")" if !expect_operand => {
                depth -= 1;
                if depth < 0 {
                    return Err(format!("unbalanced parentheses in '{}'", expr));
                }
            }
            "AND" | "OR" | "WITH" if !expect_operand => expect_operand = true,
            id if expect_operand && is_license_id(id) => expect_operand = false,
            other => return Err(format!("unexpected token '{}' in license '{}'", other, expr)),
        }
    }

    if depth != 0 || expect_operand {
        return Err(format!("incomplete license expression '{}'", expr));
    }
    Ok(())
}

fn is_license_id(token: &str) -> bool {
    let core = token.strip_suffix('+').unwrap_or(token);
    !core.is_empty()
        && core
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

/// A release version. Keeps the descriptor spelling for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseVersion {
    pub raw: String,
    pub version: semver::Version,
}

impl ReleaseVersion {
    /// Parse `X`, `X.Y` or full semver. Missing components are zero.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let (core, rest) = match trimmed.find(|c| c == '-' || c == '+') {
            Some(idx) => trimmed.split_at(idx),
            None => (trimmed, ""),
        };
        let parts: Vec<&str> = core.split('.').collect();
        if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
            return Err(format!("'{}' is not a semantic version", raw));
        }
        let mut padded = parts.join(".");
        for _ in parts.len()..3 {
            padded.push_str(".0");
        }
        padded.push_str(rest);

        let version = semver::Version::parse(&padded)
            .map_err(|e| format!("'{}' is not a semantic version: {}", raw, e))?;
        Ok(Self { raw: trimmed.to_string(), version })
    }
}

impl PartialOrd for ReleaseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReleaseVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub version: ReleaseVersion,
    pub date: NaiveDate,
}

pub fn parse_release_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| format!("'{}' is not a YYYY-MM-DD date: {}", raw, e))
}

/// Validated project descriptor. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    pub name: String,
    pub reverse_url: String,
    pub app_id: String,
    pub categories: Vec<Category>,
    pub summary: String,
    pub description: String,
    pub license: License,
    pub content_rating: Option<BTreeMap<String, RatingLevel>>,
    /// Sorted ascending by version.
    pub releases: Vec<Release>,
    pub install_icon: bool,
}

impl ProjectDescriptor {
    /// Build a descriptor from an already-parsed configuration tree.
    pub fn load(raw: toml::Value) -> Result<Self, SchemaError> {
        let raw: RawDescriptor = raw
            .try_into()
            .map_err(|e: toml::de::Error| SchemaError::Malformed(e.to_string()))?;
        Self::from_raw(raw)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SchemaError> {
        let value: toml::Value =
            toml::from_str(content).map_err(|e| SchemaError::Malformed(e.to_string()))?;
        Self::load(value)
    }

    pub fn from_path(path: &Path) -> Result<Self, SchemaError> {
        let content = fs::read_to_string(path).map_err(|e| {
            SchemaError::Malformed(format!("cannot read '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_raw(raw: RawDescriptor) -> Result<Self, SchemaError> {
        let result = Validator::new().validate(&raw);
        for warning in result.violations.iter().filter(|v| v.severity == ViolationSeverity::Warning) {
            tracing::warn!(rule = %warning.rule, "{}", warning.message);
        }
        if !result.valid {
            return Err(SchemaError::Invalid(result.into_errors()));
        }

        let appdata = raw.appdata.unwrap_or_default();
        let name = raw.common.name.trim().to_string();

        let mut categories = Vec::new();
        for c in &raw.common.categories {
            let category = c.parse::<Category>().map_err(SchemaError::Malformed)?;
            if !categories.contains(&category) {
                categories.push(category);
            }
        }

        let summary = appdata
            .summary
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&name)
            .to_string();
        let description = appdata
            .description
            .as_deref()
            .map(resolve_continuations)
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| summary.clone());

        let license = License::parse(appdata.license.as_deref()).map_err(SchemaError::Malformed)?;

        let content_rating = match appdata.content_rating {
            Some(map) => {
                let mut ratings = BTreeMap::new();
                for (id, level) in map {
                    let level = level.parse::<RatingLevel>().map_err(SchemaError::Malformed)?;
                    ratings.insert(id, level);
                }
                Some(ratings)
            }
            None => None,
        };

        let mut releases = Vec::with_capacity(appdata.releases.len());
        for (version, date) in &appdata.releases {
            releases.push(Release {
                version: ReleaseVersion::parse(version).map_err(SchemaError::Malformed)?,
                date: parse_release_date(date).map_err(SchemaError::Malformed)?,
            });
        }
        releases.sort_by(|a, b| a.version.cmp(&b.version));

        let reverse_url = raw.common.reverse_url.trim().to_string();
        let app_id = format!("{}.{}", reverse_url, normalize_name(&name));

        Ok(Self {
            name,
            reverse_url,
            app_id,
            categories,
            summary,
            description,
            license,
            content_rating,
            releases,
            install_icon: raw.workarounds.icon,
        })
    }

    /// Description split into paragraphs on blank lines.
    pub fn description_paragraphs(&self) -> Vec<String> {
        let mut paragraphs = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        for line in self.description.lines() {
            let line = line.trim();
            if line.is_empty() {
                if !current.is_empty() {
                    paragraphs.push(current.join(" "));
                    current.clear();
                }
            } else {
                current.push(line);
            }
        }
        if !current.is_empty() {
            paragraphs.push(current.join(" "));
        }
        paragraphs
    }

    /// First category that belongs under `Game` in application menus.
    pub fn primary_game_category(&self) -> Option<Category> {
        self.categories.iter().copied().find(Category::is_game_subcategory)
    }
}

/// Turn a display name into an application id segment.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_space = false;
    for c in name.trim().chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_space && !out.is_empty() {
                out.push('_');
            }
            pending_space = false;
            out.push(c);
        }
    }
    out
}

/// Join lines that end with a line-continuation backslash.
///
/// The backslash, the line break and the next line's leading whitespace
/// are removed. An escaped backslash (`\\`) at end of line is kept.
pub fn resolve_continuations(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut joining = false;
    let mut lines = text.split('\n').peekable();

    while let Some(line) = lines.next() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let line = if joining { line.trim_start() } else { line };

        let trailing = line.len() - line.trim_end_matches('\\').len();
        if trailing % 2 == 1 {
            out.push_str(&line[..line.len() - 1]);
            joining = true;
            continue;
        }

        out.push_str(line);
        // A whitespace-only line following a continuation is consumed.
        joining = joining && line.is_empty();
        if lines.peek().is_some() && !joining {
            out.push('\n');
        }
    }
    out
}
