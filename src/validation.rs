//! Validation System - Rule/Policy Separation
//!
//! Rules produce structured violations against the raw descriptor.
//! Policy is fixed: any `Error` blocks, `Warning` is reported and passes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::descriptor::{
    is_oars_attribute, normalize_name, parse_release_date, Category, License, RatingLevel,
    RawDescriptor, ReleaseVersion,
};

/// Longest id flatpak accepts.
const MAX_APP_ID_LEN: usize = 255;
/// AppStream guidance for summary length.
const SUMMARY_SOFT_LIMIT: usize = 35;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub remediation: Vec<String>,
}

impl ValidationViolation {
    fn error(rule: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            severity: ViolationSeverity::Error,
            message: message.into(),
            expected: None,
            actual: None,
            remediation: vec![],
        }
    }

    fn warning(rule: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ViolationSeverity::Warning,
            ..Self::error(rule, message)
        }
    }

    fn expected(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }

    fn remedy(mut self, remediation: impl Into<String>) -> Self {
        self.remediation.push(remediation.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
    pub app_id: String,
}

impl ValidationResult {
    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Error)
    }

    pub fn into_errors(self) -> Vec<ValidationViolation> {
        self.violations
            .into_iter()
            .filter(|v| v.severity == ViolationSeverity::Error)
            .collect()
    }
}

/// Validation rule trait - produces violations
pub trait ValidationRule {
    fn name(&self) -> &'static str;
    fn validate(&self, input: &RawDescriptor) -> Vec<ValidationViolation>;
}

// --- Concrete Rules ---

pub struct AppIdRule;

impl ValidationRule for AppIdRule {
    fn name(&self) -> &'static str { "app_id" }

    fn validate(&self, input: &RawDescriptor) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        let reverse_url = input.common.reverse_url.trim();
        let segments: Vec<&str> = reverse_url.split('.').collect();

        let segments_ok = segments.len() >= 2
            && segments.iter().all(|s| {
                !s.is_empty() && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            });
        if !segments_ok {
            violations.push(
                ValidationViolation::error(self.name(), "reverse_url is not a reverse-DNS prefix")
                    .expected("lowercase alphanumeric segments separated by dots, e.g. com.example", reverse_url)
                    .remedy("Use at least two dot-separated segments of [a-z0-9] without a trailing dot"),
            );
        }

        let name = input.common.name.trim();
        if name.is_empty() {
            violations.push(ValidationViolation::error(self.name(), "name must not be empty"));
            return violations;
        }

        let suffix = normalize_name(name);
        if suffix.is_empty() || suffix.starts_with(|c: char| c.is_ascii_digit()) {
            violations.push(
                ValidationViolation::error(self.name(), "name does not yield a valid id segment")
                    .expected("a name starting with a letter or underscore", name)
                    .remedy("Rename the project so its normalized form starts with a letter"),
            );
        }

        let app_id_len = reverse_url.len() + 1 + suffix.len();
        if app_id_len > MAX_APP_ID_LEN {
            violations.push(
                ValidationViolation::error(self.name(), "application id is too long")
                    .expected(format!("<= {} bytes", MAX_APP_ID_LEN), format!("{} bytes", app_id_len)),
            );
        }

        violations
    }
}

pub struct CategoryRule;

impl ValidationRule for CategoryRule {
    fn name(&self) -> &'static str { "categories" }

    fn validate(&self, input: &RawDescriptor) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        let mut seen: Vec<&str> = vec![];

        for raw in &input.common.categories {
            if let Err(message) = raw.parse::<Category>() {
                let known: Vec<_> = Category::ALL.iter().map(Category::as_str).collect();
                violations.push(
                    ValidationViolation::error(self.name(), message)
                        .expected(known.join(", "), raw.as_str())
                        .remedy("Pick categories from the freedesktop Game sub-category list"),
                );
            } else if seen.contains(&raw.as_str()) {
                violations.push(ValidationViolation::warning(
                    self.name(),
                    format!("category '{}' listed more than once", raw),
                ));
            } else {
                seen.push(raw);
            }
        }

        violations
    }
}

pub struct ContentRatingRule;

impl ValidationRule for ContentRatingRule {
    fn name(&self) -> &'static str { "content_rating" }

    fn validate(&self, input: &RawDescriptor) -> Vec<ValidationViolation> {
        let Some(ratings) = input.appdata.as_ref().and_then(|a| a.content_rating.as_ref()) else {
            return vec![];
        };

        let mut violations = vec![];
        for (id, level) in ratings {
            if !is_oars_attribute(id) {
                violations.push(
                    ValidationViolation::error(self.name(), format!("'{}' is not an OARS 1.0 attribute", id))
                        .remedy("Use attribute ids from https://hughsie.github.io/oars/"),
                );
            }
            if let Err(message) = level.parse::<RatingLevel>() {
                violations.push(
                    ValidationViolation::error(self.name(), message)
                        .expected("none, mild, moderate or intense", level.as_str()),
                );
            }
        }
        violations
    }
}

pub struct ReleaseRule;

impl ValidationRule for ReleaseRule {
    fn name(&self) -> &'static str { "releases" }

    fn validate(&self, input: &RawDescriptor) -> Vec<ValidationViolation> {
        let Some(appdata) = input.appdata.as_ref() else {
            return vec![];
        };

        let mut violations = vec![];
        let mut normalized: BTreeMap<semver::Version, &str> = BTreeMap::new();

        for (version, date) in &appdata.releases {
            match ReleaseVersion::parse(version) {
                Ok(parsed) => {
                    if let Some(previous) = normalized.insert(parsed.version.clone(), version) {
                        violations.push(
                            ValidationViolation::error(
                                self.name(),
                                format!("releases '{}' and '{}' are the same version", previous, version),
                            )
                            .remedy("Remove one of the duplicate release entries"),
                        );
                    }
                }
                Err(message) => violations.push(
                    ValidationViolation::error(self.name(), message)
                        .expected("MAJOR[.MINOR[.PATCH]][-PRERELEASE]", version.as_str()),
                ),
            }

            if let Err(message) = parse_release_date(date) {
                violations.push(
                    ValidationViolation::error(self.name(), message)
                        .expected("YYYY-MM-DD", date.as_str()),
                );
            }
        }
        violations
    }
}

pub struct LicenseRule;

impl ValidationRule for LicenseRule {
    fn name(&self) -> &'static str { "license" }

    fn validate(&self, input: &RawDescriptor) -> Vec<ValidationViolation> {
        let raw = input.appdata.as_ref().and_then(|a| a.license.as_deref());
        match License::parse(raw) {
            Ok(_) => vec![],
            Err(message) => vec![ValidationViolation::error(self.name(), message)
                .remedy("Use an SPDX expression or LicenseRef-proprietary[=URL]")],
        }
    }
}

pub struct SummaryRule;

impl ValidationRule for SummaryRule {
    fn name(&self) -> &'static str { "summary" }

    fn validate(&self, input: &RawDescriptor) -> Vec<ValidationViolation> {
        let Some(summary) = input.appdata.as_ref().and_then(|a| a.summary.as_deref()) else {
            return vec![];
        };

        let mut violations = vec![];
        if summary.contains('\n') {
            violations.push(ValidationViolation::error(self.name(), "summary must be a single line"));
        }
        let chars = summary.trim().chars().count();
        if chars > SUMMARY_SOFT_LIMIT {
            violations.push(
                ValidationViolation::warning(self.name(), "summary is longer than software centers display")
                    .expected(format!("<= {} characters", SUMMARY_SOFT_LIMIT), format!("{} characters", chars)),
            );
        }
        if summary.trim_end().ends_with('.') {
            violations.push(ValidationViolation::warning(self.name(), "summary should not end with a period"));
        }
        violations
    }
}

/// Validator runs every rule and applies the blocking policy
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(AppIdRule),
                Box::new(CategoryRule),
                Box::new(ContentRatingRule),
                Box::new(ReleaseRule),
                Box::new(LicenseRule),
                Box::new(SummaryRule),
            ],
        }
    }

    pub fn validate(&self, input: &RawDescriptor) -> ValidationResult {
        let mut all_violations = vec![];

        for rule in &self.rules {
            all_violations.extend(rule.validate(input));
        }

        let mut result = ValidationResult {
            valid: true,
            violations: all_violations,
            app_id: format!(
                "{}.{}",
                input.common.reverse_url.trim(),
                normalize_name(&input.common.name)
            ),
        };
        result.valid = !result.has_errors();
        result
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
