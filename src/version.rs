//! Tolerant semantic version handling
//!
//! Kubernetes version strings come in several shapes (`1.17.0`, `v1.17`,
//! `v1.17.0+vmware.1`); this module parses them all into [`semver::Version`]
//! and provides the comparisons the orchestrator needs.

use semver::Version;

use crate::{Error, Result};

/// Parse a version string tolerantly.
///
/// Accepts an optional leading `v`/`V` and partial `X` or `X.Y` forms, where
/// missing components default to zero. Partial forms are only padded when the
/// string carries no pre-release or build metadata.
pub fn parse_tolerant(input: &str) -> Result<Version> {
    let trimmed = input.trim();
    let stripped = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    if stripped.is_empty() {
        return Err(Error::validation(format!(
            "invalid version {:?}: empty after trimming",
            input
        )));
    }

    let has_metadata = stripped.contains('-') || stripped.contains('+');
    let candidate = if has_metadata {
        stripped.to_string()
    } else {
        match stripped.matches('.').count() {
            0 => format!("{}.0.0", stripped),
            1 => format!("{}.0", stripped),
            _ => stripped.to_string(),
        }
    };

    Version::parse(&candidate)
        .map_err(|e| Error::validation(format!("invalid version {:?}: {}", input, e)))
}

/// Whether moving from `base` to `target` is a minor-version bump.
///
/// True only within the same major version; a major jump is not a minor bump
/// and neither is a patch-level change.
pub fn is_minor_bump(base: &Version, target: &Version) -> bool {
    base.major == target.major && base.minor < target.minor
}

/// Compute the minimum and maximum version across a set of machines.
///
/// Each item pairs a machine identifier (used in error messages) with its
/// `spec.version`. A missing version is fatal; an empty string is skipped.
/// Returns `None` when no machine carried a non-empty version.
pub fn min_max_versions<I>(versions: I) -> Result<Option<(Version, Version)>>
where
    I: IntoIterator<Item = (String, Option<String>)>,
{
    let mut bounds: Option<(Version, Version)> = None;

    for (machine, version) in versions {
        let Some(raw) = version else {
            return Err(Error::validation(format!(
                "nil control plane version for machine {}",
                machine
            )));
        };
        if raw.is_empty() {
            continue;
        }

        let parsed = parse_tolerant(&raw).map_err(|e| {
            Error::validation(format!(
                "invalid control plane version {:?} for machine {}: {}",
                raw, machine, e
            ))
        })?;

        bounds = Some(match bounds {
            None => (parsed.clone(), parsed),
            Some((min, max)) => (
                if parsed < min { parsed.clone() } else { min },
                if parsed > max { parsed } else { max },
            ),
        });
    }

    Ok(bounds)
}
