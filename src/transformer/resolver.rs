//! Definition resolution
//!
//! Maps a definition name pattern plus an optional service version to one
//! concrete definition. Exact names win over prefix or regular-expression
//! matches. An empty service version selects the highest semantic version
//! among compatible releases. Among definitions supporting the chosen version,
//! the lexicographically greatest name wins.

use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;
use regex::Regex;
use semver::Version;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::{ComponentDefinition, ComponentVersion, ShardingDefinition};

fn is_plain_name(pattern: &str) -> bool {
    !pattern.is_empty()
        && pattern
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Whether `name` starts with `pattern`, or matches it as a regular expression
///
/// Patterns made only of name characters are never treated as regular
/// expressions, so "mysql" does not match "my-mysql".
pub fn prefix_or_regex_matched(name: &str, pattern: &str) -> bool {
    if name.starts_with(pattern) {
        return true;
    }
    if is_plain_name(pattern) {
        return false;
    }
    Regex::new(pattern).is_ok_and(|re| re.is_match(name))
}

/// Definitions matching a pattern; exact name matches shadow pattern matches
pub fn match_definitions<'a, T: ResourceExt>(items: &'a [T], pattern: &str) -> Vec<&'a T> {
    let exact: Vec<&T> = items.iter().filter(|d| d.name_any() == pattern).collect();
    if !exact.is_empty() {
        return exact;
    }
    items
        .iter()
        .filter(|d| prefix_or_regex_matched(&d.name_any(), pattern))
        .collect()
}

/// Parse a service version, accepting a leading "v"
pub fn parse_service_version(version: &str) -> Result<Version> {
    let trimmed = version.strip_prefix('v').unwrap_or(version);
    Version::parse(trimmed)
        .map_err(|e| Error::ValidationError(format!("invalid service version {version}: {e}")))
}

/// Whether `candidate` satisfies the requested version; an empty request matches anything
fn service_version_matched(requested: &str, candidate: &str) -> Result<bool> {
    if requested.is_empty() {
        return Ok(true);
    }
    let requested = parse_service_version(requested)?;
    match parse_service_version(candidate) {
        Ok(candidate) => Ok(requested == candidate),
        Err(_) => {
            debug!(candidate, "Skipping unparsable service version");
            Ok(false)
        }
    }
}

/// Service versions a definition can run
///
/// Includes the definition's own version and every release of an Available
/// ComponentVersion whose compatibility rules match the definition name.
pub fn compatible_service_versions(
    comp_def: &ComponentDefinition,
    comp_versions: &[ComponentVersion],
) -> Result<BTreeSet<String>> {
    let name = comp_def.name_any();
    let mut versions = BTreeSet::new();
    if !comp_def.spec.service_version.is_empty() {
        versions.insert(comp_def.spec.service_version.clone());
    }

    for comp_version in comp_versions {
        let releases: BTreeSet<&str> = comp_version
            .spec
            .compatibility_rules
            .iter()
            .filter(|rule| {
                rule.comp_defs
                    .iter()
                    .any(|pattern| prefix_or_regex_matched(&name, pattern))
            })
            .flat_map(|rule| rule.releases.iter().map(String::as_str))
            .collect();
        if releases.is_empty() {
            continue;
        }
        if !comp_version.is_available() {
            return Err(Error::ReferenceNotAvailable {
                kind: "ComponentVersion",
                name: comp_version.name_any(),
                reason: "phase is not Available".to_string(),
            });
        }
        versions.extend(
            comp_version
                .spec
                .releases
                .iter()
                .filter(|r| releases.contains(r.name.as_str()))
                .map(|r| r.service_version.clone()),
        );
    }
    Ok(versions)
}

/// Resolve a component definition pattern and requested service version
///
/// Returns the chosen definition and the concrete service version.
pub fn resolve_component_definition(
    pattern: &str,
    service_version: &str,
    comp_defs: &[ComponentDefinition],
    comp_versions: &[ComponentVersion],
) -> Result<(ComponentDefinition, String)> {
    let candidates = match_definitions(comp_defs, pattern);

    // service version -> definition name -> definition
    let mut by_version: BTreeMap<String, BTreeMap<String, &ComponentDefinition>> = BTreeMap::new();
    for comp_def in candidates {
        for version in compatible_service_versions(comp_def, comp_versions)? {
            if service_version_matched(service_version, &version)? {
                by_version
                    .entry(version)
                    .or_default()
                    .insert(comp_def.name_any(), comp_def);
            }
        }
    }

    // Every key already satisfies a non-empty request, so the latest key is the answer either way
    let chosen_version = latest_version(by_version.keys().map(String::as_str)).unwrap_or_default();

    by_version
        .get(&chosen_version)
        .and_then(|defs| defs.values().next_back())
        .map(|def| ((*def).clone(), chosen_version.clone()))
        .ok_or_else(|| {
            Error::ValidationError(format!(
                "no matched component definition found with componentDef \"{pattern}\" and serviceVersion \"{service_version}\""
            ))
        })
}

/// Highest version by semantic ordering; an empty version ranks lowest
/// and unparsable versions are ignored
pub fn latest_version<'a>(versions: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut ranked: Vec<(Option<Version>, &str)> = versions
        .into_iter()
        .filter_map(|v| {
            if v.is_empty() {
                Some((None, v))
            } else {
                parse_service_version(v).ok().map(|parsed| (Some(parsed), v))
            }
        })
        .collect();
    ranked.sort();
    ranked.last().map(|(_, v)| v.to_string())
}

/// Resolve a sharding definition pattern, choosing the greatest name among matches
pub fn resolve_sharding_definition(
    pattern: &str,
    sharding_defs: &[ShardingDefinition],
) -> Result<ShardingDefinition> {
    match_definitions(sharding_defs, pattern)
        .into_iter()
        .max_by_key(|d| d.name_any())
        .cloned()
        .ok_or_else(|| {
            Error::ValidationError(format!(
                "no sharding definition found with the name \"{pattern}\""
            ))
        })
}
