//! Range selection for a Service
//!
//! A Service resolves to exactly one range, in priority order: label match,
//! explicit namespace match, wildcard namespace match, configured default.
//! Resolution is deterministic: ranges are iterated in lexicographic name
//! order, so identical input always yields the same range.

use std::collections::BTreeMap;

use tracing::warn;

use crate::config::{GlobalConfig, PortRangeConfig};
use crate::{Error, Result, DEFAULT_NAMESPACE};

/// Resolve the range serving `(namespace, labels)`
///
/// An empty namespace is normalized to `"default"` before matching. With
/// multiple label-matching ranges, the lexicographically first wins and a
/// warning names the contenders.
pub fn resolve<'a>(
    config: &'a GlobalConfig,
    namespace: &str,
    labels: &BTreeMap<String, String>,
) -> Result<(&'a str, &'a PortRangeConfig)> {
    let namespace = if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    };

    if let Some(found) = resolve_by_labels(config, labels) {
        return Ok(found);
    }

    if let Some(found) = resolve_by_namespace(config, namespace) {
        return Ok(found);
    }

    let default = config
        .port_ranges
        .get(&config.default_range)
        .ok_or_else(|| {
            Error::config(format!(
                "default port range {} is not defined",
                config.default_range
            ))
        })?;
    Ok((config.default_range.as_str(), default))
}

fn resolve_by_labels<'a>(
    config: &'a GlobalConfig,
    labels: &BTreeMap<String, String>,
) -> Option<(&'a str, &'a PortRangeConfig)> {
    if labels.is_empty() {
        return None;
    }

    let matching: Vec<(&str, &PortRangeConfig)> = config
        .port_ranges
        .iter()
        .filter(|(_, range)| {
            !range.labels.is_empty()
                && range
                    .labels
                    .iter()
                    .all(|(k, v)| labels.get(k) == Some(v))
        })
        .map(|(name, range)| (name.as_str(), range))
        .collect();

    if matching.len() > 1 {
        warn!(
            ranges = ?matching.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            "multiple ranges match the Service labels; using the first"
        );
    }

    matching.into_iter().next()
}

fn resolve_by_namespace<'a>(
    config: &'a GlobalConfig,
    namespace: &str,
) -> Option<(&'a str, &'a PortRangeConfig)> {
    let mut wildcard = None;

    for (name, range) in &config.port_ranges {
        if range.namespaces.iter().any(|ns| ns == namespace) {
            return Some((name.as_str(), range));
        }
        if wildcard.is_none() && range.namespaces.iter().any(|ns| ns == "*") {
            wildcard = Some((name.as_str(), range));
        }
    }

    wildcard
}
