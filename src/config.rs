//! YAML configuration loading and validation
//!
//! Configuration is fixed at startup: ranges cannot be added, removed, or
//! resized without a restart. Validation failures are fatal at load so a
//! misconfigured replica never serves admission.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result, NODE_PORT_MAX, NODE_PORT_MIN};

/// One named port range bound to namespaces and/or a label selector
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortRangeConfig {
    /// First port of the range, inclusive
    pub start: i32,
    /// Last port of the range, inclusive
    pub end: i32,
    /// Namespaces this range serves; `"*"` matches any namespace
    pub namespaces: Vec<String>,
    /// Label selector (subset match); empty means no label matching
    pub labels: BTreeMap<String, String>,
    /// Operator-facing description, surfaced in range statistics
    pub description: String,
}

impl PortRangeConfig {
    /// Whether `port` lies within `[start, end]`
    pub fn contains(&self, port: i32) -> bool {
        port >= self.start && port <= self.end
    }

    /// Number of ports the range covers
    pub fn capacity(&self) -> i32 {
        self.end - self.start + 1
    }
}

/// Identity of the backing ConfigMap plus conflict-retry parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Name of the ConfigMap holding serialized bitmaps
    pub config_map_name: String,
    /// Namespace of the ConfigMap
    pub config_map_namespace: String,
    /// Maximum save attempts on optimistic-concurrency conflict
    pub retry_attempts: u32,
    /// Initial delay between retries, as a duration string (e.g. "1s")
    pub retry_delay: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            config_map_name: "nodeport-allocator-state".to_string(),
            config_map_namespace: "kube-system".to_string(),
            retry_attempts: 3,
            retry_delay: "1s".to_string(),
        }
    }
}

impl StorageConfig {
    /// Parsed form of `retry_delay`
    ///
    /// Validation guarantees this cannot fail after [`GlobalConfig::load`].
    pub fn retry_delay(&self) -> Result<Duration> {
        parse_duration(&self.retry_delay)
    }
}

/// Top-level allocator configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    /// Named port ranges; BTreeMap iteration order is the stable
    /// lexicographic order range resolution relies on
    pub port_ranges: BTreeMap<String, PortRangeConfig>,
    /// Range used when neither labels nor namespaces match
    pub default_range: String,
    /// Whether a Service carrying an explicit port outside its matched
    /// range is admitted (untracked) instead of denied
    pub allow_outside_range_ports: bool,
    /// Backing-store identity and retry parameters
    pub storage: StorageConfig,
    /// Default log level when RUST_LOG is unset
    pub log_level: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            port_ranges: BTreeMap::new(),
            default_range: String::new(),
            allow_outside_range_ports: false,
            storage: StorageConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_yaml(&data)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(data)
            .map_err(|e| Error::config(format!("failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration; called by [`GlobalConfig::load`]
    pub fn validate(&self) -> Result<()> {
        if self.port_ranges.is_empty() {
            return Err(Error::config("at least one port range must be configured"));
        }

        if self.default_range.is_empty() {
            return Err(Error::config("a default port range must be specified"));
        }

        if !self.port_ranges.contains_key(&self.default_range) {
            return Err(Error::config(format!(
                "default port range {} is not defined",
                self.default_range
            )));
        }

        for (name, range) in &self.port_ranges {
            if range.start >= range.end {
                return Err(Error::config(format!(
                    "port range {}: start {} must be less than end {}",
                    name, range.start, range.end
                )));
            }
            if range.start < NODE_PORT_MIN || range.end > NODE_PORT_MAX {
                return Err(Error::config(format!(
                    "port range {}: [{}, {}] exceeds the NodePort interval [{}, {}]",
                    name, range.start, range.end, NODE_PORT_MIN, NODE_PORT_MAX
                )));
            }
        }

        self.validate_disjoint()?;

        parse_duration(&self.storage.retry_delay)?;

        if self.storage.retry_attempts == 0 {
            return Err(Error::config("storage retryAttempts must be at least 1"));
        }

        let labelled: Vec<&str> = self
            .port_ranges
            .iter()
            .filter(|(_, r)| !r.labels.is_empty())
            .map(|(n, _)| n.as_str())
            .collect();
        if labelled.len() > 1 {
            warn!(
                ranges = ?labelled,
                "multiple ranges define label selectors; a Service matching more \
                 than one resolves to the lexicographically first"
            );
        }

        Ok(())
    }

    // Ranges share one port domain, so overlapping intervals would let two
    // ranges hand out the same port.
    fn validate_disjoint(&self) -> Result<()> {
        let mut intervals: Vec<(&str, i32, i32)> = self
            .port_ranges
            .iter()
            .map(|(name, r)| (name.as_str(), r.start, r.end))
            .collect();
        intervals.sort_by_key(|(_, start, _)| *start);

        for pair in intervals.windows(2) {
            let (prev_name, _, prev_end) = pair[0];
            let (name, start, _) = pair[1];
            if start <= prev_end {
                return Err(Error::config(format!(
                    "port ranges {} and {} overlap",
                    prev_name, name
                )));
            }
        }
        Ok(())
    }
}

/// Parse a duration string of the form `500ms`, `1s`, `2m`, or `1h`
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (value, unit) = s
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| s.split_at(i))
        .ok_or_else(|| Error::config(format!("duration {:?} is missing a unit", s)))?;

    let value: u64 = value
        .parse()
        .map_err(|_| Error::config(format!("invalid duration {:?}", s)))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(Error::config(format!(
            "invalid duration unit {:?} in {:?}",
            unit, s
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
portRanges:
  dev:
    start: 31500
    end: 31999
    namespaces: ["dev", "test"]
    description: "development"
  prod:
    start: 30000
    end: 30999
    namespaces: ["prod"]
    labels:
      tier: production
    description: "production"
defaultRange: dev
allowOutsideRangePorts: false
storage:
  configMapName: nodeport-state
  configMapNamespace: kube-system
  retryAttempts: 5
  retryDelay: 500ms
logLevel: debug
"#;

    #[test]
    fn test_parses_full_config() {
        let config = GlobalConfig::from_yaml(VALID).unwrap();
        assert_eq!(config.port_ranges.len(), 2);
        assert_eq!(config.default_range, "dev");
        assert!(!config.allow_outside_range_ports);
        assert_eq!(config.storage.config_map_name, "nodeport-state");
        assert_eq!(config.storage.retry_attempts, 5);
        assert_eq!(
            config.storage.retry_delay().unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(config.log_level, "debug");

        let prod = &config.port_ranges["prod"];
        assert_eq!(prod.start, 30000);
        assert_eq!(prod.end, 30999);
        assert_eq!(prod.labels["tier"], "production");
        assert_eq!(prod.capacity(), 1000);
        assert!(prod.contains(30500));
        assert!(!prod.contains(31000));
    }

    #[test]
    fn test_storage_defaults() {
        let config = GlobalConfig::from_yaml(
            r#"
portRanges:
  dev:
    start: 31500
    end: 31999
defaultRange: dev
"#,
        )
        .unwrap();
        assert_eq!(config.storage.config_map_name, "nodeport-allocator-state");
        assert_eq!(config.storage.config_map_namespace, "kube-system");
        assert_eq!(config.storage.retry_attempts, 3);
        assert_eq!(config.storage.retry_delay, "1s");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_rejects_empty_ranges() {
        let err = GlobalConfig::from_yaml("defaultRange: dev").unwrap_err();
        assert!(err.to_string().contains("at least one port range"));
    }

    #[test]
    fn test_rejects_missing_default() {
        let err = GlobalConfig::from_yaml(
            r#"
portRanges:
  dev: {start: 31500, end: 31999}
defaultRange: nope
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let err = GlobalConfig::from_yaml(
            r#"
portRanges:
  dev: {start: 31999, end: 31500}
defaultRange: dev
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("less than end"));
    }

    #[test]
    fn test_rejects_ports_outside_nodeport_interval() {
        let err = GlobalConfig::from_yaml(
            r#"
portRanges:
  dev: {start: 20000, end: 31999}
defaultRange: dev
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("NodePort interval"));
    }

    #[test]
    fn test_rejects_overlapping_ranges() {
        let err = GlobalConfig::from_yaml(
            r#"
portRanges:
  a: {start: 30000, end: 30999}
  b: {start: 30500, end: 31499}
defaultRange: a
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_adjacent_ranges_are_disjoint() {
        let config = GlobalConfig::from_yaml(
            r#"
portRanges:
  a: {start: 30000, end: 30999}
  b: {start: 31000, end: 31999}
defaultRange: a
"#,
        );
        assert!(config.is_ok());
    }

    #[test]
    fn test_rejects_bad_retry_delay() {
        let err = GlobalConfig::from_yaml(
            r#"
portRanges:
  dev: {start: 31500, end: 31999}
defaultRange: dev
storage:
  retryDelay: soon
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duration"));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
    }
}
