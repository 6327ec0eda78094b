use crate::core::error::{Error, Result};
use crate::core::ruleset::{AddressRange, ChainSpec, Family, Protocol};
use crate::utils::allowlist_search_paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Allowlist shipped with the binary, used when no file overrides it.
pub const EMBEDDED_ALLOWLIST: &str = include_str!("../data/allowlist.json");

/// Ranges for one address family
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyConfig {
    /// Whether a missing packet filter for this family fails the run.
    /// Unset means [`AllowlistConfig::is_required`]'s per-family default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    /// Loopback and cluster ranges, always accepted
    #[serde(default)]
    pub always_allow: Vec<AddressRange>,
    /// The proxy provider's published ranges
    #[serde(default)]
    pub trusted: Vec<AddressRange>,
}

/// Complete allowlist configuration: the chain, its ports, and per-family ranges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistConfig {
    /// Revision of the range data, shown in reports
    #[serde(default)]
    pub version: u32,
    #[serde(default = "default_chain")]
    pub chain: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    pub ipv4: FamilyConfig,
    pub ipv6: FamilyConfig,
}

fn default_chain() -> String {
    "ORIGIN_ALLOWLIST".to_string()
}

fn default_provider() -> String {
    "the reverse proxy".to_string()
}

fn default_ports() -> Vec<u16> {
    vec![80, 443]
}

impl AllowlistConfig {
    pub fn family(&self, family: Family) -> &FamilyConfig {
        match family {
            Family::Ipv4 => &self.ipv4,
            Family::Ipv6 => &self.ipv6,
        }
    }

    /// Whether `family` must be applied. IPv4 is required unless the file
    /// says otherwise; IPv6 is optional.
    pub fn is_required(&self, family: Family) -> bool {
        self.family(family)
            .required
            .unwrap_or(family == Family::Ipv4)
    }

    pub fn chain_spec(&self) -> ChainSpec {
        ChainSpec {
            name: self.chain.clone(),
            protocol: self.protocol,
            ports: self.ports.clone(),
        }
    }

    /// Parses and validates a JSON allowlist document.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the JSON is malformed or [`AllowlistConfig::validate`] fails.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the chain name, the ports, and that every range is a canonical
    /// range of the family it is listed under.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        crate::validators::validate_chain_name(&self.chain).map_err(|message| {
            Error::Validation {
                field: "chain".to_string(),
                message,
            }
        })?;

        crate::validators::validate_ports(&self.ports).map_err(|message| Error::Validation {
            field: "ports".to_string(),
            message,
        })?;

        for (family, key, cfg) in [
            (Family::Ipv4, "ipv4", &self.ipv4),
            (Family::Ipv6, "ipv6", &self.ipv6),
        ] {
            for (list, ranges) in [("always_allow", &cfg.always_allow), ("trusted", &cfg.trusted)] {
                for range in ranges {
                    crate::validators::validate_range(range, family).map_err(|message| {
                        Error::Validation {
                            field: format!("{key}.{list}"),
                            message,
                        }
                    })?;
                }
            }
        }

        Ok(())
    }
}

impl Default for AllowlistConfig {
    fn default() -> Self {
        Self {
            version: 0,
            chain: default_chain(),
            provider: default_provider(),
            protocol: Protocol::default(),
            ports: default_ports(),
            ipv4: FamilyConfig::default(),
            ipv6: FamilyConfig::default(),
        }
    }
}

/// Where a loaded configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Embedded,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Embedded => write!(f, "built-in allowlist"),
        }
    }
}

/// Loads the allowlist configuration.
///
/// An explicit `path` must exist. Without one, the XDG config file and then
/// `/etc/originwall/allowlist.json` are tried before falling back to the
/// embedded allowlist.
///
/// # Async
/// Uses `tokio::fs` for file reads.
///
/// # Errors
///
/// Returns `Err` if an explicit path cannot be read, or if any file found is
/// malformed or invalid. A broken file is never silently skipped.
pub async fn load_allowlist(path: Option<&Path>) -> Result<(AllowlistConfig, ConfigSource)> {
    if let Some(path) = path {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("Cannot read {}: {e}", path.display())))?;
        return parse_file(&json, path).map(|c| (c, ConfigSource::File(path.to_path_buf())));
    }

    for candidate in allowlist_search_paths() {
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            info!("Loading allowlist from {}", candidate.display());
            let json = tokio::fs::read_to_string(&candidate).await?;
            return parse_file(&json, &candidate).map(|c| (c, ConfigSource::File(candidate)));
        }
        debug!("No allowlist at {}", candidate.display());
    }

    Ok((load_embedded()?, ConfigSource::Embedded))
}

/// Parses the allowlist compiled into the binary.
///
/// # Errors
///
/// Returns `Err` only if the embedded document is itself invalid.
pub fn load_embedded() -> Result<AllowlistConfig> {
    AllowlistConfig::from_json(EMBEDDED_ALLOWLIST)
        .map_err(|e| Error::Internal(format!("Built-in allowlist is invalid: {e}")))
}

fn parse_file(json: &str, path: &Path) -> Result<AllowlistConfig> {
    AllowlistConfig::from_json(json).map_err(|e| match e {
        Error::Serialization(e) => Error::Config(format!("{}: {e}", path.display())),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_allowlist_is_valid() {
        let config = load_embedded().unwrap();
        assert_eq!(config.chain, "ORIGIN_ALLOWLIST");
        assert_eq!(config.ports, vec![80, 443]);
        assert!(config.is_required(Family::Ipv4));
        assert!(!config.is_required(Family::Ipv6));
        assert_eq!(
            config.ipv4.always_allow[0],
            "10.42.0.0/16".parse::<AddressRange>().unwrap()
        );
        assert!(!config.ipv4.trusted.is_empty());
        assert!(!config.ipv6.trusted.is_empty());
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = AllowlistConfig::from_json(
            r#"{ "ipv4": { "required": true, "trusted": ["198.51.100.0/24"] }, "ipv6": {} }"#,
        )
        .unwrap();
        assert_eq!(config.chain, "ORIGIN_ALLOWLIST");
        assert_eq!(config.ports, vec![80, 443]);
        assert_eq!(config.protocol, Protocol::Tcp);
        assert!(config.ipv6.trusted.is_empty());
        assert!(!config.is_required(Family::Ipv6));
    }

    #[test]
    fn test_file_and_default_agree_on_required_families() {
        let from_file = AllowlistConfig::from_json(
            r#"{ "ipv4": { "trusted": ["198.51.100.0/24"] }, "ipv6": {} }"#,
        )
        .unwrap();
        let built_in = AllowlistConfig::default();

        for family in [Family::Ipv4, Family::Ipv6] {
            assert_eq!(from_file.is_required(family), built_in.is_required(family));
        }
        assert!(from_file.is_required(Family::Ipv4));
        assert!(!from_file.is_required(Family::Ipv6));
    }

    #[test]
    fn test_explicit_required_overrides_default() {
        let config = AllowlistConfig::from_json(
            r#"{ "ipv4": { "required": false }, "ipv6": { "required": true } }"#,
        )
        .unwrap();
        assert!(!config.is_required(Family::Ipv4));
        assert!(config.is_required(Family::Ipv6));
    }

    #[test]
    fn test_rejects_range_under_wrong_family() {
        let err = AllowlistConfig::from_json(
            r#"{ "ipv4": { "trusted": ["2400:cb00::/32"] }, "ipv6": {} }"#,
        )
        .unwrap_err();
        match err {
            Error::Validation { field, .. } => assert_eq!(field, "ipv4.trusted"),
            other => panic!("expected Validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_duplicate_ports() {
        let err = AllowlistConfig::from_json(r#"{ "ports": [443, 443], "ipv4": {}, "ipv6": {} }"#)
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "ports"));
    }

    #[test]
    fn test_rejects_bad_chain_name() {
        let err =
            AllowlistConfig::from_json(r#"{ "chain": "INPUT", "ipv4": {}, "ipv6": {} }"#)
                .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "chain"));
    }

    #[test]
    fn test_rejects_unparseable_range() {
        let err = AllowlistConfig::from_json(
            r#"{ "ipv4": { "trusted": ["not-a-cidr"] }, "ipv6": {} }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[tokio::test]
    async fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowlist.json");
        std::fs::write(
            &path,
            r#"{ "chain": "EDGE", "ipv4": { "trusted": ["203.0.113.0/24"] }, "ipv6": {} }"#,
        )
        .unwrap();

        let (config, source) = load_allowlist(Some(path.as_path())).await.unwrap();
        assert_eq!(config.chain, "EDGE");
        assert_eq!(source, ConfigSource::File(path));
    }

    #[tokio::test]
    async fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let err = load_allowlist(Some(path.as_path())).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_load_malformed_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowlist.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_allowlist(Some(path.as_path())).await.unwrap_err();
        match err {
            Error::Config(msg) => assert!(msg.contains("allowlist.json")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }
}
