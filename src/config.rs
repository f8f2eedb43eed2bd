use crate::error::{MimirError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Resolver configuration, loadable from TOML with env-var overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Where the cache snapshot lives when the host persists it.
    pub cache_path: PathBuf,
    /// Longest accepted CNAME/DNAME chain before the query fails.
    pub max_cname_chain: u32,
    /// Outbound attempts per sub-query before giving up.
    pub retry_budget: u32,
    /// Per-hop response timeout in milliseconds.
    pub query_timeout_ms: u64,
    /// Whole-request deadline in milliseconds.
    pub request_deadline_ms: u64,
    /// Payload size advertised via EDNS.
    pub edns_payload_size: u16,
    /// Prefer IPv6 name-server addresses when both families exist.
    pub prefer_ipv6: bool,
    /// Validate responses and chase the chain of trust.
    pub dnssec_validation: bool,
    /// Optional trust anchor file in DS/DNSKEY presentation format.
    pub trust_anchor_file: Option<PathBuf>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            cache_path: PathBuf::from("/tmp/mimir-cache"),
            max_cname_chain: 12,
            retry_budget: 4,
            query_timeout_ms: 1500,
            request_deadline_ms: 10_000,
            edns_payload_size: crate::dnssec::constants::DNSSEC_UDP_SIZE,
            prefer_ipv6: false,
            dnssec_validation: true,
            trust_anchor_file: None,
        }
    }
}

impl ResolverConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut config: ResolverConfig =
            toml::from_str(text).map_err(|e| MimirError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Overlay `MIMIR_*` environment variables onto the current values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("MIMIR_CACHE_PATH") {
            self.cache_path = PathBuf::from(path);
        }
        if let Ok(value) = std::env::var("MIMIR_PREFER_IPV6") {
            self.prefer_ipv6 = matches!(value.as_str(), "1" | "true" | "yes");
        }
        if let Ok(value) = std::env::var("MIMIR_DNSSEC") {
            self.dnssec_validation = !matches!(value.as_str(), "0" | "false" | "no");
        }
        if let Ok(value) = std::env::var("MIMIR_REQUEST_DEADLINE_MS") {
            self.request_deadline_ms = value
                .parse()
                .map_err(|_| MimirError::ConfigParse("bad MIMIR_REQUEST_DEADLINE_MS".into()))?;
        }
        if let Ok(path) = std::env::var("MIMIR_TRUST_ANCHOR_FILE") {
            self.trust_anchor_file = Some(PathBuf::from(path));
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.max_cname_chain == 0 {
            return Err(MimirError::ConfigParse(
                "max_cname_chain must be at least 1".into(),
            ));
        }
        if self.retry_budget == 0 {
            return Err(MimirError::ConfigParse(
                "retry_budget must be at least 1".into(),
            ));
        }
        if self.request_deadline_ms < self.query_timeout_ms {
            return Err(MimirError::ConfigParse(
                "request deadline shorter than per-hop timeout".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ResolverConfig::default();
        assert_eq!(config.max_cname_chain, 12);
        assert!(config.dnssec_validation);
        assert!(config.request_deadline_ms >= config.query_timeout_ms);
    }

    #[test]
    fn toml_overrides() {
        let config = ResolverConfig::from_toml_str(
            r#"
            max_cname_chain = 6
            prefer_ipv6 = true
            cache_path = "/var/lib/mimir/cache"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_cname_chain, 6);
        assert!(config.prefer_ipv6);
        assert_eq!(config.cache_path, PathBuf::from("/var/lib/mimir/cache"));
        // untouched fields keep their defaults
        assert_eq!(config.retry_budget, 4);
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(ResolverConfig::from_toml_str("max_cname_chain = 0").is_err());
        assert!(
            ResolverConfig::from_toml_str("request_deadline_ms = 10\nquery_timeout_ms = 100")
                .is_err()
        );
    }
}
