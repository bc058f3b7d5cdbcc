use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use taskmarket_core::{AgentId, MarketConfig, SettlementTarget};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub settlement: SettlementTarget,
    pub logging: LoggingConfig,
    pub market: MarketConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty`, `compact` or `json`
    pub format: String,
    pub file_output: Option<PathBuf>,
    pub module_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_output: None,
            module_filters: HashMap::new(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            settlement: SettlementTarget {
                endpoint: "memory://local".to_string(),
                token_contract: String::new(),
                escrow_contract: String::new(),
                network: "local".to_string(),
            },
            logging: LoggingConfig::default(),
            market: MarketConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// File (or defaults), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        // Settlement references are passed through untouched
        if let Ok(endpoint) = env::var("TASKMARKET_SETTLEMENT_ENDPOINT") {
            self.settlement.endpoint = endpoint;
        }
        if let Ok(token) = env::var("TASKMARKET_TOKEN_CONTRACT") {
            self.settlement.token_contract = token;
        }
        if let Ok(escrow) = env::var("TASKMARKET_ESCROW_CONTRACT") {
            self.settlement.escrow_contract = escrow;
        }
        if let Ok(network) = env::var("TASKMARKET_NETWORK") {
            if !network.is_empty() {
                self.settlement.network = network;
            }
        }

        // Arbitration
        if let Ok(quorum) = env::var("TASKMARKET_QUORUM") {
            if let Ok(val) = quorum.parse() {
                self.market.quorum = val;
            }
        }
        if let Ok(council) = env::var("TASKMARKET_COUNCIL") {
            if !council.is_empty() {
                self.market.council = council
                    .split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.parse::<AgentId>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .context("TASKMARKET_COUNCIL")?;
            }
        }

        // Logging
        if let Ok(level) = env::var("TASKMARKET_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
        if let Ok(format) = env::var("TASKMARKET_LOG_FORMAT") {
            if !format.is_empty() {
                self.logging.format = format;
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.market.validate()?;
        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            bail!(
                "unknown log format {:?} (expected pretty, compact or json)",
                self.logging.format
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmarket_core::InProgressCancelPolicy;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskmarket.toml");

        let mut config = NodeConfig::default();
        config.settlement.token_contract = "0xusdc".to_string();
        config.market.council = vec![
            AgentId::from_bytes([1; 20]),
            AgentId::from_bytes([2; 20]),
            AgentId::from_bytes([3; 20]),
        ];
        config.market.in_progress_cancel = InProgressCancelPolicy::PenalizeCreator { points: 10 };
        config
            .logging
            .module_filters
            .insert("taskmarket_core::escrow".to_string(), "debug".to_string());
        config.save_to_file(&path).unwrap();

        let loaded = NodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.settlement, config.settlement);
        assert_eq!(loaded.market, config.market);
        assert_eq!(loaded.logging, config.logging);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(
            &path,
            r#"
[settlement]
endpoint = "https://rpc.example"

[market]
quorum = 1
council = ["0x0101010101010101010101010101010101010101"]
"#,
        )
        .unwrap();

        let config = NodeConfig::from_file(&path).unwrap();
        assert_eq!(config.settlement.endpoint, "https://rpc.example");
        assert_eq!(config.settlement.network, "");
        assert_eq!(config.market.quorum, 1);
        assert_eq!(config.market.baseline_score, 100);
        assert_eq!(config.logging.format, "pretty");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_format_rejected() {
        let mut config = NodeConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("TASKMARKET_SETTLEMENT_ENDPOINT", "https://sepolia.example");
        env::set_var("TASKMARKET_TOKEN_CONTRACT", "0xtoken");
        env::set_var("TASKMARKET_QUORUM", "2");
        env::set_var(
            "TASKMARKET_COUNCIL",
            "0x0101010101010101010101010101010101010101, 0x0202020202020202020202020202020202020202",
        );
        env::set_var("TASKMARKET_LOG_FORMAT", "json");

        let mut config = NodeConfig::default();
        config.apply_env_overrides().unwrap();

        assert_eq!(config.settlement.endpoint, "https://sepolia.example");
        assert_eq!(config.settlement.token_contract, "0xtoken");
        assert_eq!(config.market.quorum, 2);
        assert_eq!(config.market.council.len(), 2);
        assert_eq!(config.logging.format, "json");
        assert!(config.validate().is_ok());

        env::set_var("TASKMARKET_COUNCIL", "0x1234");
        assert!(NodeConfig::default().apply_env_overrides().is_err());

        for var in [
            "TASKMARKET_SETTLEMENT_ENDPOINT",
            "TASKMARKET_TOKEN_CONTRACT",
            "TASKMARKET_QUORUM",
            "TASKMARKET_COUNCIL",
            "TASKMARKET_LOG_FORMAT",
        ] {
            env::remove_var(var);
        }
    }
}
