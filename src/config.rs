//! Configuration management for the wallet engine
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::state::ChainType;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    pub chains: HashMap<String, ChainSettings>,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Timings shared by every chain monitor
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub ping_interval_ms: u64,
    /// Lease length; a lock not pinged for this long may be taken over
    pub expiration_interval_ms: u64,
    pub lock_poll_delay_ms: u64,
    pub max_start_jitter_ms: u64,
    pub loop_delay_ms: u64,
    pub network_down_delay_ms: u64,
    /// SUBMITTED and REPLACED_PENDING records are re-checked every Nth iteration
    pub confirmation_check_every: u64,
    pub fee_warmup_timeout_ms: u64,
    pub fee_refresh_interval_ms: u64,
    pub db_retry_max_elapsed_ms: u64,
    /// How often a standby instance retries to become the active monitor
    pub standby_retry_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 5_000,
            expiration_interval_ms: 30_000,
            lock_poll_delay_ms: 1_000,
            max_start_jitter_ms: 1_000,
            loop_delay_ms: 2_000,
            network_down_delay_ms: 20_000,
            confirmation_check_every: 5,
            fee_warmup_timeout_ms: 60_000,
            fee_refresh_interval_ms: 30_000,
            db_retry_max_elapsed_ms: 10_000,
            standby_retry_secs: 60,
        }
    }
}

impl MonitorConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn loop_delay(&self) -> Duration {
        Duration::from_millis(self.loop_delay_ms)
    }

    pub fn network_down_delay(&self) -> Duration {
        Duration::from_millis(self.network_down_delay_ms)
    }

    pub fn fee_warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.fee_warmup_timeout_ms)
    }

    pub fn fee_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.fee_refresh_interval_ms)
    }

    pub fn db_retry_max_elapsed(&self) -> Duration {
        Duration::from_millis(self.db_retry_max_elapsed_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.ping_interval_ms == 0 {
            anyhow::bail!("monitor.ping_interval_ms must be positive");
        }
        if self.expiration_interval_ms < 3 * self.ping_interval_ms {
            anyhow::bail!(
                "monitor.expiration_interval_ms ({}) must be at least 3 x ping_interval_ms ({})",
                self.expiration_interval_ms,
                self.ping_interval_ms
            );
        }
        if self.confirmation_check_every == 0 {
            anyhow::bail!("monitor.confirmation_check_every must be positive");
        }
        Ok(())
    }
}

/// Per-chain wallet parameters
#[derive(Debug, Clone, Deserialize)]
pub struct ChainSettings {
    pub chain_type: ChainType,
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Confirmations after which a transaction is considered final
    #[serde(default)]
    pub finalization_blocks: Option<u64>,
    /// New fee = old fee x percent / 100
    #[serde(default = "default_escalation_percent")]
    pub fee_escalation_percent: u64,
    /// PENDING records not seen on chain after this long are replaced
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,
    /// Blocks before `execute_until_block` after which submission stops
    #[serde(default)]
    pub deadline_block_offset: u64,
    #[serde(default)]
    pub deadline_time_offset_secs: i64,
    #[serde(default)]
    pub dust_amount: u64,
    /// Added on top of the node's fee estimate
    #[serde(default)]
    pub fee_buffer_percent: u64,
    #[serde(default)]
    pub fixed_fee: Option<u64>,
    /// Account chains: last valid block = current + window when no deadline is set
    #[serde(default = "default_validity_blocks")]
    pub default_validity_blocks: u64,
    #[serde(default)]
    pub delete_account_fee: u64,
    /// UTXO chains: floor of the fee rate, also the RBF relay increment rate
    #[serde(default)]
    pub min_relay_fee_per_kb: u64,
    /// UTXO chains: blocks averaged by the fee service, 0 disables it
    #[serde(default)]
    pub fee_history_blocks: usize,
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    20_000
}

fn default_escalation_percent() -> u64 {
    120
}

fn default_pending_timeout_secs() -> u64 {
    600
}

fn default_validity_blocks() -> u64 {
    50
}

impl ChainSettings {
    /// Settings with defaults for `chain_type`, used by tests and tools
    pub fn for_chain(chain_type: ChainType) -> Self {
        Self {
            chain_type,
            rpc_urls: Vec::new(),
            api_key: None,
            enabled: true,
            request_timeout_ms: default_request_timeout_ms(),
            finalization_blocks: None,
            fee_escalation_percent: default_escalation_percent(),
            pending_timeout_secs: default_pending_timeout_secs(),
            deadline_block_offset: 0,
            deadline_time_offset_secs: 0,
            dust_amount: 0,
            fee_buffer_percent: 0,
            fixed_fee: None,
            default_validity_blocks: default_validity_blocks(),
            delete_account_fee: 0,
            min_relay_fee_per_kb: 0,
            fee_history_blocks: 0,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn pending_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_timeout_secs as i64)
    }

    /// Configured confirmations or the chain default
    pub fn confirmations(&self) -> u64 {
        self.finalization_blocks
            .unwrap_or_else(|| crate::chain::recommended_confirmations(self.chain_type))
    }
}

/// Private keys are never stored in the file, only the environment
/// variables holding them, keyed by address.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletConfig {
    #[serde(default)]
    pub private_key_env: HashMap<String, String>,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("WALLET_ENGINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled {
                if chain.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", name);
                }
                if chain.fee_escalation_percent <= 100 {
                    anyhow::bail!(
                        "Chain {} fee_escalation_percent must exceed 100, got {}",
                        name,
                        chain.fee_escalation_percent
                    );
                }
            }
        }

        let mut seen = Vec::new();
        for (_, chain) in self.enabled_chains() {
            if seen.contains(&chain.chain_type) {
                anyhow::bail!("Chain type {} is configured twice", chain.chain_type);
            }
            seen.push(chain.chain_type);
        }

        self.monitor.validate()
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainSettings)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    pub fn chain(&self, chain_type: ChainType) -> Option<&ChainSettings> {
        self.chains
            .values()
            .find(|c| c.enabled && c.chain_type == chain_type)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;
    let mut result = input.to_string();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}
