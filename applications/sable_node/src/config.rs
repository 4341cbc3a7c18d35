// Copyright 2023. The Sable Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::{net::SocketAddr, path::Path, path::PathBuf, str::FromStr, time::Duration};

use cidr::AnyIpCidr;
use config::Config;
use sable_comms::{CommsConfig, DiscoveryConfig};
use sable_core::chain_storage::BlockStoreConfig;
use serde::{Deserialize, Serialize};

use crate::exit_codes::{ExitCode, ExitError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default)]
    pub base_node: BaseNodeConfig,
}

impl ApplicationConfig {
    /// Load the TOML file (when present) over the built-in defaults.
    pub fn load_from(path: &Path) -> Result<Self, ExitError> {
        let cfg = Config::builder()
            .add_source(config::File::from(path.to_path_buf()).required(false))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn comms_config(&self) -> Result<CommsConfig, ExitError> {
        let node = &self.base_node;
        let whitelist = parse_ranges(&node.whitelist)?;
        let exclusions = parse_ranges(&node.ip_range_exclusions)?;
        Ok(CommsConfig {
            listen_addresses: node.listen_addresses.clone(),
            external_address: node.external_address,
            max_inbound: node.max_inbound,
            max_outbound: node.max_outbound,
            whitelist,
            add_node: node.add_node.clone(),
            connect: node.connect.clone(),
            ip_range_filtering: node.ip_range_filtering,
            ip_range_exclusions: exclusions,
            default_ban_duration: Duration::from_secs(node.ban_time_secs),
            ..Default::default()
        })
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        let node = &self.base_node;
        DiscoveryConfig {
            dns_seeds: node.dns_seeds.clone(),
            seed_nodes: node.seed_nodes.clone(),
            ..Default::default()
        }
    }

    pub fn block_store_config(&self) -> BlockStoreConfig {
        let node = &self.base_node;
        BlockStoreConfig {
            max_batch_bytes: node.max_cache_size_mb * 1024 * 1024,
            blocks_to_keep: node.prune.then_some(node.block_store_amount_to_keep),
            tx_index: node.tx_index,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(clippy::struct_excessive_bools)]
pub struct BaseNodeConfig {
    /// The relative path (under the base path) for persistent data.
    pub data_dir: PathBuf,
    /// Endpoints to accept inbound peers on.
    pub listen_addresses: Vec<SocketAddr>,
    /// The endpoint advertised to peers, if any.
    pub external_address: Option<SocketAddr>,
    /// Maintain the address indexer.
    pub address_index: bool,
    /// Maintain the per-transaction index.
    pub tx_index: bool,
    /// Prune blocks older than `block_store_amount_to_keep`.
    pub prune: bool,
    pub block_store_amount_to_keep: u64,
    /// Block-store flush threshold in megabytes.
    pub max_cache_size_mb: usize,
    /// Outbound connections restricted to exactly these endpoints (disables discovery).
    pub connect: Vec<SocketAddr>,
    /// Endpoints to always keep an outbound connection to.
    pub add_node: Vec<SocketAddr>,
    /// Endpoints/CIDR ranges exempt from IP-range filtering and the inbound-IBD gate.
    pub whitelist: Vec<String>,
    pub max_inbound: usize,
    pub max_outbound: usize,
    /// Default ban duration in seconds.
    pub ban_time_secs: u64,
    /// At most one connected peer per /16-equivalent address group.
    pub ip_range_filtering: bool,
    /// Ranges exempt from the /16 rule.
    pub ip_range_exclusions: Vec<String>,
    /// DNS names consulted when the peer book has gone cold.
    pub dns_seeds: Vec<String>,
    /// Fixed bootstrap endpoints.
    pub seed_nodes: Vec<SocketAddr>,
}

impl Default for BaseNodeConfig {
    fn default() -> Self {
        let comms = CommsConfig::default();
        Self {
            data_dir: PathBuf::from("data"),
            listen_addresses: comms.listen_addresses,
            external_address: None,
            address_index: false,
            tx_index: false,
            prune: false,
            block_store_amount_to_keep: 10_000,
            max_cache_size_mb: 5,
            connect: Vec::new(),
            add_node: Vec::new(),
            whitelist: Vec::new(),
            max_inbound: comms.max_inbound,
            max_outbound: comms.max_outbound,
            ban_time_secs: comms.default_ban_duration.as_secs(),
            ip_range_filtering: comms.ip_range_filtering,
            ip_range_exclusions: Vec::new(),
            dns_seeds: Vec::new(),
            seed_nodes: Vec::new(),
        }
    }
}

fn parse_ranges(ranges: &[String]) -> Result<Vec<AnyIpCidr>, ExitError> {
    ranges
        .iter()
        .map(|s| {
            AnyIpCidr::from_str(s)
                .map_err(|e| ExitError::new(ExitCode::ConfigError, format!("invalid address range '{}': {}", s, e)))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_deserialize_from_an_empty_table() {
        let config: ApplicationConfig = toml::from_str("").unwrap();
        assert!(!config.base_node.address_index);
        assert_eq!(config.base_node.max_cache_size_mb, 5);
    }

    #[test]
    fn toml_sections_override_defaults() {
        let config: ApplicationConfig = toml::from_str(
            r#"
            [base_node]
            address_index = true
            max_inbound = 3
            whitelist = ["192.168.0.0/16"]
            connect = ["10.0.0.9:8333"]
            "#,
        )
        .unwrap();
        assert!(config.base_node.address_index);
        assert_eq!(config.base_node.max_inbound, 3);
        let comms = config.comms_config().unwrap();
        assert_eq!(comms.max_inbound, 3);
        assert_eq!(comms.whitelist.len(), 1);
        assert!(comms.whitelist[0].contains(&"192.168.7.7".parse().unwrap()));
        assert_eq!(comms.connect, vec!["10.0.0.9:8333".parse().unwrap()]);
    }

    #[test]
    fn invalid_whitelist_entries_are_config_errors() {
        let config: ApplicationConfig = toml::from_str(
            r#"
            [base_node]
            whitelist = ["not-an-address"]
            "#,
        )
        .unwrap();
        let err = config.comms_config().unwrap_err();
        assert_eq!(err.code, crate::exit_codes::ExitCode::ConfigError);
    }

    #[test]
    fn pruning_maps_into_the_store_config() {
        let config: ApplicationConfig = toml::from_str(
            r#"
            [base_node]
            prune = true
            block_store_amount_to_keep = 288
            tx_index = true
            "#,
        )
        .unwrap();
        let store = config.block_store_config();
        assert_eq!(store.blocks_to_keep, Some(288));
        assert!(store.tx_index);
    }
}
