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

use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

use crate::config::ApplicationConfig;

#[derive(Parser, Debug)]
#[clap(author, version, about = "The Sable full node", long_about = None)]
#[clap(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Root directory for data, configuration and logs
    #[clap(long, default_value = "./sable")]
    pub base_path: PathBuf,
    /// Path to the configuration file (defaults to <base_path>/config.toml)
    #[clap(long)]
    pub config: Option<PathBuf>,
    /// Enable the address indexer
    #[clap(long = "addressindex")]
    pub address_index: bool,
    /// Enable the per-transaction index
    #[clap(long = "txindex")]
    pub tx_index: bool,
    /// Enable pruning of old blocks
    #[clap(long)]
    pub prune: bool,
    /// With --prune, how many recent blocks to keep
    #[clap(long = "blockstoreamounttokeep")]
    pub block_store_amount_to_keep: Option<u64>,
    /// Connect only to these endpoints and disable discovery (repeatable)
    #[clap(long = "connect")]
    pub connect: Vec<SocketAddr>,
    /// Always maintain an outbound connection to these endpoints (repeatable)
    #[clap(long = "addnode")]
    pub add_node: Vec<SocketAddr>,
    /// Endpoint or CIDR range exempt from IP-range filtering and inbound-IBD rejection (repeatable)
    #[clap(long = "whitelist")]
    pub whitelist: Vec<String>,
    /// Inbound connection ceiling
    #[clap(long = "maxinbound")]
    pub max_inbound: Option<usize>,
    /// Outbound connection ceiling
    #[clap(long = "maxoutbound")]
    pub max_outbound: Option<usize>,
    /// Default ban duration in seconds
    #[clap(long = "bantime")]
    pub ban_time: Option<u64>,
    /// Enforce at most one connected peer per /16 address group
    #[clap(long = "iprangefiltering")]
    pub ip_range_filtering: Option<bool>,
    /// Advertise this endpoint to peers
    #[clap(long = "externalip")]
    pub external_ip: Option<SocketAddr>,
    /// Block-store flush threshold in megabytes
    #[clap(long = "maxcachesize")]
    pub max_cache_size: Option<usize>,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.base_path.join("config.toml"))
    }

    /// Command-line options override whatever the configuration file said.
    pub fn apply_overrides(&self, config: &mut ApplicationConfig) {
        let node = &mut config.base_node;
        if self.address_index {
            node.address_index = true;
        }
        if self.tx_index {
            node.tx_index = true;
        }
        if self.prune {
            node.prune = true;
        }
        if let Some(keep) = self.block_store_amount_to_keep {
            node.block_store_amount_to_keep = keep;
        }
        if !self.connect.is_empty() {
            node.connect = self.connect.clone();
        }
        if !self.add_node.is_empty() {
            node.add_node = self.add_node.clone();
        }
        if !self.whitelist.is_empty() {
            node.whitelist = self.whitelist.clone();
        }
        if let Some(max_inbound) = self.max_inbound {
            node.max_inbound = max_inbound;
        }
        if let Some(max_outbound) = self.max_outbound {
            node.max_outbound = max_outbound;
        }
        if let Some(ban_time) = self.ban_time {
            node.ban_time_secs = ban_time;
        }
        if let Some(filtering) = self.ip_range_filtering {
            node.ip_range_filtering = filtering;
        }
        if let Some(external) = self.external_ip {
            node.external_address = Some(external);
        }
        if let Some(megabytes) = self.max_cache_size {
            node.max_cache_size_mb = megabytes;
        }
        node.data_dir = self.base_path.join(&node.data_dir);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn overrides_take_precedence() {
        let cli = Cli::parse_from([
            "sable_node",
            "--addressindex",
            "--maxinbound",
            "9",
            "--bantime",
            "60",
            "--connect",
            "10.0.0.1:8333",
        ]);
        let mut config = ApplicationConfig::default();
        cli.apply_overrides(&mut config);
        assert!(config.base_node.address_index);
        assert_eq!(config.base_node.max_inbound, 9);
        assert_eq!(config.base_node.ban_time_secs, 60);
        assert_eq!(config.base_node.connect, vec!["10.0.0.1:8333".parse().unwrap()]);
        assert!(!config.base_node.tx_index);
    }
}
