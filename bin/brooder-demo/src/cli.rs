// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use clap::{Parser, Subcommand};

/// A multi-process actor runtime demo: arbiter, actor, and demo run modes.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct ClArgs {
    /// The location of the configuration file.
    #[clap(short, long, env = "CONFIG_PATH")]
    pub config: Option<String>,
    /// Overrides the configured arbiter address.
    #[clap(long, env = "ARBITER_ADDR")]
    pub arbiter_addr: Option<SocketAddr>,
    /// Overrides the configured bind address.
    #[clap(long, env = "BIND_ADDR")]
    pub bind_addr: Option<SocketAddr>,
    /// Overrides the configured RPC module allow-list (comma-separated).
    #[clap(long, env = "RPC_MODULES")]
    pub rpc_modules: Option<String>,
    /// Overrides the configured log level.
    #[clap(long, env = "LOGLEVEL")]
    pub loglevel: Option<String>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Runs the cluster arbiter: the well-known name-to-address registry.
    Arbiter,
    /// Runs a single actor process. This is the entry point the nursery's
    /// spawned children re-exec into (§6 "Spawn interface").
    Actor {
        /// The actor's name (its UID is this name plus a fresh instance id).
        #[clap(long)]
        name: String,
        /// The address this actor's child was told to connect back to.
        #[clap(long)]
        parent_addr: Option<SocketAddr>,
        /// Which demo RPC module this actor exposes to callers.
        #[clap(long, arg_enum, default_value = "greet")]
        module: DemoModule,
    },
    /// Runs the end-to-end demo: opens a nursery on a root actor and drives
    /// through the peer-discovery, streaming, and pub/sub scenarios.
    Demo,
}

#[derive(Clone, Copy, Debug, clap::ArgEnum)]
pub enum DemoModule {
    Greet,
    Counter,
    Publisher,
    Math,
}

impl DemoModule {
    /// The module tag this variant registers under in its actor's
    /// [`brooder::Dispatcher`] — also used as the sole entry of that actor's
    /// RPC allow-list.
    pub fn as_str(self) -> &'static str {
        match self {
            DemoModule::Greet => "greet",
            DemoModule::Counter => "counter",
            DemoModule::Publisher => "publisher",
            DemoModule::Math => "math",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_module_variant_has_a_distinct_tag() {
        let tags = [
            DemoModule::Greet.as_str(),
            DemoModule::Counter.as_str(),
            DemoModule::Publisher.as_str(),
            DemoModule::Math.as_str(),
        ];
        let mut sorted = tags.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), tags.len());
    }
}
