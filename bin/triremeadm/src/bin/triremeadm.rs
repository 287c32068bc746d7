// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use trireme::api::DATAPATH_VERSION;
use trireme::api::DatapathConfig;
use triremeadm::print::print_replay;
use triremeadm::print::print_token;
use triremeadm::replay::Replay;
use triremeadm::replay::read_capture;

/// Administer and inspect the Trireme datapath
#[derive(Debug, Parser)]
#[command(version = trireme_pkg_version())]
enum Command {
    /// Validate a datapath config and print it with defaults filled in.
    CheckConfig { path: PathBuf },

    /// Print the default datapath config.
    DefaultConfig,

    /// Validate a PU policy file and print it.
    CheckPolicy { path: PathBuf },

    /// Decode a hex-encoded token and verify its signature.
    DecodeToken {
        token: String,

        /// The pre-shared key the token was signed with.
        #[arg(long)]
        psk: String,
    },

    /// Replay an IPv4 capture through a client and a server datapath.
    Replay {
        /// A pcap capture of the conversation as the applications
        /// see it.
        capture: PathBuf,

        /// The policy of the PU owning the client addresses.
        #[arg(long)]
        client: PathBuf,

        /// The policy of the PU owning the server addresses.
        #[arg(long)]
        server: PathBuf,

        /// The datapath config shared by both sides.
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        psk: String,

        /// Report every packet each datapath processes.
        #[arg(long)]
        trace: bool,
    },
}

fn trireme_pkg_version() -> String {
    format!("{}.{DATAPATH_VERSION}", env!("CARGO_PKG_VERSION"))
}

fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    match cmd {
        Command::CheckConfig { path } => {
            let cfg = trireme::config::load(&path)?;
            print!("{}", trireme::config::to_toml_string(&cfg)?);
        }

        Command::DefaultConfig => {
            let cfg = DatapathConfig::default();
            print!("{}", trireme::config::to_toml_string(&cfg)?);
        }

        Command::CheckPolicy { path } => {
            let policy = triremeadm::load_policy(&path)?;
            print!("{}", toml::to_string(&policy)?);
        }

        Command::DecodeToken { token, psk } => {
            let bytes = hex::decode(token.trim())
                .map_err(triremeadm::AdmError::from)?;
            let secrets = triremeadm::psk(&psk)?;
            print_token(&triremeadm::decode_token(&bytes, secrets)?)?;
        }

        Command::Replay { capture, client, server, config, psk, trace } => {
            let log = triremeadm::logger();

            let mut cfg = match config {
                Some(path) => trireme::config::load(&path)?,
                None => DatapathConfig::default(),
            };
            cfg.packet_tracing |= trace;

            let client = triremeadm::load_policy(&client)?;
            let server = triremeadm::load_policy(&server)?;
            let bytes = std::fs::read(&capture)
                .with_context(|| format!("reading {}", capture.display()))?;

            let mut replay = Replay::new(
                cfg,
                triremeadm::psk(&psk)?,
                &client,
                &server,
                &log,
            )?;
            for pkt in read_capture(&bytes)? {
                replay.packet(&pkt);
            }

            print_replay(&replay.finish())?;
        }
    }

    Ok(())
}
