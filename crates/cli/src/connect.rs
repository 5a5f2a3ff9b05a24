//! Shared setup for the send and receive subcommands.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use clap::ArgMatches;
use peer::{PeerConfig, StateListener};

use crate::args;
use crate::output::Reporter;

/// Resolves `host:port`, preferring IPv4 for the UDP rendezvous.
fn resolve_server(server: &str) -> Result<SocketAddr, String> {
    let addrs: Vec<SocketAddr> = server
        .to_socket_addrs()
        .map_err(|err| format!("cannot resolve {server}: {err}"))?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| format!("{server} resolved to no addresses"))
}

/// Builds the peer configuration from common send/receive arguments.
pub fn build_config(matches: &ArgMatches) -> Result<PeerConfig, String> {
    let session = matches
        .get_one::<String>("session")
        .ok_or("a session id is required")?;
    let psk = args::resolve_psk(matches).ok_or_else(|| {
        format!("a pre-shared key is required (--psk or {})", args::PSK_ENV)
    })?;
    let server = matches
        .get_one::<String>("server")
        .ok_or("a server address is required")?;
    let server_addr = resolve_server(server)?;

    let mut config = PeerConfig::new(session.clone(), Vec::new(), server_addr);
    config.psk = psk;
    Ok(config)
}

/// A state listener that forwards transitions to the reporter.
pub fn state_listener(reporter: Reporter) -> StateListener {
    Arc::new(move |state| reporter.status(state.name()))
}
