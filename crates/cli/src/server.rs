//! The `udrop server` subcommand.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::ArgMatches;
use coord::{CoordServer, ServerConfig};
use tracing::error;

use crate::{args, EXIT_FAILURE, EXIT_USAGE};

pub fn run(matches: &ArgMatches) -> i32 {
    let Some(psk) = args::resolve_psk(matches) else {
        eprintln!("a pre-shared key is required (--psk or {})", args::PSK_ENV);
        return EXIT_USAGE;
    };
    let port = *matches.get_one::<u16>("port").unwrap_or(&9000);
    let session_timeout = *matches.get_one::<u64>("session-timeout").unwrap_or(&300);

    let server = match CoordServer::bind(ServerConfig {
        bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        psk,
        session_timeout: Duration::from_secs(session_timeout),
    }) {
        Ok(server) => server,
        Err(err) => {
            error!(%err, port, "bind failed");
            eprintln!("cannot bind UDP port {port}: {err}");
            return EXIT_FAILURE;
        }
    };

    eprintln!("coordination server listening on 0.0.0.0:{port}");
    match server.run() {
        Ok(()) => 0,
        Err(err) => {
            error!(%err, "server loop failed");
            eprintln!("server failed: {err}");
            EXIT_FAILURE
        }
    }
}
