//! The clap command tree.

use clap::{Arg, ArgAction, Command};

/// Environment variable consulted when `--psk` is absent.
pub const PSK_ENV: &str = "UDROP_PSK";

fn psk_arg() -> Arg {
    Arg::new("psk")
        .long("psk")
        .value_name("SECRET")
        .help(format!(
            "Pre-shared key; falls back to the {PSK_ENV} environment variable"
        ))
}

fn session_arg() -> Arg {
    Arg::new("session")
        .long("session")
        .value_name("ID")
        .required(true)
        .help("Session id both peers agreed on")
}

fn server_arg() -> Arg {
    Arg::new("server")
        .long("server")
        .value_name("HOST:PORT")
        .required(true)
        .help("Coordination server address")
}

fn json_arg() -> Arg {
    Arg::new("json")
        .long("json")
        .action(ArgAction::SetTrue)
        .help("Emit newline-delimited JSON events on stdout")
}

/// Builds the full `udrop` command.
pub fn command() -> Command {
    Command::new("udrop")
        .about("Encrypted peer-to-peer file transfer through NAT")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("Increase log verbosity (-v, -vv)"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .global(true)
                .conflicts_with("verbose")
                .help("Log errors only"),
        )
        .subcommand(
            Command::new("server")
                .about("Run the coordination server")
                .arg(
                    Arg::new("port")
                        .long("port")
                        .value_name("PORT")
                        .value_parser(clap::value_parser!(u16))
                        .default_value("9000")
                        .help("UDP port to listen on"),
                )
                .arg(psk_arg())
                .arg(
                    Arg::new("session-timeout")
                        .long("session-timeout")
                        .value_name("SECONDS")
                        .value_parser(clap::value_parser!(u64).range(1..))
                        .default_value("300")
                        .help("Idle seconds before a session is dropped"),
                ),
        )
        .subcommand(
            Command::new("send")
                .about("Send a file to the peer in the session")
                .arg(session_arg())
                .arg(psk_arg())
                .arg(server_arg())
                .arg(
                    Arg::new("file")
                        .long("file")
                        .value_name("PATH")
                        .required(true)
                        .help("File to send"),
                )
                .arg(json_arg()),
        )
        .subcommand(
            Command::new("receive")
                .about("Receive a file from the peer in the session")
                .arg(session_arg())
                .arg(psk_arg())
                .arg(server_arg())
                .arg(
                    Arg::new("output")
                        .long("output")
                        .value_name("DIR")
                        .required(true)
                        .help("Directory the received file lands in"),
                )
                .arg(json_arg()),
        )
}

/// Resolves the PSK from the flag or the environment.
pub fn resolve_psk(matches: &clap::ArgMatches) -> Option<zeroize::Zeroizing<Vec<u8>>> {
    matches
        .get_one::<String>("psk")
        .map(|psk| zeroize::Zeroizing::new(psk.clone().into_bytes()))
        .or_else(|| {
            std::env::var(PSK_ENV)
                .ok()
                .filter(|value| !value.is_empty())
                .map(|value| zeroize::Zeroizing::new(value.into_bytes()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_apply() {
        let matches = command()
            .try_get_matches_from(["udrop", "server", "--psk", "k"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        assert_eq!(sub.get_one::<u16>("port"), Some(&9000));
        assert_eq!(sub.get_one::<u64>("session-timeout"), Some(&300));
    }

    #[test]
    fn send_requires_session_server_and_file() {
        assert!(command()
            .try_get_matches_from(["udrop", "send", "--psk", "k"])
            .is_err());
        let matches = command()
            .try_get_matches_from([
                "udrop", "send", "--session", "s", "--psk", "k", "--server",
                "127.0.0.1:9000", "--file", "a.bin", "--json",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "send");
        assert!(sub.get_flag("json"));
    }

    #[test]
    fn verbosity_counts_and_conflicts() {
        let matches = command()
            .try_get_matches_from([
                "udrop", "-vv", "receive", "--session", "s", "--psk", "k", "--server",
                "127.0.0.1:9000", "--output", "out",
            ])
            .unwrap();
        assert_eq!(matches.get_count("verbose"), 2);

        assert!(command()
            .try_get_matches_from([
                "udrop", "-v", "-q", "receive", "--session", "s", "--psk", "k",
                "--server", "127.0.0.1:9000", "--output", "out",
            ])
            .is_err());
    }

    #[test]
    fn psk_resolution_prefers_the_flag() {
        let matches = command()
            .try_get_matches_from(["udrop", "server", "--psk", "flag-key"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        let psk = resolve_psk(sub).expect("psk resolves");
        assert_eq!(psk.as_slice(), b"flag-key");
    }
}
