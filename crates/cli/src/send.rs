//! The `udrop send` subcommand.

use std::path::PathBuf;
use std::sync::Arc;

use clap::ArgMatches;
use peer::Peer;
use transfer::FileSender;

use crate::output::{ProgressMeter, Reporter};
use crate::{connect, EXIT_FAILURE, EXIT_USAGE};

pub fn run(matches: &ArgMatches) -> i32 {
    let reporter = Reporter::new(matches.get_flag("json"));
    let config = match connect::build_config(matches) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            return EXIT_USAGE;
        }
    };
    let file = PathBuf::from(matches.get_one::<String>("file").expect("required arg"));
    if !file.is_file() {
        reporter.error(&format!("{} is not a readable file", file.display()));
        return EXIT_FAILURE;
    }

    let peer = match Peer::connect(&config, Some(connect::state_listener(reporter))) {
        Ok(peer) => peer,
        Err(err) => {
            reporter.error(&err.to_string());
            return EXIT_FAILURE;
        }
    };

    let meter = Arc::new(ProgressMeter::new(reporter));
    let hook_meter = Arc::clone(&meter);
    let sender = FileSender::new(peer.channel().clone())
        .with_offer_info(move |metadata| {
            reporter.file_info(&metadata.filename, metadata.file_size, &metadata.sha256);
        })
        .with_progress(Box::new(move |bytes, total| {
            hook_meter.observe(bytes, total);
        }));

    let result = sender.send_file(&file);
    peer.close();

    match result {
        Ok(summary) => {
            reporter.complete(
                summary.bytes,
                summary.packets,
                summary.retransmissions,
                summary.duration.as_millis() as u64,
                None,
            );
            0
        }
        Err(err) => {
            reporter.error(&err.to_string());
            EXIT_FAILURE
        }
    }
}
