//! The `udrop receive` subcommand.

use std::path::PathBuf;
use std::sync::Arc;

use clap::ArgMatches;
use peer::Peer;
use transfer::FileReceiver;

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
    let output = PathBuf::from(matches.get_one::<String>("output").expect("required arg"));
    if let Err(err) = std::fs::create_dir_all(&output) {
        reporter.error(&format!("cannot create {}: {err}", output.display()));
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
    let receiver = FileReceiver::new(peer.channel().clone(), output)
        .with_offer_info(move |metadata| {
            reporter.file_info(&metadata.filename, metadata.file_size, &metadata.sha256);
        })
        .with_progress(Box::new(move |bytes, total| {
            hook_meter.observe(bytes, total);
        }));

    let result = receiver.receive();
    peer.close();

    match result {
        Ok(received) => {
            reporter.complete(
                received.summary.bytes,
                received.summary.packets,
                received.summary.retransmissions,
                received.summary.duration.as_millis() as u64,
                Some(&received.path),
            );
            0
        }
        Err(err) => {
            reporter.error(&err.to_string());
            EXIT_FAILURE
        }
    }
}
