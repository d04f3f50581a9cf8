use std::env;

use clap::Parser;
use scriptenv::{run_cli, Cli};
use tracing::debug;

fn main() {
    // Good enough for now
    if env::var_os("RUST_LOG").is_some() {
        tracing_subscriber::fmt::init();
    } else {
        let format = tracing_subscriber::fmt::format()
            .with_level(false)
            .with_target(false)
            .without_time()
            .compact();
        tracing_subscriber::fmt().event_format(format).init();
    }

    match run_cli(Cli::parse()) {
        Err(e) => {
            eprintln!("💥 {} failed", env!("CARGO_PKG_NAME"));
            for cause in e.chain().collect::<Vec<_>>().iter() {
                eprintln!("  Caused by: {}", cause);
            }
            std::process::exit(1);
        }
        Ok(None) => {}
        // If the script gave us an exit code, return that to the user
        Ok(Some(exit_code)) => {
            debug!("Exit code: {}", exit_code);
            std::process::exit(exit_code);
        }
    }
}
