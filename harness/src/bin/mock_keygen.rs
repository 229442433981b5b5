//! Simulated key tool: prints `--count` deterministic key records derived from `--seed`.

use clap::{Arg, Command};
use lockstep_harness::mock::keygen;
use std::process::ExitCode;

fn main() -> ExitCode {
    let matches = Command::new("mock-keygen")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Deterministic stand-in for the key tool.")
        .arg(
            Arg::new("count")
                .long("count")
                .default_value("1")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(Arg::new("seed").long("seed").default_value(""))
        .get_matches();

    let count = *matches.get_one::<usize>("count").unwrap();
    let seed = matches.get_one::<String>("seed").unwrap();
    match serde_json::to_string_pretty(&keygen::generate(count, seed)) {
        Ok(keys) => {
            println!("{keys}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("failed to encode keys: {e}");
            ExitCode::FAILURE
        }
    }
}
