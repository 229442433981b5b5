//! Simulated node: accepts the real node's flags and serves the RPC methods scenarios use.

use clap::{Arg, ArgAction, Command};
use lockstep_harness::mock::node::{run, Options};
use std::{net::SocketAddr, path::PathBuf, process::ExitCode};
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let matches = Command::new("mock-node")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Simulated node for exercising the harness.")
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("genesis-config")
                .long("genesis-config")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("min-delegate-connection-count")
                .long("min-delegate-connection-count")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("server")
                .long("server")
                .action(ArgAction::SetTrue),
        )
        .arg(Arg::new("rpcuser").long("rpcuser"))
        .arg(Arg::new("rpcpassword").long("rpcpassword"))
        .arg(Arg::new("upnp").long("upnp"))
        .arg(
            Arg::new("disable-default-peers")
                .long("disable-default-peers")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("httpport")
                .long("httpport")
                .default_value("0")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("p2p-port")
                .long("p2p-port")
                .default_value("0")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("rpcport")
                .long("rpcport")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("connect-to")
                .long("connect-to")
                .value_parser(clap::value_parser!(SocketAddr)),
        )
        .get_matches();

    // Stdout carries readiness lines only (stderr is surfaced as warnings by the harness)
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_writer(std::io::stderr)
        .init();

    let options = Options {
        data_dir: matches.get_one::<PathBuf>("data-dir").unwrap().clone(),
        genesis: matches.get_one::<PathBuf>("genesis-config").unwrap().clone(),
        http_port: *matches.get_one::<u16>("httpport").unwrap(),
        p2p_port: *matches.get_one::<u16>("p2p-port").unwrap(),
        connect_to: matches.get_one::<SocketAddr>("connect-to").copied(),
    };
    if let Err(e) = run(options).await {
        error!(error=?e, "node failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
