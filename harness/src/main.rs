//! Launch a local cluster and run scenarios against it.

use clap::{builder::PossibleValuesParser, Arg, ArgAction, Command};
use lockstep_harness::{
    cluster::Cluster,
    config::Config,
    repl::{Exit, Repl},
    scenario::{Fixture, Scenario},
    Error,
};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};
use tokio::io::BufReader;
use tracing::{error, info};

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

const RUN_CMD: &str = "run";
const REPL_CMD: &str = "repl";

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .required(true)
        .help("Path to YAML config file")
        .value_parser(clap::value_parser!(PathBuf))
}

/// Entrypoint for the lockstep CLI
#[tokio::main]
async fn main() -> ExitCode {
    // Define application
    let matches = Command::new("lockstep")
        .version(crate_version())
        .about("Drive a local cluster of nodes block by block.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(RUN_CMD)
                .about("Prepare a cluster, run a scenario against it, and shut it down.")
                .arg(config_arg())
                .arg(
                    Arg::new("scenario")
                        .long("scenario")
                        .required(true)
                        .help("Scenario to run")
                        .value_parser(PossibleValuesParser::new(
                            Scenario::ALL.map(|scenario| scenario.name()),
                        )),
                )
                .arg(
                    Arg::new("interactive")
                        .long("interactive")
                        .help("Open a prompt instead of exiting when the scenario fails")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new(REPL_CMD)
                .about("Prepare a cluster and drive it from a prompt.")
                .arg(config_arg()),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Parse subcommands
    match matches.subcommand() {
        Some((RUN_CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            let scenario = matches.get_one::<String>("scenario").unwrap();
            let interactive = matches.get_flag("interactive");
            if let Err(e) = run(config_path, scenario, interactive).await {
                error!(error=?e, node=?e.node(), "scenario failed");
            } else {
                return ExitCode::SUCCESS;
            }
        }
        Some((REPL_CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            if let Err(e) = repl(config_path).await {
                error!(error=?e, node=?e.node(), "session failed");
            } else {
                return ExitCode::SUCCESS;
            }
        }
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
        }
        None => {
            error!("no subcommand provided");
        }
    }
    ExitCode::FAILURE
}

/// Hand `cluster` to a prompt on stdin, shutting it down if input ends first.
async fn prompt(cluster: &mut Cluster) -> Result<(), Error> {
    let input = BufReader::new(tokio::io::stdin());
    match Repl::new().run(cluster, input, tokio::io::stdout()).await? {
        Exit::Quit => Ok(()),
        Exit::Closed => cluster.shutdown().await,
    }
}

async fn run(config_path: &Path, scenario: &str, interactive: bool) -> Result<(), Error> {
    let scenario: Scenario = scenario.parse()?;
    let mut fixture = Fixture::new(Config::load(config_path)?);
    let result = match fixture.prepare().await {
        Ok(()) => scenario.run(&mut fixture).await,
        Err(err) => Err(err),
    };
    let err = match result {
        Ok(()) => return fixture.shutdown().await,
        Err(err) => err,
    };

    if interactive {
        error!(error=?err, "scenario failed, opening prompt");
        prompt(fixture.cluster_mut()).await?;
    } else if let Err(shutdown) = fixture.shutdown().await {
        error!(error=?shutdown, "failed to shut down after failure");
    }
    Err(err)
}

async fn repl(config_path: &Path) -> Result<(), Error> {
    let mut fixture = Fixture::new(Config::load(config_path)?);
    fixture.prepare().await?;
    info!("cluster ready, enter `>selector` to pick targets and `quit` to exit");
    prompt(fixture.cluster_mut()).await
}
