//! netforge CLI: inspect and check config-defined computation graphs.

use clap::{ArgAction, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "netforge",
    version,
    about = "Declarative computation graphs with checkpoint-stable module numbering"
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: netforge::cli::Commands,
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = netforge::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
