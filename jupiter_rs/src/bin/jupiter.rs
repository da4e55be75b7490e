use clap::Parser;
use tracing_subscriber::EnvFilter;

use jupiter::cli::{dispatch, Cli};

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    std::process::exit(dispatch::dispatch(cli));
}
