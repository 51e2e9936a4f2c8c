use aicm_cli::{run, Cli};
use clap::Parser;
use tracing::error;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version requests are not errors
            if e.use_stderr() {
                e.print().ok();
                std::process::exit(1);
            }
            e.print().ok();
            std::process::exit(0);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}
