use anyhow::Result;
use clap::Parser;
use tutor_config::TutorConfig;
use tutor_edge::cli::{Cli, TraceLevel};
use tutor_edge::commands::execute_command;
use tutor_edge::EdgeRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(cli.trace);

    let config = TutorConfig::load(cli.config.as_deref().and_then(|p| p.to_str()))?;
    config.validate()?;

    let runtime = EdgeRuntime::bootstrap(cli.data_dir, config).await?;

    execute_command(cli.command, &runtime, cli.output).await?;

    Ok(())
}

/// Priority: `RUST_LOG` environment variable, then `--trace`, then `warn`.
/// Tracing goes to stderr so stdout stays clean for command output.
fn setup_tracing(trace_level: TraceLevel) {
    use std::io;
    use tracing_subscriber::EnvFilter;

    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(io::stderr)
            .with_target(false)
            .init();
    } else {
        let level: tracing::Level = trace_level.into();
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(io::stderr)
            .with_target(false)
            .init();
    }
}
