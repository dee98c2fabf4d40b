use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::error;

use sentiment_worker::{
    app,
    config::{Config, ConfigOverrides},
    observability,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch, store and classify once, then print the run summary as JSON
    Run {
        /// Search query (overrides SENTIMENT_QUERY)
        #[arg(long)]
        query: Option<String>,

        /// Maximum number of items to fetch (overrides SENTIMENT_MAX_ITEMS)
        #[arg(long)]
        max_items: Option<usize>,

        /// Strategy name: lexicon or model (overrides SENTIMENT_STRATEGY)
        #[arg(long)]
        strategy: Option<String>,

        /// Skip fetching and classify what is already stored
        #[arg(long)]
        classify_only: bool,
    },
    /// Serve the HTTP control plane until interrupted
    Serve,
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(String::as_str)
            })
            .unwrap_or("unknown panic payload");

        if let Some(location) = panic_info.location() {
            error!(
                thread = thread_name,
                file = location.file(),
                line = location.line(),
                column = location.column(),
                message,
                "panic occurred"
            );
        } else {
            error!(
                thread = thread_name,
                message, "panic occurred without location information"
            );
        }
    }));
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    install_panic_hook();
    let cli = Cli::parse();

    // Tracing initialization is handled by ComponentRegistry::build()
    let exit = match cli.command {
        Command::Run {
            query,
            max_items,
            strategy,
            classify_only,
        } => {
            let overrides = ConfigOverrides {
                query,
                max_items,
                strategy,
            };
            let config =
                Config::from_env_with(&overrides).context("failed to load configuration")?;
            let summary = app::run_once(config, classify_only).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("failed to encode run summary")?
            );
            if summary.is_failed() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Command::Serve => {
            let config = Config::from_env().context("failed to load configuration")?;
            app::serve(config).await?;
            ExitCode::SUCCESS
        }
    };

    observability::tracing::shutdown();
    Ok(exit)
}
