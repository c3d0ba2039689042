use clap::{Parser, Subcommand};
use driftline_core::config::Config;

#[derive(Parser)]
#[command(name = "driftline", about = "Autonomous schema-on-read JSON ingestion pipeline")]
struct Cli {
    /// Write debug logs to /tmp/driftline-debug.log (tail -f to inspect).
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch batches from the upstream record server and ingest them.
    Ingest,
    /// Print accumulated field statistics and placement decisions.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug)?;

    let config = Config::load()?;

    match cli.command {
        Command::Ingest => {
            let summary = driftline::run_ingest(config).await?;
            println!("\n=== Final Statistics ===");
            println!("Total records processed: {}", summary.total_processed);
            println!("SQL inserts: {}", summary.sql_inserts);
            println!("Document inserts: {}", summary.doc_inserts);
            println!("Errors: {}", summary.errors);
        }
        Command::Stats => {
            driftline::print_stats(&config)?;
        }
    }

    Ok(())
}

fn init_logging(debug: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("RUST_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if debug {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open("/tmp/driftline-debug.log")?;
        tracing_subscriber::fmt()
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .with_env_filter(filter)
            .init();
        tracing::info!("driftline debug log started — tail -f /tmp/driftline-debug.log");
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}
