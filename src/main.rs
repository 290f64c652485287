use anyhow::Result;
use clap::{Parser, Subcommand};

use usage_ledger::commands::{daily, export, monthly, watch};
use usage_ledger::config::get_config;
use usage_ledger::{logging, memory};

#[derive(Parser)]
#[command(name = "usage-ledger")]
#[command(about = "Local observability pipeline for LLM API usage logs: ingestion, caching, and aggregation")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show per-day usage totals for a trailing window
    Daily {
        #[arg(long)]
        json: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        exclude_vms: bool,
    },
    /// Show per-month usage totals for a trailing window
    Monthly {
        #[arg(long)]
        json: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        exclude_vms: bool,
    },
    /// Print MonitoringData snapshots as they arrive
    Watch {
        #[arg(long)]
        json: bool,
        #[arg(long)]
        token_limit: Option<u64>,
    },
    /// Export aggregated daily usage as CSV or JSON
    Export {
        #[arg(long, default_value = "csv")]
        format: String,
        #[arg(long, default_value_t = 90)]
        since_days: i64,
        #[arg(long)]
        exclude_vms: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = get_config();
    logging::init_logging();
    memory::init_memory_limit();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Daily {
        json: false,
        limit: None,
        exclude_vms: false,
    }) {
        Commands::Daily { json, limit, exclude_vms } => {
            daily::run(&config, daily::DailyOptions { json, limit, exclude_vms }).await
        }
        Commands::Monthly { json, limit, exclude_vms } => {
            monthly::run(&config, monthly::MonthlyOptions { json, limit, exclude_vms }).await
        }
        Commands::Watch { json, token_limit } => {
            watch::run(&config, watch::WatchOptions { json, token_limit }).await
        }
        Commands::Export { format, since_days, exclude_vms } => {
            let format = match format.as_str() {
                "json" => export::ExportFormat::Json,
                _ => export::ExportFormat::Csv,
            };
            export::run(&config, export::ExportOptions { format, since_days, exclude_vms }).await
        }
    }
}
