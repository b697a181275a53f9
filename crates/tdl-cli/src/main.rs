use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tdl_storage::PgDetailStore;
use tdl_sync::{FetchRequest, LoaderConfig, WindowFetcher};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tdl-cli")]
#[command(about = "Load detailed time-entry reports into the detail table")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, check for preexisting entries, then save (default)
    Load(WindowArgs),
    /// Fetch and normalize only; prints the rows as JSON
    Fetch(WindowArgs),
    /// Create the detail table if it does not exist
    InitDb,
}

/// Both bounds are needed; otherwise yesterday is loaded.
#[derive(Debug, Clone, Default, Args)]
struct WindowArgs {
    /// First day, yyyy-mm-dd
    #[arg(long)]
    since: Option<NaiveDate>,
    /// Last day, yyyy-mm-dd
    #[arg(long)]
    until: Option<NaiveDate>,
    /// Overrides WORKSPACE_ID
    #[arg(long)]
    workspace_id: Option<String>,
}

impl From<WindowArgs> for FetchRequest {
    fn from(args: WindowArgs) -> Self {
        FetchRequest {
            since: args.since,
            until: args.until,
            workspace_id: args.workspace_id,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Load(WindowArgs::default())) {
        Commands::Load(args) => {
            let summary = tdl_sync::run_load_once_from_env(&args.into()).await?;
            info!(
                run_id = %summary.run_id,
                window = %summary.window,
                fetched = summary.fetched_rows,
                "load finished"
            );
            println!("{}", summary.outcome);
        }
        Commands::Fetch(args) => {
            let request = FetchRequest::from(args);
            let fetcher = WindowFetcher::new(LoaderConfig::from_env())?;
            let table = fetcher
                .fetch_window(request.since, request.until, request.workspace_id.as_deref())
                .await?;
            let json = serde_json::to_string_pretty(&table.rows).context("serializing report rows")?;
            println!("{json}");
        }
        Commands::InitDb => {
            let config = LoaderConfig::from_env();
            let store = PgDetailStore::connect(&config.database.url())
                .await
                .with_context(|| format!("connecting to {}", config.database.redacted_url()))?;
            store.ensure_table().await.context("creating detail table")?;
            println!("detail table ready");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_load() {
        let cli = Cli::try_parse_from(["tdl-cli"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn window_flags_parse_as_dates() {
        let cli = Cli::try_parse_from([
            "tdl-cli",
            "load",
            "--since",
            "2022-01-29",
            "--until",
            "2022-01-29",
            "--workspace-id",
            "5997219",
        ])
        .unwrap();
        let Some(Commands::Load(args)) = cli.command else {
            panic!("expected load");
        };
        let request = FetchRequest::from(args);
        assert_eq!(request.since, NaiveDate::from_ymd_opt(2022, 1, 29));
        assert_eq!(request.workspace_id.as_deref(), Some("5997219"));
        assert!(Cli::try_parse_from(["tdl-cli", "fetch", "--since", "29/01/2022"]).is_err());
    }
}
