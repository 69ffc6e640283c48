mod daemon;
mod state;
mod sync;

use daemon::{DaemonConfig, DaemonRuntime};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    RunOnce,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CliArgs {
    mode: CliMode,
    force_full: bool,
}

fn parse_cli_args<I>(args: I) -> anyhow::Result<CliArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = CliArgs {
        mode: CliMode::Run,
        force_full: false,
    };
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => parsed.mode = CliMode::RunOnce,
            "--full" => parsed.force_full = true,
            "--help" | "-h" => parsed.mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = parse_cli_args(std::env::args())?;
    if args.mode == CliMode::Help {
        println!("Usage: treesyncd [--once] [--full]");
        println!("  --once   Run a single reconciliation and exit");
        println!("  --full   Force a full run instead of an incremental one");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match args.mode {
        CliMode::RunOnce => daemon.run_once(args.force_full).await,
        _ => daemon.run(args.force_full).await,
    }
}
