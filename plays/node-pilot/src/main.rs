use node_pilot::{
    cli::{print_menu, prompt_continue, prompt_moniker, prompt_port_offset, read_input, MenuAction},
    config::{load_dotenv, NodeConfig},
    install::{InstallRequest, Installer},
    logs::follow_logs,
    runner::HostRunner,
    service::Systemd,
    snapshots::{restore_snapshot, HttpArchiveFetcher, Mirror, SnapshotInstaller},
    sync::{local_rpc_url, RpcStatusSource, SyncMonitor},
    NodeError, Result, FIELD_DESCRIPTORS,
};
use std::{
    fs,
    io::{self, BufRead, Write},
    path::Path,
};

type Lines<'a> = io::Lines<io::StdinLock<'a>>;

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(concat!("nodepilot/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

// ── Subcommand: install ──

async fn cmd_install(cfg: &NodeConfig, lines: &mut Lines<'_>) -> Result<()> {
    let moniker = prompt_moniker(lines)?;
    let port_offset = prompt_port_offset(lines)?;
    let request = InstallRequest {
        moniker,
        port_offset,
    };
    let runner = HostRunner;
    let systemd = Systemd::new(HostRunner);
    Installer::new(cfg, &runner, &systemd, http_client()?)
        .run(&request)
        .await?;
    Ok(())
}

// ── Subcommand: snapshot ──

async fn cmd_snapshot(cfg: &NodeConfig, lines: &mut Lines<'_>) -> Result<()> {
    tracing::info!("=== Download Snapshot ===\n");
    for (i, m) in cfg.mirrors.iter().enumerate() {
        tracing::info!("  {}. {}", i + 1, m.name);
    }
    let choice = read_input(lines, "Select mirror", None)?;
    let mirror = Mirror::parse(&choice)?;

    tracing::info!("  This stops both services and deletes all chain data.");
    if !prompt_continue(lines, "Continue?")? {
        tracing::info!("  Cancelled.");
        return Ok(());
    }

    let systemd = Systemd::new(HostRunner);
    let fetcher = HttpArchiveFetcher::new(http_client()?);
    SnapshotInstaller::new(cfg, &systemd, &fetcher)
        .run(mirror)
        .await
}

// ── Subcommand: sync ──

async fn cmd_check_sync(cfg: &NodeConfig) -> Result<()> {
    if cfg.reference_rpc.is_empty() {
        return Err(NodeError::Config("NODEPILOT_REFERENCE_RPC is not set".into()));
    }
    let config_toml = cfg.consensus_config_toml();
    let local_url = match fs::read_to_string(&config_toml) {
        Ok(text) => local_rpc_url(&text),
        Err(e) => {
            tracing::warn!("  Could not read {}: {}", config_toml.display(), e);
            None
        }
    }
    .unwrap_or_else(|| "http://127.0.0.1:26657".to_string());

    tracing::info!("=== Sync Status ===");
    tracing::info!("  local:     {}", local_url);
    tracing::info!("  reference: {}\n", cfg.reference_rpc);

    let client = http_client()?;
    let local = RpcStatusSource::new(client.clone(), &local_url);
    let reference = RpcStatusSource::new(client, &cfg.reference_rpc);
    SyncMonitor::new(cfg.poll_interval)
        .run(&local, &reference, |_| {})
        .await;
    Ok(())
}

// ── Subcommand: config ──

fn cmd_config(cfg: &NodeConfig) -> Result<()> {
    tracing::info!("=== Configuration ===\n");
    for fd in FIELD_DESCRIPTORS.iter() {
        let value = std::env::var(fd.ev).unwrap_or_default();
        tracing::info!(
            "  {:<34} {:<48} {}",
            fd.ev,
            fd.label,
            if value.is_empty() {
                format!("(default) {}", fd.default)
            } else {
                value
            }
        );
    }
    tracing::info!("\n{}", serde_json::to_string_pretty(cfg)?);
    Ok(())
}

// ── Main menu ──

async fn cmd_main_menu(cfg: &NodeConfig) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print_menu();
        print!("\n  Select option: ");
        io::stdout().flush()?;
        let Some(choice) = lines.next() else {
            // stdin closed
            return Ok(());
        };
        match MenuAction::parse(&choice?) {
            Some(MenuAction::Install) => cmd_install(cfg, &mut lines).await?,
            Some(MenuAction::DownloadSnapshot) => cmd_snapshot(cfg, &mut lines).await?,
            Some(MenuAction::CheckSync) => cmd_check_sync(cfg).await?,
            Some(MenuAction::ViewLogs) => follow_logs(cfg).await?,
            Some(MenuAction::Exit) => return Ok(()),
            None => tracing::info!("Invalid option."),
        }
    }
}

fn usage() {
    tracing::info!("Usage:");
    tracing::info!("  nodepilot                 Interactive main menu");
    tracing::info!("  nodepilot install         Install both clients and register services");
    tracing::info!("  nodepilot snapshot [1|2]  Replace chain data from a snapshot mirror");
    tracing::info!("  nodepilot sync            Poll until the node has caught up");
    tracing::info!("  nodepilot logs            Follow service logs (Ctrl-C to stop)");
    tracing::info!("  nodepilot config          Show resolved configuration");
}

async fn dispatch(args: &[String], cfg: &NodeConfig) -> Result<()> {
    match args.get(1).map(|s| s.as_str()) {
        None => cmd_main_menu(cfg).await,
        Some("install") => {
            let stdin = io::stdin();
            cmd_install(cfg, &mut stdin.lock().lines()).await
        }
        Some("snapshot") => match args.get(2) {
            Some(choice) => {
                let systemd = Systemd::new(HostRunner);
                let fetcher = HttpArchiveFetcher::new(http_client()?);
                restore_snapshot(cfg, &systemd, &fetcher, choice).await
            }
            None => {
                let stdin = io::stdin();
                cmd_snapshot(cfg, &mut stdin.lock().lines()).await
            }
        },
        Some("sync") => cmd_check_sync(cfg).await,
        Some("logs") => follow_logs(cfg).await,
        Some("config") => cmd_config(cfg),
        Some(other) => {
            tracing::info!("Unknown command: {}", other);
            usage();
            std::process::exit(1);
        }
    }
}

// ── Main ──

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber.
    // Control verbosity with RUST_LOG env var:
    //   RUST_LOG=info   - default (steps, progress, heights)
    //   RUST_LOG=debug  - every host command that is run
    //   RUST_LOG=trace  - captured command output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    node_pilot::signals::spawn_watcher();

    load_dotenv(Path::new(".env"));
    let cfg = NodeConfig::load();

    let args: Vec<String> = std::env::args().collect();
    if let Err(e) = dispatch(&args, &cfg).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
