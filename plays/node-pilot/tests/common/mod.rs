// Host doubles shared by the integration tests. Nothing here touches systemd,
// the network or a real build toolchain; every side effect lands in a tempdir.
#![allow(dead_code)]

use node_pilot::{
    config::NodeConfig,
    runner::{CommandOutput, CommandRunner, CommandSpec},
    service::ServiceManager,
    snapshots::ArchiveFetcher,
    sync::HeightSource,
    NodeError, Result,
};

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Config rooted at `base`, with binaries and unit files kept inside it too.
pub fn config_in(base: &Path, extra: &[(&str, &str)]) -> NodeConfig {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("NODEPILOT_BASE_DIR".to_string(), base.display().to_string()),
        ("NODEPILOT_BIN_DIR".to_string(), base.join("bin").display().to_string()),
        ("NODEPILOT_UNIT_DIR".to_string(), base.join("units").display().to_string()),
        ("NODEPILOT_PUBLIC_IP_URL".to_string(), "off".to_string()),
        ("NODEPILOT_MIRROR1_CONSENSUS".to_string(), "https://mirror.test/consensus.tar.zst".to_string()),
        ("NODEPILOT_MIRROR1_EXECUTION".to_string(), "https://mirror.test/execution.tar.zst".to_string()),
    ]);
    for (k, v) in extra {
        vars.insert(k.to_string(), v.to_string());
    }
    NodeConfig::from_lookup(base, |ev| vars.get(ev).cloned())
}

// ── Service manager ──

/// Records every call as `"<action> <unit>"` and tracks which units are up.
#[derive(Default)]
pub struct FakeServices {
    pub calls: Mutex<Vec<String>>,
    pub active: Mutex<HashSet<String>>,
    /// Units whose `start` fails.
    pub fail_start: HashSet<String>,
    /// Units whose `stop` fails.
    pub fail_stop: HashSet<String>,
    /// File read at every successful `start`, to check what a starting
    /// unit would find on disk.
    pub watch: Option<PathBuf>,
    pub seen_on_start: Mutex<Vec<Option<String>>>,
}

impl FakeServices {
    pub fn running(units: &[&str]) -> Self {
        Self {
            active: Mutex::new(units.iter().map(|u| u.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that change unit state (is-active checks left out).
    pub fn transitions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("is-active"))
            .collect()
    }

    pub fn is_up(&self, unit: &str) -> bool {
        self.active.lock().unwrap().contains(unit)
    }

    fn record(&self, action: &str, unit: &str) {
        self.calls.lock().unwrap().push(format!("{} {}", action, unit).trim().to_string());
    }
}

impl ServiceManager for FakeServices {
    async fn daemon_reload(&self) -> Result<()> {
        self.record("daemon-reload", "");
        Ok(())
    }

    async fn enable(&self, unit: &str) -> Result<()> {
        self.record("enable", unit);
        Ok(())
    }

    async fn start(&self, unit: &str) -> Result<()> {
        self.record("start", unit);
        if self.fail_start.contains(unit) {
            return Err(NodeError::service("start", unit, "unit failed to start"));
        }
        if let Some(path) = &self.watch {
            self.seen_on_start.lock().unwrap().push(fs::read_to_string(path).ok());
        }
        self.active.lock().unwrap().insert(unit.to_string());
        Ok(())
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        self.record("stop", unit);
        if self.fail_stop.contains(unit) {
            return Err(NodeError::service("stop", unit, "timed out"));
        }
        self.active.lock().unwrap().remove(unit);
        Ok(())
    }

    async fn restart(&self, unit: &str) -> Result<()> {
        self.record("restart", unit);
        self.active.lock().unwrap().insert(unit.to_string());
        Ok(())
    }

    async fn is_active(&self, unit: &str) -> Result<bool> {
        self.record("is-active", unit);
        Ok(self.is_up(unit))
    }
}

// ── Archive fetcher ──

/// "Unpacks" an archive by writing a marker file named after the URL's last
/// path segment. Archives that ship their own signing state overwrite it with
/// a zero height, the way real snapshots do.
#[derive(Default)]
pub struct FakeFetcher {
    pub fetched: Mutex<Vec<String>>,
    pub ships_signing_state: bool,
    /// Deleted during the download step.
    pub lose_file: Option<PathBuf>,
    pub fail: bool,
}

pub const SNAPSHOT_SIGNING_STATE: &str = r#"{"height":"0","round":0,"step":0}"#;

impl ArchiveFetcher for FakeFetcher {
    async fn fetch_into(&self, url: &str, dest: &Path) -> Result<()> {
        self.fetched.lock().unwrap().push(url.to_string());
        if self.fail {
            return Err(NodeError::setup(format!("fetch {}", url), "HTTP status 404 Not Found"));
        }
        if let Some(path) = &self.lose_file {
            fs::remove_file(path).ok();
        }
        let marker = url.rsplit('/').next().unwrap_or("archive");
        fs::write(dest.join(marker), b"snapshot")?;
        if self.ships_signing_state {
            fs::write(dest.join(node_pilot::SIGNING_STATE_FILE), SNAPSHOT_SIGNING_STATE)?;
        }
        Ok(())
    }
}

// ── Height source ──

/// Replays a fixed script of heights; the last entry repeats forever.
pub struct ScriptedHeights {
    script: Mutex<VecDeque<Result<u64>>>,
    last: u64,
}

impl ScriptedHeights {
    pub fn new(script: Vec<Result<u64>>) -> Self {
        let last = script
            .iter()
            .rev()
            .find_map(|h| h.as_ref().ok().copied())
            .unwrap_or(0);
        Self {
            script: Mutex::new(script.into()),
            last,
        }
    }

    pub fn heights(values: &[u64]) -> Self {
        Self::new(values.iter().map(|h| Ok(*h)).collect())
    }
}

impl HeightSource for ScriptedHeights {
    async fn latest_height(&self) -> Result<u64> {
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(self.last))
    }
}

// ── Command runner ──

/// Stands in for apt, git, make and the consensus binary. `make build`
/// drops a binary at the build output path and `init` writes template
/// config files, so the steps after them see what a real host would leave.
pub struct FakeHost {
    pub calls: Mutex<Vec<String>>,
    pub build_output: String,
    pub fail_on: Option<&'static str>,
}

impl FakeHost {
    pub fn new(cfg: &NodeConfig) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            build_output: cfg.consensus_build_output.clone(),
            fail_on: None,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

pub const CONFIG_TEMPLATE: &str = r#"proxy_app = "tcp://127.0.0.1:26658"
moniker = "placeholder"

[rpc]
laddr = "tcp://127.0.0.1:26657"
pprof_laddr = "localhost:6060"

[p2p]
laddr = "tcp://0.0.0.0:26656"
external_address = ""
seeds = ""
persistent_peers = ""

[tx_index]
indexer = "kv"

[instrumentation]
prometheus = false
prometheus_listen_addr = ":26660"
"#;

pub const APP_TEMPLATE: &str = r#"[api]
enable = true
address = "tcp://localhost:1317"

[grpc]
address = "localhost:9090"
"#;

impl CommandRunner for FakeHost {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.display();
        self.calls.lock().unwrap().push(line.clone());
        if self.fail_on.is_some_and(|f| line.contains(f)) {
            return Err(NodeError::Command {
                program: spec.program.clone(),
                status: "exit status: 2".into(),
                stderr: "fake failure".into(),
            });
        }

        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        match (spec.program.as_str(), args.as_slice()) {
            ("git", ["clone", .., dest]) => {
                fs::create_dir_all(Path::new(dest).join(".git"))?;
            }
            ("make", ["build"]) => {
                let cwd = spec.cwd.clone().unwrap_or_default();
                let out = cwd.join(&self.build_output);
                fs::create_dir_all(out.parent().unwrap_or(cwd.as_path()))?;
                fs::write(out, b"#!/bin/sh\n")?;
            }
            (_, ["init", _moniker, "--home", home, ..]) => {
                let config = Path::new(home).join("config");
                fs::create_dir_all(&config)?;
                fs::create_dir_all(Path::new(home).join("data"))?;
                fs::write(config.join("config.toml"), CONFIG_TEMPLATE)?;
                fs::write(config.join("app.toml"), APP_TEMPLATE)?;
            }
            _ => {}
        }
        Ok(CommandOutput::default())
    }
}
