//! core config structures
//!
use serde::Serialize;

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{error::NodeError, service::Restart, Result, DEFAULT_POLL_INTERVAL_SECS, FIELD_DESCRIPTORS};

// ── Field descriptors ──

#[derive(Clone, Debug)]
pub struct Fd {
    pub section: &'static str,
    pub key: &'static str,
    pub ev: &'static str,
    pub label: &'static str,
    pub default: &'static str,
}

// ── .env file helpers ──

/// Load KEY=VALUE pairs from a .env file into process environment.
/// Skips comments (#) and empty lines. Does not override env vars that are
/// already set.
pub fn load_dotenv(env_path: &Path) {
    if let Ok(contents) = fs::read_to_string(env_path) {
        for (key, value) in parse_dotenv(&contents) {
            if std::env::var(&key).is_err() {
                std::env::set_var(key, value);
            }
        }
    }
}

pub fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| {
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(v);
            (k.trim().to_string(), v.to_string())
        })
        .collect()
}

// ── Port layout ──

/// Every listening port the two clients use. Shifted as a unit so several
/// nodes can share one host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PortLayout {
    pub p2p: u16,
    pub rpc: u16,
    pub proxy_app: u16,
    pub prometheus: u16,
    pub pprof: u16,
    pub api: u16,
    pub grpc: u16,
    pub exec_http: u16,
    pub exec_ws: u16,
    pub exec_authrpc: u16,
    pub exec_p2p: u16,
    pub exec_metrics: u16,
}

impl Default for PortLayout {
    fn default() -> Self {
        Self {
            p2p: 26656,
            rpc: 26657,
            proxy_app: 26658,
            prometheus: 26660,
            pprof: 6060,
            api: 1317,
            grpc: 9090,
            exec_http: 8545,
            exec_ws: 8546,
            exec_authrpc: 8551,
            exec_p2p: 30303,
            exec_metrics: 6061,
        }
    }
}

impl PortLayout {
    fn roles(&self) -> [(&'static str, u16); 12] {
        [
            ("p2p", self.p2p),
            ("rpc", self.rpc),
            ("proxy_app", self.proxy_app),
            ("prometheus", self.prometheus),
            ("pprof", self.pprof),
            ("api", self.api),
            ("grpc", self.grpc),
            ("exec_http", self.exec_http),
            ("exec_ws", self.exec_ws),
            ("exec_authrpc", self.exec_authrpc),
            ("exec_p2p", self.exec_p2p),
            ("exec_metrics", self.exec_metrics),
        ]
    }

    /// Add `offset` to every port. Rejects overflow and any two roles
    /// landing on the same port. Ports owned by other processes on the host
    /// are not checked.
    pub fn shifted(&self, offset: u16) -> Result<Self> {
        let shift = |role: &'static str, base: u16| {
            base.checked_add(offset)
                .ok_or(NodeError::PortOverflow { role, base, offset })
        };
        let layout = Self {
            p2p: shift("p2p", self.p2p)?,
            rpc: shift("rpc", self.rpc)?,
            proxy_app: shift("proxy_app", self.proxy_app)?,
            prometheus: shift("prometheus", self.prometheus)?,
            pprof: shift("pprof", self.pprof)?,
            api: shift("api", self.api)?,
            grpc: shift("grpc", self.grpc)?,
            exec_http: shift("exec_http", self.exec_http)?,
            exec_ws: shift("exec_ws", self.exec_ws)?,
            exec_authrpc: shift("exec_authrpc", self.exec_authrpc)?,
            exec_p2p: shift("exec_p2p", self.exec_p2p)?,
            exec_metrics: shift("exec_metrics", self.exec_metrics)?,
        };
        layout.check_distinct()?;
        Ok(layout)
    }

    pub fn check_distinct(&self) -> Result<()> {
        let roles = self.roles();
        for (i, (first, port)) in roles.iter().enumerate() {
            if let Some((second, _)) = roles[i + 1..].iter().find(|(_, p)| p == port) {
                return Err(NodeError::PortCollision {
                    port: *port,
                    first: *first,
                    second: *second,
                });
            }
        }
        Ok(())
    }
}

/// Parse the operator's port offset. Empty input means no shift.
pub fn parse_port_offset(input: &str) -> Result<u16> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(0);
    }
    input
        .parse::<u16>()
        .map_err(|_| NodeError::InvalidPortOffset(input.to_string()))
}

// ── NodeConfig ──

#[derive(Clone, Debug, Serialize)]
pub struct MirrorSource {
    pub name: String,
    pub consensus_url: String,
    pub execution_url: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeConfig {
    pub bin_dir: PathBuf,
    pub src_dir: PathBuf,
    pub unit_dir: PathBuf,

    pub chain_id: String,
    pub genesis_url: String,
    pub addrbook_url: String,
    pub seeds: String,
    pub persistent_peers: String,
    pub public_ip_url: Option<String>,

    pub consensus_bin: String,
    pub consensus_home: PathBuf,
    pub consensus_repo: String,
    pub consensus_tag: String,
    pub consensus_build_output: String,
    pub indexer: String,
    pub prometheus: bool,

    pub execution_bin: String,
    pub execution_home: PathBuf,
    pub execution_url: String,
    pub execution_sha256: Option<String>,
    pub execution_data_subdir: String,
    pub execution_extra_args: Vec<String>,

    pub consensus_service: String,
    pub execution_service: String,
    pub service_user: String,
    pub restart: Restart,
    pub restart_sec: u64,
    pub nofile: u64,
    pub packages: Vec<String>,

    pub mirrors: [MirrorSource; 2],

    pub reference_rpc: String,
    pub poll_interval: Duration,
}

impl NodeConfig {
    /// Resolve every field descriptor from the process environment (after
    /// `load_dotenv`), falling back to descriptor defaults.
    pub fn load() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        Self::from_lookup(&home, |ev| std::env::var(ev).ok())
    }

    /// Build the config from an arbitrary lookup. Empty values count as unset.
    pub fn from_lookup<F>(home: &Path, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |section: &str, key: &str| -> String {
            let fd = FIELD_DESCRIPTORS
                .iter()
                .find(|fd| fd.section == section && fd.key == key);
            match fd {
                Some(fd) => lookup(fd.ev)
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| fd.default.to_string()),
                None => String::new(),
            }
        };
        let path_or = |value: String, fallback: PathBuf| {
            if value.is_empty() {
                fallback
            } else {
                PathBuf::from(value)
            }
        };
        let words = |value: String| -> Vec<String> {
            value.split_whitespace().map(String::from).collect()
        };
        let number = |section: &str, key: &str, fallback: u64| {
            let raw = get(section, key);
            raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!("  {}.{} = {:?} is not a number; using {}", section, key, raw, fallback);
                fallback
            })
        };

        let base_dir = path_or(get("paths", "base_dir"), home.to_path_buf());
        let sha = get("execution", "sha256");

        Self {
            bin_dir: PathBuf::from(get("paths", "bin_dir")),
            src_dir: path_or(get("paths", "src_dir"), base_dir.join("src")),
            unit_dir: PathBuf::from(get("paths", "unit_dir")),

            chain_id: get("chain", "chain_id"),
            genesis_url: get("chain", "genesis_url"),
            addrbook_url: get("chain", "addrbook_url"),
            seeds: get("chain", "seeds"),
            persistent_peers: get("chain", "persistent_peers"),
            public_ip_url: Some(get("chain", "public_ip_url")).filter(|u| u != "off"),

            consensus_bin: get("consensus", "binary"),
            consensus_home: path_or(get("consensus", "home"), base_dir.join(".consensus")),
            consensus_repo: get("consensus", "repo"),
            consensus_tag: get("consensus", "tag"),
            consensus_build_output: get("consensus", "build_output"),
            indexer: get("consensus", "indexer"),
            prometheus: matches!(
                get("consensus", "prometheus").to_lowercase().as_str(),
                "true" | "1" | "yes" | "y"
            ),

            execution_bin: get("execution", "binary"),
            execution_home: path_or(get("execution", "home"), base_dir.join(".execution")),
            execution_url: get("execution", "url"),
            execution_sha256: (!sha.is_empty()).then(|| sha.to_lowercase()),
            execution_data_subdir: get("execution", "data_subdir"),
            execution_extra_args: words(get("execution", "extra_args")),

            consensus_service: get("service", "consensus_name"),
            execution_service: get("service", "execution_name"),
            service_user: get("service", "user"),
            restart: Restart::parse(&get("service", "restart")),
            restart_sec: number("service", "restart_sec", 3),
            nofile: number("service", "nofile", 65535),
            packages: words(get("service", "packages")),

            mirrors: [
                MirrorSource {
                    name: get("snapshot", "mirror1_name"),
                    consensus_url: get("snapshot", "mirror1_consensus"),
                    execution_url: get("snapshot", "mirror1_execution"),
                },
                MirrorSource {
                    name: get("snapshot", "mirror2_name"),
                    consensus_url: get("snapshot", "mirror2_consensus"),
                    execution_url: get("snapshot", "mirror2_execution"),
                },
            ],

            reference_rpc: get("sync", "reference_rpc"),
            // zero would hammer both RPCs back to back
            poll_interval: Duration::from_secs(
                number("sync", "poll_interval", DEFAULT_POLL_INTERVAL_SECS).max(1),
            ),
        }
    }

    pub fn consensus_config_dir(&self) -> PathBuf {
        self.consensus_home.join("config")
    }

    pub fn consensus_config_toml(&self) -> PathBuf {
        self.consensus_config_dir().join("config.toml")
    }

    pub fn companion_config_toml(&self) -> PathBuf {
        self.consensus_config_dir().join("app.toml")
    }

    pub fn consensus_data_dir(&self) -> PathBuf {
        self.consensus_home.join("data")
    }

    pub fn execution_data_dir(&self) -> PathBuf {
        self.execution_home.join(&self.execution_data_subdir)
    }

    pub fn consensus_bin_path(&self) -> PathBuf {
        self.bin_dir.join(&self.consensus_bin)
    }

    pub fn execution_bin_path(&self) -> PathBuf {
        self.bin_dir.join(&self.execution_bin)
    }

    pub fn consensus_checkout(&self) -> PathBuf {
        let name = self
            .consensus_repo
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .map(|n| n.trim_end_matches(".git"))
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.consensus_bin);
        self.src_dir.join(name)
    }
}
