use std::sync::LazyLock;

pub mod cli;
pub mod config;
pub mod error;
pub mod install;
pub mod logs;
pub mod patcher;
pub mod runner;
pub mod service;
pub mod signals;
pub mod snapshots;
pub mod sync;

pub use error::{NodeError, Result};

/// Name of the file CometBFT-style consensus clients use to record the last
/// signed height/round. Losing it across a data wipe risks double-signing.
pub const SIGNING_STATE_FILE: &str = "priv_validator_state.json";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Declares a table of [`config::Fd`] entries:
/// `"section"/"key" => "ENV_VAR", "label", "default",`
#[macro_export]
macro_rules! define_fields {
    ($($section:literal / $key:literal => $ev:literal, $label:literal, $default:literal),* $(,)?) => {
        &[$($crate::config::Fd {
            section: $section,
            key: $key,
            ev: $ev,
            label: $label,
            default: $default,
        }),*]
    };
}

pub static FIELD_DESCRIPTORS: LazyLock<Vec<config::Fd>> = LazyLock::new(|| {
    [PATHS_FD, CHAIN_FD, CONSENSUS_FD, EXECUTION_FD, SERVICE_FD, SNAPSHOT_FD, SYNC_FD]
        .iter()
        .flat_map(|group| group.iter().cloned())
        .collect()
});

pub const PATHS_FD: &[config::Fd] = define_fields![
    "paths"/"base_dir"  => "NODEPILOT_BASE_DIR",  "Base directory for node homes (empty = $HOME)", "",
    "paths"/"bin_dir"   => "NODEPILOT_BIN_DIR",   "Directory installed binaries are placed in",    "/usr/local/bin",
    "paths"/"src_dir"   => "NODEPILOT_SRC_DIR",   "Directory source checkouts are placed in (empty = <base>/src)", "",
    "paths"/"unit_dir"  => "NODEPILOT_UNIT_DIR",  "systemd unit directory",                        "/etc/systemd/system",
];

pub const CHAIN_FD: &[config::Fd] = define_fields![
    "chain"/"chain_id"         => "NODEPILOT_CHAIN_ID",         "Chain ID",                          "",
    "chain"/"genesis_url"      => "NODEPILOT_GENESIS_URL",      "Genesis URL (empty = keep init genesis)", "",
    "chain"/"addrbook_url"     => "NODEPILOT_ADDRBOOK_URL",     "Address book URL (empty = skip)",  "",
    "chain"/"seeds"            => "NODEPILOT_SEEDS",            "Seed peers (id@host:port,...)",    "",
    "chain"/"persistent_peers" => "NODEPILOT_PERSISTENT_PEERS", "Persistent peers (id@host:port,...)", "",
    "chain"/"public_ip_url"    => "NODEPILOT_PUBLIC_IP_URL",    "Public IP lookup URL (off = skip)", "https://api.ipify.org",
];

pub const CONSENSUS_FD: &[config::Fd] = define_fields![
    "consensus"/"binary"       => "NODEPILOT_CONSENSUS_BIN",          "Consensus client binary name",      "consensusd",
    "consensus"/"home"         => "NODEPILOT_CONSENSUS_HOME",         "Consensus client home (empty = <base>/.consensus)", "",
    "consensus"/"repo"         => "NODEPILOT_CONSENSUS_REPO",         "Consensus client git repository",   "",
    "consensus"/"tag"          => "NODEPILOT_CONSENSUS_TAG",          "Consensus client git tag",          "main",
    "consensus"/"build_output" => "NODEPILOT_CONSENSUS_BUILD_OUTPUT", "Built binary path inside the checkout", "build/consensusd",
    "consensus"/"indexer"      => "NODEPILOT_INDEXER",                "Transaction indexer (null|kv)",     "null",
    "consensus"/"prometheus"   => "NODEPILOT_PROMETHEUS",             "Enable prometheus metrics",         "true",
];

pub const EXECUTION_FD: &[config::Fd] = define_fields![
    "execution"/"binary"       => "NODEPILOT_EXECUTION_BIN",    "Execution client binary name",      "geth",
    "execution"/"home"         => "NODEPILOT_EXECUTION_HOME",   "Execution client data dir (empty = <base>/.execution)", "",
    "execution"/"url"          => "NODEPILOT_EXECUTION_URL",    "Execution client release URL",      "",
    "execution"/"sha256"       => "NODEPILOT_EXECUTION_SHA256", "Execution client sha256 (empty = skip check)", "",
    "execution"/"data_subdir"  => "NODEPILOT_EXECUTION_DATA",   "Chain data directory inside the data dir", "geth",
    "execution"/"extra_args"   => "NODEPILOT_EXECUTION_ARGS",   "Extra execution client flags",      "",
];

pub const SERVICE_FD: &[config::Fd] = define_fields![
    "service"/"consensus_name" => "NODEPILOT_CONSENSUS_SERVICE", "Consensus systemd service name", "consensusd",
    "service"/"execution_name" => "NODEPILOT_EXECUTION_SERVICE", "Execution systemd service name", "geth",
    "service"/"user"           => "NODEPILOT_SERVICE_USER",      "User the services run as",       "root",
    "service"/"restart"        => "NODEPILOT_RESTART",           "Restart policy (on-failure|always)", "on-failure",
    "service"/"restart_sec"    => "NODEPILOT_RESTART_SEC",       "Restart delay (seconds)",        "3",
    "service"/"nofile"         => "NODEPILOT_NOFILE",            "Open file descriptor limit",     "65535",
    "service"/"packages"       => "NODEPILOT_PACKAGES",          "Host packages installed with apt", "curl git jq make gcc",
];

pub const SNAPSHOT_FD: &[config::Fd] = define_fields![
    "snapshot"/"mirror1_name"      => "NODEPILOT_MIRROR1_NAME",      "Mirror 1 name",                   "mirror-1",
    "snapshot"/"mirror1_consensus" => "NODEPILOT_MIRROR1_CONSENSUS", "Mirror 1 consensus archive URL",  "",
    "snapshot"/"mirror1_execution" => "NODEPILOT_MIRROR1_EXECUTION", "Mirror 1 execution archive URL",  "",
    "snapshot"/"mirror2_name"      => "NODEPILOT_MIRROR2_NAME",      "Mirror 2 name",                   "mirror-2",
    "snapshot"/"mirror2_consensus" => "NODEPILOT_MIRROR2_CONSENSUS", "Mirror 2 consensus archive URL",  "",
    "snapshot"/"mirror2_execution" => "NODEPILOT_MIRROR2_EXECUTION", "Mirror 2 execution archive URL",  "",
];

pub const SYNC_FD: &[config::Fd] = define_fields![
    "sync"/"reference_rpc" => "NODEPILOT_REFERENCE_RPC", "Reference RPC used to compare heights", "",
    "sync"/"poll_interval" => "NODEPILOT_POLL_INTERVAL", "Sync poll interval (seconds)",          "5",
];
