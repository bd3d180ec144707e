//! Node installation: host packages, client binaries, consensus home,
//! config patching and service registration.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::{
    config::{NodeConfig, PortLayout},
    patcher::{companion_rules, consensus_rules, patch_file},
    runner::{CommandRunner, CommandSpec},
    service::{consensus_service, execution_service, register, ServiceManager},
    NodeError, Result,
};

/// Answers collected from the operator before installing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallRequest {
    pub moniker: String,
    pub port_offset: u16,
}

pub struct Installer<'a, R, M> {
    cfg: &'a NodeConfig,
    runner: &'a R,
    manager: &'a M,
    client: reqwest::Client,
}

impl<'a, R: CommandRunner, M: ServiceManager> Installer<'a, R, M> {
    pub fn new(cfg: &'a NodeConfig, runner: &'a R, manager: &'a M, client: reqwest::Client) -> Self {
        Self {
            cfg,
            runner,
            manager,
            client,
        }
    }

    pub async fn run(&self, req: &InstallRequest) -> Result<PortLayout> {
        let ports = PortLayout::default().shifted(req.port_offset)?;
        tracing::info!("=== Installing {} (port offset {}) ===", req.moniker, req.port_offset);

        tracing::info!("\n── Host packages ──");
        self.install_packages().await?;

        tracing::info!("\n── Execution client ──");
        self.install_execution_binary().await?;

        tracing::info!("\n── Consensus client ──");
        self.build_consensus().await?;
        self.init_consensus(&req.moniker).await?;
        self.fetch_chain_files().await?;

        tracing::info!("\n── Configuration ──");
        let external_ip = self.public_ip().await;
        patch_file(
            &self.cfg.consensus_config_toml(),
            &consensus_rules(self.cfg, &req.moniker, &ports, external_ip.as_deref()),
            None,
        )?;
        patch_file(&self.cfg.companion_config_toml(), &companion_rules(&ports), None)?;

        tracing::info!("\n── Services ──");
        fs::create_dir_all(&self.cfg.execution_home)?;
        register(self.manager, &self.cfg.unit_dir, &execution_service(self.cfg, &ports)).await?;
        register(self.manager, &self.cfg.unit_dir, &consensus_service(self.cfg)).await?;

        tracing::info!("\nInstall complete. RPC on 127.0.0.1:{}, P2P on {}.", ports.rpc, ports.p2p);
        Ok(ports)
    }

    async fn install_packages(&self) -> Result<()> {
        if self.cfg.packages.is_empty() {
            return Ok(());
        }
        let step = |e: NodeError| NodeError::setup("package install", e);
        self.runner
            .run(&CommandSpec::new("apt-get", ["update"]).env("DEBIAN_FRONTEND", "noninteractive"))
            .await
            .map_err(step)?;
        let mut args = vec!["install".to_string(), "-y".to_string()];
        args.extend(self.cfg.packages.iter().cloned());
        self.runner
            .run(&CommandSpec::new("apt-get", args).env("DEBIAN_FRONTEND", "noninteractive"))
            .await
            .map_err(step)?;
        Ok(())
    }

    async fn install_execution_binary(&self) -> Result<()> {
        let dest = self.cfg.execution_bin_path();
        if dest.is_file() {
            tracing::info!("  {} already installed, skipping download", dest.display());
            return Ok(());
        }
        if self.cfg.execution_url.is_empty() {
            return Err(NodeError::Config("NODEPILOT_EXECUTION_URL is not set".into()));
        }
        download_binary(
            &self.client,
            &self.cfg.execution_url,
            &dest,
            self.cfg.execution_sha256.as_deref(),
        )
        .await
    }

    async fn build_consensus(&self) -> Result<()> {
        let dest = self.cfg.consensus_bin_path();
        let checkout = self.cfg.consensus_checkout();
        let tag = self.cfg.consensus_tag.as_str();
        let step = |e: NodeError| NodeError::setup("consensus client build", e);

        if self.cfg.consensus_repo.is_empty() {
            if dest.is_file() {
                tracing::info!("  No repository configured; using existing {}", dest.display());
                return Ok(());
            }
            return Err(NodeError::Config("NODEPILOT_CONSENSUS_REPO is not set".into()));
        }

        if checkout.join(".git").is_dir() {
            tracing::info!("  Updating {} to {}", checkout.display(), tag);
            self.runner
                .run(&CommandSpec::new("git", ["fetch", "--tags", "origin"]).in_dir(&checkout))
                .await
                .map_err(step)?;
            self.runner
                .run(&CommandSpec::new("git", ["checkout", tag]).in_dir(&checkout))
                .await
                .map_err(step)?;
        } else {
            fs::create_dir_all(&self.cfg.src_dir)?;
            tracing::info!("  Cloning {} at {}", self.cfg.consensus_repo, tag);
            self.runner
                .run(&CommandSpec::new(
                    "git",
                    [
                        "clone".to_string(),
                        "--branch".to_string(),
                        tag.to_string(),
                        self.cfg.consensus_repo.clone(),
                        checkout.display().to_string(),
                    ],
                ))
                .await
                .map_err(step)?;
        }

        tracing::info!("  Building (this can take several minutes)...");
        self.runner
            .run(&CommandSpec::new("make", ["build"]).in_dir(&checkout))
            .await
            .map_err(step)?;

        let built = checkout.join(&self.cfg.consensus_build_output);
        if !built.is_file() {
            return Err(NodeError::setup(
                "consensus client build",
                format!("build finished but {} is missing", built.display()),
            ));
        }
        install_file(&built, &dest)?;
        tracing::info!("  Installed {}", dest.display());
        Ok(())
    }

    async fn init_consensus(&self, moniker: &str) -> Result<()> {
        if self.cfg.consensus_config_toml().is_file() {
            tracing::info!("  {} already initialised", self.cfg.consensus_home.display());
            return Ok(());
        }
        let mut args = vec![
            "init".to_string(),
            moniker.to_string(),
            "--home".to_string(),
            self.cfg.consensus_home.display().to_string(),
        ];
        if !self.cfg.chain_id.is_empty() {
            args.push("--chain-id".into());
            args.push(self.cfg.chain_id.clone());
        }
        let bin = self.cfg.consensus_bin_path().display().to_string();
        self.runner
            .run(&CommandSpec::new(&bin, args))
            .await
            .map_err(|e| NodeError::setup("consensus init", e))?;
        Ok(())
    }

    async fn fetch_chain_files(&self) -> Result<()> {
        let config_dir = self.cfg.consensus_config_dir();
        for (url, name) in [
            (&self.cfg.genesis_url, "genesis.json"),
            (&self.cfg.addrbook_url, "addrbook.json"),
        ] {
            if url.is_empty() {
                continue;
            }
            tracing::info!("  Fetching {}", name);
            download_file(&self.client, url, &config_dir.join(name)).await?;
        }
        Ok(())
    }

    /// Best effort; the external address is simply not set when this fails.
    async fn public_ip(&self) -> Option<String> {
        let url = self.cfg.public_ip_url.as_deref()?;
        match fetch_text(&self.client, url).await {
            Ok(ip) if ip.trim().parse::<std::net::IpAddr>().is_ok() => Some(ip.trim().to_string()),
            Ok(other) => {
                tracing::warn!("  Public IP lookup returned {:?}; external_address left unset", other.trim());
                None
            }
            Err(e) => {
                tracing::warn!("  Public IP lookup failed: {}; external_address left unset", e);
                None
            }
        }
    }
}

async fn fetch_text(client: &reqwest::Client, url: &str) -> reqwest::Result<String> {
    client
        .get(url)
        .timeout(Duration::from_secs(10))
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
}

fn part_path(dest: &Path) -> PathBuf {
    let mut part = dest.as_os_str().to_owned();
    part.push(".part");
    PathBuf::from(part)
}

/// Copy `src` beside `dest` and rename it into place. `dest` may be the
/// binary a running service was started from, which cannot be opened for
/// writing (ETXTBSY); the rename swaps the directory entry instead.
fn install_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let part = part_path(dest);
    let staged = fs::copy(src, &part)
        .map_err(NodeError::from)
        .and_then(|_| make_executable(&part));
    if let Err(e) = staged {
        fs::remove_file(&part).ok();
        return Err(e);
    }
    fs::rename(&part, dest)?;
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Compare a computed digest against the configured one (case-insensitive).
pub fn check_sha256(actual_hex: &str, expected_hex: &str) -> Result<()> {
    if actual_hex.eq_ignore_ascii_case(expected_hex.trim()) {
        Ok(())
    } else {
        Err(NodeError::setup(
            "checksum verification",
            format!("expected sha256 {}, got {}", expected_hex.trim(), actual_hex),
        ))
    }
}

/// Stream `url` into `dest` through a `.part` file, returning the sha256 of
/// what was written. The final path only appears once the body is complete;
/// a failed transfer removes the partial file.
async fn stream_to_file(client: &reqwest::Client, url: &str, dest: &Path) -> Result<(PathBuf, String)> {
    let resp = client
        .get(url)
        .send()
        .await?
        .error_for_status()
        .map_err(|e| NodeError::setup(format!("download {}", url), e))?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let part = part_path(dest);
    match write_body(resp, &part).await {
        Ok(digest) => Ok((part, digest)),
        Err(e) => {
            fs::remove_file(&part).ok();
            Err(e)
        }
    }
}

async fn write_body(resp: reqwest::Response, part: &Path) -> Result<String> {
    let mut file = tokio::fs::File::create(part).await?;
    let mut hasher = Sha256::new();
    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(hex::encode(hasher.finalize()))
}

pub async fn download_file(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    let (part, _) = stream_to_file(client, url, dest).await?;
    fs::rename(&part, dest)?;
    Ok(())
}

pub async fn download_binary(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    sha256: Option<&str>,
) -> Result<()> {
    tracing::info!("  Downloading {}", url);
    let (part, digest) = stream_to_file(client, url, dest).await?;
    if let Some(expected) = sha256 {
        if let Err(e) = check_sha256(&digest, expected) {
            fs::remove_file(&part).ok();
            return Err(e);
        }
        tracing::info!("  sha256 verified");
    }
    make_executable(&part)?;
    fs::rename(&part, dest)?;
    tracing::info!("  Installed {}", dest.display());
    Ok(())
}
