//! Chain-state snapshot replacement.
//!
//! `RUNNING → STOPPED → WIPED → DOWNLOADING → RESTORED → RUNNING`
//!
//! The consensus client's signing state file is copied out of the data
//! directory before the wipe and copied back before either service is
//! started again. Any failed step aborts the rest.

use std::{
    fmt, fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

use futures::TryStreamExt;
use tokio_util::io::{StreamReader, SyncIoBridge};

use crate::{
    config::{MirrorSource, NodeConfig},
    service::ServiceManager,
    NodeError, Result, SIGNING_STATE_FILE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mirror {
    First,
    Second,
}

impl Mirror {
    /// Only "1" and "2" are accepted.
    pub fn parse(input: &str) -> Result<Self> {
        match input.trim() {
            "1" => Ok(Mirror::First),
            "2" => Ok(Mirror::Second),
            other => Err(NodeError::InvalidMirror(other.to_string())),
        }
    }

    pub fn source<'a>(&self, cfg: &'a NodeConfig) -> &'a MirrorSource {
        match self {
            Mirror::First => &cfg.mirrors[0],
            Mirror::Second => &cfg.mirrors[1],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotPhase {
    Running,
    Stopped,
    Wiped,
    Downloading,
    Restored,
}

impl fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotPhase::Running => "RUNNING",
            SnapshotPhase::Stopped => "STOPPED",
            SnapshotPhase::Wiped => "WIPED",
            SnapshotPhase::Downloading => "DOWNLOADING",
            SnapshotPhase::Restored => "RESTORED",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotStep {
    StopServices,
    PreserveSigningState,
    WipeData,
    Download,
    RestoreSigningState,
    StartServices,
}

impl fmt::Display for SnapshotStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotStep::StopServices => "stopping services",
            SnapshotStep::PreserveSigningState => "preserving signing state",
            SnapshotStep::WipeData => "wiping chain data",
            SnapshotStep::Download => "downloading archives",
            SnapshotStep::RestoreSigningState => "restoring signing state",
            SnapshotStep::StartServices => "starting services",
        };
        f.write_str(s)
    }
}

// ── Archive fetching ──

#[allow(async_fn_in_trait)]
pub trait ArchiveFetcher {
    /// Download `url` and unpack it into `dest`, which already exists and is
    /// empty.
    async fn fetch_into(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Streams a `.tar.zst` archive over HTTP straight into the unpacker. The
/// archive is never held in memory or on disk as a whole.
#[derive(Clone, Debug, Default)]
pub struct HttpArchiveFetcher {
    client: reqwest::Client,
}

impl HttpArchiveFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ArchiveFetcher for HttpArchiveFetcher {
    async fn fetch_into(&self, url: &str, dest: &Path) -> Result<()> {
        tracing::info!("  Fetching {}", url);
        let resp = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| NodeError::setup(format!("fetch {}", url), e))?;
        if let Some(len) = resp.content_length() {
            tracing::info!("  Archive size: {} MiB", len / (1024 * 1024));
        }

        let stream = Box::pin(resp.bytes_stream().map_err(io::Error::other));
        let reader = SyncIoBridge::new(StreamReader::new(stream));
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_zstd_tar(reader, &dest))
            .await
            .map_err(|e| NodeError::setup("extract archive", e))?
    }
}

/// Decompress a zstd stream and unpack the tar inside it into `dest`.
pub fn unpack_zstd_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let decoder = zstd::stream::read::Decoder::new(reader)
        .map_err(|e| NodeError::setup("open zstd stream", e))?;
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .map_err(|e| NodeError::setup(format!("unpack into {}", dest.display()), e))
}

// ── Installer ──

pub fn signing_state_path(cfg: &NodeConfig) -> PathBuf {
    cfg.consensus_data_dir().join(SIGNING_STATE_FILE)
}

/// Backup location, outside every directory the wipe touches.
pub fn signing_state_backup_path(cfg: &NodeConfig) -> PathBuf {
    cfg.consensus_home
        .join(format!("{}.backup", SIGNING_STATE_FILE))
}

pub struct SnapshotInstaller<'a, M, F> {
    cfg: &'a NodeConfig,
    manager: &'a M,
    fetcher: &'a F,
    phase: SnapshotPhase,
}

impl<'a, M: ServiceManager, F: ArchiveFetcher> SnapshotInstaller<'a, M, F> {
    pub fn new(cfg: &'a NodeConfig, manager: &'a M, fetcher: &'a F) -> Self {
        Self {
            cfg,
            manager,
            fetcher,
            phase: SnapshotPhase::Running,
        }
    }

    /// Last state the installer reached.
    pub fn phase(&self) -> SnapshotPhase {
        self.phase
    }

    fn advance(&mut self, next: SnapshotPhase) {
        tracing::info!("  [snapshot] {} → {}", self.phase, next);
        self.phase = next;
    }

    pub async fn run(&mut self, mirror: Mirror) -> Result<()> {
        let source = mirror.source(self.cfg).clone();
        check_source(&source)?;
        tracing::info!("=== Snapshot restore from {} ===", source.name);

        let units = [
            self.cfg.consensus_service.clone(),
            self.cfg.execution_service.clone(),
        ];

        step(SnapshotStep::StopServices, self.stop_all(&units)).await?;
        self.advance(SnapshotPhase::Stopped);

        let backup = step(SnapshotStep::PreserveSigningState, async {
            self.preserve_signing_state()
        })
        .await?;

        step(SnapshotStep::WipeData, async { self.wipe() }).await?;
        self.advance(SnapshotPhase::Wiped);

        self.advance(SnapshotPhase::Downloading);
        step(SnapshotStep::Download, self.download(&source)).await?;

        step(SnapshotStep::RestoreSigningState, async {
            self.restore_signing_state(&backup)
        })
        .await?;
        self.advance(SnapshotPhase::Restored);

        // execution first; the consensus client dials it on start
        let start_order = [
            self.cfg.execution_service.clone(),
            self.cfg.consensus_service.clone(),
        ];
        step(SnapshotStep::StartServices, self.start_all(&start_order)).await?;
        self.advance(SnapshotPhase::Running);
        tracing::info!("  Snapshot restored; services running.");
        Ok(())
    }

    async fn stop_all(&self, units: &[String]) -> Result<()> {
        for unit in units {
            tracing::info!("  Stopping {}", unit);
            self.manager.stop(unit).await?;
        }
        for unit in units {
            if self.manager.is_active(unit).await? {
                return Err(NodeError::service("stop", unit, "still active after stop"));
            }
        }
        Ok(())
    }

    fn preserve_signing_state(&self) -> Result<PathBuf> {
        let state = signing_state_path(self.cfg);
        let backup = signing_state_backup_path(self.cfg);
        if !state.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found; refusing to wipe", state.display()),
            )
            .into());
        }
        fs::copy(&state, &backup)?;
        tracing::info!("  Saved {} to {}", SIGNING_STATE_FILE, backup.display());
        Ok(backup)
    }

    fn wipe(&self) -> Result<()> {
        for dir in [self.cfg.consensus_data_dir(), self.cfg.execution_data_dir()] {
            if dir.exists() {
                tracing::info!("  Removing {}", dir.display());
                fs::remove_dir_all(&dir)?;
            }
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    async fn download(&self, source: &MirrorSource) -> Result<()> {
        self.fetcher
            .fetch_into(&source.consensus_url, &self.cfg.consensus_data_dir())
            .await?;
        self.fetcher
            .fetch_into(&source.execution_url, &self.cfg.execution_data_dir())
            .await
    }

    fn restore_signing_state(&self, backup: &Path) -> Result<()> {
        if !backup.is_file() {
            return Err(NodeError::SigningStateMissing {
                path: backup.to_path_buf(),
            });
        }
        let state = signing_state_path(self.cfg);
        if let Some(parent) = state.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(backup, &state)?;
        tracing::info!("  Restored {}", state.display());
        Ok(())
    }

    /// Start in order. If any start fails, units already started are
    /// stopped again so nothing runs against a half-restored node.
    async fn start_all(&self, units: &[String]) -> Result<()> {
        for (i, unit) in units.iter().enumerate() {
            tracing::info!("  Starting {}", unit);
            if let Err(e) = self.manager.start(unit).await {
                for started in &units[..i] {
                    if let Err(stop_err) = self.manager.stop(started).await {
                        tracing::error!("  Failed to stop {} after aborted start: {}", started, stop_err);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

fn check_source(source: &MirrorSource) -> Result<()> {
    for (what, url) in [
        ("consensus", &source.consensus_url),
        ("execution", &source.execution_url),
    ] {
        if url.is_empty() {
            return Err(NodeError::Config(format!(
                "mirror {} has no {} archive URL configured",
                source.name, what
            )));
        }
    }
    Ok(())
}

async fn step<T>(step: SnapshotStep, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    fut.await.map_err(|e| {
        tracing::error!("  [snapshot] failed while {}: {}", step, e);
        NodeError::Snapshot {
            step,
            source: Box::new(e),
        }
    })
}

/// Parse the operator's mirror choice, then run the whole restore. An
/// invalid choice fails before any service is touched.
pub async fn restore_snapshot<M: ServiceManager, F: ArchiveFetcher>(
    cfg: &NodeConfig,
    manager: &M,
    fetcher: &F,
    choice: &str,
) -> Result<()> {
    let mirror = Mirror::parse(choice)?;
    SnapshotInstaller::new(cfg, manager, fetcher).run(mirror).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn mirror_choice_is_closed() {
        assert_eq!(Mirror::parse("1").unwrap(), Mirror::First);
        assert_eq!(Mirror::parse(" 2\n").unwrap(), Mirror::Second);
        for bad in ["3", "", "one", "12"] {
            assert!(matches!(Mirror::parse(bad), Err(NodeError::InvalidMirror(_))));
        }
    }

    #[test]
    fn backup_lives_outside_wiped_dirs() {
        let cfg = NodeConfig::from_lookup(Path::new("/home/val"), |_| None);
        let backup = signing_state_backup_path(&cfg);
        assert!(!backup.starts_with(cfg.consensus_data_dir()));
        assert!(!backup.starts_with(cfg.execution_data_dir()));
    }

    #[test]
    fn unpacks_zstd_tarball() {
        let mut builder = tar::Builder::new(Vec::new());
        let body = b"{\"height\":\"0\"}";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder
            .append_data(&mut header, "application.db/CURRENT", &body[..])
            .unwrap();
        let tarball = builder.into_inner().unwrap();
        let compressed = zstd::encode_all(Cursor::new(tarball), 3).unwrap();

        let dir = tempfile::tempdir().unwrap();
        unpack_zstd_tar(Cursor::new(compressed), dir.path()).unwrap();
        let unpacked = fs::read(dir.path().join("application.db/CURRENT")).unwrap();
        assert_eq!(unpacked, body);
    }

    #[test]
    fn garbage_archive_is_a_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = unpack_zstd_tar(Cursor::new(b"not zstd".to_vec()), dir.path()).unwrap_err();
        assert!(matches!(err, NodeError::Setup { .. }));
    }
}
