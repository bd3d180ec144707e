use crate::{config::NodeConfig, signals, NodeError, Result};

pub fn journal_args(units: &[&str]) -> Vec<String> {
    let mut args: Vec<String> = units
        .iter()
        .flat_map(|u| ["-u".to_string(), u.to_string()])
        .collect();
    args.extend(["-f", "-o", "cat"].map(String::from));
    args
}

/// Follow both services' journals until the operator presses Ctrl-C (or
/// journalctl exits on its own). Ctrl-C returns to the caller instead of
/// ending the process; this relies on [`signals::spawn_watcher`] running.
pub async fn follow_logs(cfg: &NodeConfig) -> Result<()> {
    let units = [cfg.execution_service.as_str(), cfg.consensus_service.as_str()];
    tracing::info!("  Following {} logs; press Ctrl-C to return to the menu.", units.join(" + "));

    let capture = signals::capture();
    let mut child = tokio::process::Command::new("journalctl")
        .args(journal_args(&units))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| NodeError::Command {
            program: "journalctl".into(),
            status: "spawn failure".into(),
            stderr: e.to_string(),
        })?;

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if !status.success() {
                tracing::warn!("  journalctl exited with {}", status);
            }
        }
        _ = capture.interrupted() => {
            child.kill().await.ok();
            tracing::info!("");
        }
    }
    Ok(())
}
