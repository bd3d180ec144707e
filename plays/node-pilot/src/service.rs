//! systemd integration for the execution and consensus clients.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::{
    config::{NodeConfig, PortLayout},
    runner::{CommandRunner, CommandSpec},
    NodeError, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Restart {
    OnFailure,
    Always,
}

impl Restart {
    /// `always` or `on-failure`; anything else falls back to `on-failure`.
    pub fn parse(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "always" => Restart::Always,
            "on-failure" | "" => Restart::OnFailure,
            other => {
                tracing::warn!("  Unknown restart policy {:?}; using on-failure", other);
                Restart::OnFailure
            }
        }
    }
}

impl fmt::Display for Restart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Restart::OnFailure => f.write_str("on-failure"),
            Restart::Always => f.write_str("always"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    pub policy: Restart,
    pub delay_secs: u64,
    pub nofile: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub description: String,
    pub after: Vec<String>,
    pub user: String,
    pub exec_start: Vec<String>,
    pub working_dir: PathBuf,
    pub restart: RestartPolicy,
    pub wanted_by: String,
}

impl ServiceDescriptor {
    pub fn unit_file_name(&self) -> String {
        format!("{}.service", self.name)
    }

    pub fn render_unit(&self) -> String {
        let exec = self
            .exec_start
            .iter()
            .map(|arg| quote_arg(arg))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "[Unit]\n\
             Description={description}\n\
             After={after}\n\
             Wants=network-online.target\n\
             \n\
             [Service]\n\
             User={user}\n\
             WorkingDirectory={workdir}\n\
             ExecStart={exec}\n\
             Restart={restart}\n\
             RestartSec={delay}\n\
             LimitNOFILE={nofile}\n\
             \n\
             [Install]\n\
             WantedBy={wanted_by}\n",
            description = self.description,
            after = self.after.join(" "),
            user = self.user,
            workdir = self.working_dir.display(),
            restart = self.restart.policy,
            delay = self.restart.delay_secs,
            nofile = self.restart.nofile,
            wanted_by = self.wanted_by,
        )
    }
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"') {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

fn restart_policy(cfg: &NodeConfig) -> RestartPolicy {
    RestartPolicy {
        policy: cfg.restart,
        delay_secs: cfg.restart_sec,
        nofile: cfg.nofile,
    }
}

pub fn execution_service(cfg: &NodeConfig, ports: &PortLayout) -> ServiceDescriptor {
    let mut exec_start = vec![
        cfg.execution_bin_path().display().to_string(),
        "--datadir".into(),
        cfg.execution_home.display().to_string(),
        "--http".into(),
        "--http.addr".into(),
        "127.0.0.1".into(),
        "--http.port".into(),
        ports.exec_http.to_string(),
        "--ws".into(),
        "--ws.port".into(),
        ports.exec_ws.to_string(),
        "--authrpc.port".into(),
        ports.exec_authrpc.to_string(),
        "--port".into(),
        ports.exec_p2p.to_string(),
        "--metrics".into(),
        "--metrics.port".into(),
        ports.exec_metrics.to_string(),
    ];
    exec_start.extend(cfg.execution_extra_args.iter().cloned());

    ServiceDescriptor {
        name: cfg.execution_service.clone(),
        description: format!("{} execution client", cfg.execution_bin),
        after: vec!["network-online.target".into()],
        user: cfg.service_user.clone(),
        exec_start,
        working_dir: cfg.execution_home.clone(),
        restart: restart_policy(cfg),
        wanted_by: "multi-user.target".into(),
    }
}

pub fn consensus_service(cfg: &NodeConfig) -> ServiceDescriptor {
    ServiceDescriptor {
        name: cfg.consensus_service.clone(),
        description: format!("{} consensus client", cfg.consensus_bin),
        after: vec![
            "network-online.target".into(),
            format!("{}.service", cfg.execution_service),
        ],
        user: cfg.service_user.clone(),
        exec_start: vec![
            cfg.consensus_bin_path().display().to_string(),
            "start".into(),
            "--home".into(),
            cfg.consensus_home.display().to_string(),
        ],
        working_dir: cfg.consensus_home.clone(),
        restart: restart_policy(cfg),
        wanted_by: "multi-user.target".into(),
    }
}

// ── Service manager ──

#[allow(async_fn_in_trait)]
pub trait ServiceManager {
    async fn daemon_reload(&self) -> Result<()>;
    async fn enable(&self, unit: &str) -> Result<()>;
    async fn start(&self, unit: &str) -> Result<()>;
    async fn stop(&self, unit: &str) -> Result<()>;
    async fn restart(&self, unit: &str) -> Result<()>;
    async fn is_active(&self, unit: &str) -> Result<bool>;
}

/// `systemctl` driven through a [`CommandRunner`].
#[derive(Clone, Debug, Default)]
pub struct Systemd<R> {
    runner: R,
}

impl<R: CommandRunner> Systemd<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    async fn systemctl(&self, action: &str, unit: Option<&str>) -> Result<()> {
        let mut args = vec![action.to_string()];
        args.extend(unit.map(String::from));
        self.runner
            .run(&CommandSpec::new("systemctl", args))
            .await
            .map(|_| ())
            .map_err(|e| NodeError::service(action, unit.unwrap_or("systemd"), e))
    }
}

impl<R: CommandRunner> ServiceManager for Systemd<R> {
    async fn daemon_reload(&self) -> Result<()> {
        self.systemctl("daemon-reload", None).await
    }

    async fn enable(&self, unit: &str) -> Result<()> {
        self.systemctl("enable", Some(unit)).await
    }

    async fn start(&self, unit: &str) -> Result<()> {
        self.systemctl("start", Some(unit)).await
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        self.systemctl("stop", Some(unit)).await
    }

    async fn restart(&self, unit: &str) -> Result<()> {
        self.systemctl("restart", Some(unit)).await
    }

    async fn is_active(&self, unit: &str) -> Result<bool> {
        // `is-active` exits non-zero for inactive units; that is an answer, not a failure
        match self
            .runner
            .run(&CommandSpec::new("systemctl", ["is-active", "--quiet", unit]))
            .await
        {
            Ok(_) => Ok(true),
            Err(NodeError::Command { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Write the unit file (replacing any previous definition of the same
/// name), reload systemd, enable and (re)start the service.
pub async fn register<M: ServiceManager>(
    manager: &M,
    unit_dir: &Path,
    descriptor: &ServiceDescriptor,
) -> Result<PathBuf> {
    let path = unit_dir.join(descriptor.unit_file_name());
    fs::create_dir_all(unit_dir)?;
    fs::write(&path, descriptor.render_unit())?;
    tracing::info!("  Wrote {}", path.display());

    manager.daemon_reload().await?;
    manager.enable(&descriptor.name).await?;
    manager.restart(&descriptor.name).await?;
    tracing::info!("  Service {} enabled and started", descriptor.name);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CommandOutput;
    use std::sync::Mutex;

    fn cfg() -> NodeConfig {
        NodeConfig::from_lookup(Path::new("/home/val"), |k| match k {
            "NODEPILOT_EXECUTION_ARGS" => Some("--mainnet --syncmode full".into()),
            _ => None,
        })
    }

    #[test]
    fn execution_unit_carries_shifted_ports_and_policy() {
        let ports = PortLayout::default().shifted(10).unwrap();
        let unit = execution_service(&cfg(), &ports).render_unit();
        assert!(unit.contains("ExecStart=/usr/local/bin/geth --datadir /home/val/.execution"));
        assert!(unit.contains("--http.port 8555"));
        assert!(unit.contains("--port 30313"));
        assert!(unit.contains("--mainnet --syncmode full\n"));
        assert!(unit.contains("Restart=on-failure\n"));
        assert!(unit.contains("RestartSec=3\n"));
        assert!(unit.contains("LimitNOFILE=65535\n"));
        assert!(unit.contains("WantedBy=multi-user.target\n"));
    }

    #[test]
    fn consensus_unit_starts_after_execution() {
        let unit = consensus_service(&cfg()).render_unit();
        assert!(unit.contains("After=network-online.target geth.service\n"));
        assert!(unit.contains("ExecStart=/usr/local/bin/consensusd start --home /home/val/.consensus\n"));
        assert!(unit.contains("User=root\n"));
    }

    #[test]
    fn restart_policy_is_configurable() {
        assert_eq!(Restart::parse("always"), Restart::Always);
        assert_eq!(Restart::parse(" On-Failure "), Restart::OnFailure);
        assert_eq!(Restart::parse("sometimes"), Restart::OnFailure);

        let cfg = NodeConfig::from_lookup(Path::new("/home/val"), |k| match k {
            "NODEPILOT_RESTART" => Some("always".into()),
            _ => None,
        });
        let unit = consensus_service(&cfg).render_unit();
        assert!(unit.contains("Restart=always\n"));
    }

    #[test]
    fn args_with_spaces_are_quoted() {
        assert_eq!(quote_arg("plain"), "plain");
        assert_eq!(quote_arg("two words"), "\"two words\"");
        assert_eq!(quote_arg(""), "\"\"");
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl CommandRunner for Recorder {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            let line = spec.display();
            self.calls.lock().unwrap().push(line.clone());
            if self.fail_on.is_some_and(|f| line.contains(f)) {
                return Err(NodeError::Command {
                    program: line,
                    status: "exit status: 1".into(),
                    stderr: "Unit not found".into(),
                });
            }
            Ok(CommandOutput::default())
        }
    }

    #[tokio::test]
    async fn systemd_issues_expected_commands() {
        let systemd = Systemd::new(Recorder::default());
        let dir = tempfile::tempdir().unwrap();
        register(&systemd, dir.path(), &consensus_service(&cfg()))
            .await
            .unwrap();
        assert_eq!(
            *systemd.runner.calls.lock().unwrap(),
            vec![
                "systemctl daemon-reload",
                "systemctl enable consensusd",
                "systemctl restart consensusd"
            ]
        );
    }

    #[tokio::test]
    async fn enable_failure_is_surfaced() {
        let systemd = Systemd::new(Recorder {
            fail_on: Some("enable"),
            ..Default::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let err = register(&systemd, dir.path(), &consensus_service(&cfg()))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Service { ref action, .. } if action == "enable"));
        // nothing is started after a failed enable
        assert!(!systemd
            .runner
            .calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.contains("restart")));
    }

    #[tokio::test]
    async fn inactive_unit_is_not_an_error() {
        let systemd = Systemd::new(Recorder {
            fail_on: Some("is-active"),
            ..Default::default()
        });
        assert!(!systemd.is_active("geth").await.unwrap());
    }
}
