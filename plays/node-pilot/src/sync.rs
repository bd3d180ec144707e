//! Block height polling against a reference RPC.

use std::time::{Duration, SystemTime};

use crate::{patcher::read_value, NodeError, Result};

#[allow(async_fn_in_trait)]
pub trait HeightSource {
    async fn latest_height(&self) -> Result<u64>;
}

/// CometBFT-style `/status` endpoint.
#[derive(Clone, Debug)]
pub struct RpcStatusSource {
    client: reqwest::Client,
    status_url: String,
}

impl RpcStatusSource {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            status_url: format!("{}/status", base_url.trim_end_matches('/')),
        }
    }
}

impl HeightSource for RpcStatusSource {
    async fn latest_height(&self) -> Result<u64> {
        let body: serde_json::Value = self
            .client
            .get(&self.status_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .json()
            .await?;
        parse_status_height(&body)
    }
}

/// Extract `result.sync_info.latest_block_height`, sent as a numeric
/// string (some proxies send a bare number).
pub fn parse_status_height(body: &serde_json::Value) -> Result<u64> {
    let field = &body["result"]["sync_info"]["latest_block_height"];
    match field {
        serde_json::Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| NodeError::Height(format!("not a block height: {:?}", s))),
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| NodeError::Height(format!("not a block height: {}", n))),
        serde_json::Value::Null => Err(NodeError::Height(
            "missing result.sync_info.latest_block_height".into(),
        )),
        other => Err(NodeError::Height(format!("unexpected height value: {}", other))),
    }
}

/// Turn a listen address like `tcp://0.0.0.0:26657` into a URL the local
/// host can dial.
pub fn rpc_url_from_laddr(laddr: &str) -> String {
    let hostport = laddr
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(laddr);
    let hostport = match hostport.rsplit_once(':') {
        Some(("0.0.0.0", port)) | Some(("", port)) => format!("127.0.0.1:{}", port),
        _ => hostport.to_string(),
    };
    format!("http://{}", hostport)
}

/// Local RPC URL read from the consensus client's `[rpc] laddr`.
pub fn local_rpc_url(config_toml: &str) -> Option<String> {
    read_value(config_toml, Some("rpc"), "laddr").map(|l| rpc_url_from_laddr(&l))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncSample {
    pub local: u64,
    pub reference: u64,
    pub at: SystemTime,
}

impl SyncSample {
    /// Blocks still to catch up; zero once local has reached or passed the
    /// reference.
    pub fn remaining(&self) -> u64 {
        self.reference.saturating_sub(self.local)
    }

    pub fn is_synced(&self) -> bool {
        self.remaining() == 0
    }
}

pub struct SyncMonitor {
    interval: Duration,
}

impl SyncMonitor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    async fn sample<L: HeightSource, R: HeightSource>(local: &L, reference: &R) -> Result<SyncSample> {
        let local = local.latest_height().await?;
        let reference = reference.latest_height().await?;
        Ok(SyncSample {
            local,
            reference,
            at: SystemTime::now(),
        })
    }

    /// Poll until a sample shows nothing remaining. Failed samples are
    /// logged and retried on the same interval with no attempt cap; this
    /// loop is meant to be watched by an operator, who stops it with Ctrl-C.
    /// Transient failures (unreachable RPC, malformed height) log as
    /// warnings, anything else as an error.
    pub async fn run<L, R, F>(&self, local: &L, reference: &R, mut on_sample: F) -> SyncSample
    where
        L: HeightSource,
        R: HeightSource,
        F: FnMut(&SyncSample),
    {
        loop {
            match Self::sample(local, reference).await {
                Ok(sample) => {
                    on_sample(&sample);
                    if sample.is_synced() {
                        tracing::info!(
                            "  Synced: local {} / network {}",
                            sample.local,
                            sample.reference
                        );
                        return sample;
                    }
                    tracing::info!(
                        "  local {} / network {} ({} blocks remaining)",
                        sample.local,
                        sample.reference,
                        sample.remaining()
                    );
                }
                Err(e) if e.is_transient() => tracing::warn!("  Height sample failed, retrying: {}", e),
                Err(e) => tracing::error!("  Height sample failed ({}); retrying anyway", e),
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_string_and_number_heights() {
        let body = json!({"result": {"sync_info": {"latest_block_height": "12345"}}});
        assert_eq!(parse_status_height(&body).unwrap(), 12345);
        let body = json!({"result": {"sync_info": {"latest_block_height": 77}}});
        assert_eq!(parse_status_height(&body).unwrap(), 77);
    }

    #[test]
    fn malformed_heights_are_height_errors() {
        for body in [
            json!({}),
            json!({"result": {"sync_info": {}}}),
            json!({"result": {"sync_info": {"latest_block_height": "abc"}}}),
            json!({"result": {"sync_info": {"latest_block_height": "-4"}}}),
            json!({"result": {"sync_info": {"latest_block_height": true}}}),
        ] {
            let err = parse_status_height(&body).unwrap_err();
            assert!(err.is_transient(), "{body}");
        }
    }

    #[test]
    fn remaining_is_clamped_at_zero() {
        let ahead = SyncSample {
            local: 200,
            reference: 150,
            at: SystemTime::now(),
        };
        assert_eq!(ahead.remaining(), 0);
        assert!(ahead.is_synced());
    }

    #[test]
    fn laddr_becomes_dialable_url() {
        assert_eq!(rpc_url_from_laddr("tcp://127.0.0.1:26657"), "http://127.0.0.1:26657");
        assert_eq!(rpc_url_from_laddr("tcp://0.0.0.0:27657"), "http://127.0.0.1:27657");
        assert_eq!(rpc_url_from_laddr(":26657"), "http://127.0.0.1:26657");
    }

    #[test]
    fn local_rpc_url_reads_rpc_section() {
        let toml = "[p2p]\nladdr = \"tcp://0.0.0.0:26656\"\n[rpc]\nladdr = \"tcp://127.0.0.1:26757\"\n";
        assert_eq!(local_rpc_url(toml).unwrap(), "http://127.0.0.1:26757");
    }
}
