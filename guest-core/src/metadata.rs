//! Metadata service client
//!
//! Long-polls the hanging metadata endpoint and delivers a full snapshot
//! whenever the server-side ETag changes. The watcher owns the ETag; the
//! first request uses the "NONE" sentinel so it returns immediately.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use tokio::sync::watch;
use tracing::debug;

/// Root of the metadata service seen from inside the instance.
pub const METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1";

const HANG_QUERY: &str = "/?recursive=true&alt=json&wait_for_change=true&timeout_sec=60&last_etag=";
const DEFAULT_ETAG: &str = "NONE";

// The server hangs for up to 60s; give the client a little headroom.
const WATCH_TIMEOUT: Duration = Duration::from_secs(70);
const ATTRIBUTES_TIMEOUT: Duration = Duration::from_secs(20);

/// One immutable metadata snapshot: the instance and project trees as
/// they were at a single ETag.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Snapshot {
    pub instance: InstanceMeta,
    pub project: ProjectMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstanceMeta {
    pub attributes: Attributes,
    pub network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectMeta {
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkInterface {
    pub mac: String,
    pub forwarded_ips: Vec<String>,
}

/// Recognized attribute keys. Every enable/disable flag is three-valued
/// (absent / true / false) so instance values only override project
/// values when actually set; some arrive as JSON booleans and some as
/// quoted strings, so all of them decode through [`mixed_bool`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Attributes {
    #[serde(rename = "windows-keys")]
    pub windows_keys: Option<String>,
    #[serde(rename = "ssh-keys")]
    pub ssh_keys: Option<String>,
    /// Legacy spelling, still honored and merged with `ssh-keys`.
    #[serde(rename = "sshKeys")]
    pub ssh_keys_legacy: Option<String>,
    #[serde(rename = "block-project-ssh-keys", deserialize_with = "mixed_bool")]
    pub block_project_ssh_keys: Option<bool>,
    #[serde(rename = "disable-account-manager", deserialize_with = "mixed_bool")]
    pub disable_account_manager: Option<bool>,
    #[serde(rename = "disable-address-manager", deserialize_with = "mixed_bool")]
    pub disable_address_manager: Option<bool>,
    #[serde(rename = "enable-wsfc", deserialize_with = "mixed_bool")]
    pub enable_wsfc: Option<bool>,
    #[serde(rename = "wsfc-addrs")]
    pub wsfc_addrs: Option<String>,
    #[serde(rename = "wsfc-agent-port")]
    pub wsfc_agent_port: Option<String>,
    #[serde(rename = "enable-diagnostics", deserialize_with = "mixed_bool")]
    pub enable_diagnostics: Option<bool>,
    pub diagnostics: Option<String>,
    #[serde(rename = "snapshot-enabled", deserialize_with = "mixed_bool")]
    pub snapshot_enabled: Option<bool>,
    #[serde(rename = "snapshot-timeout", deserialize_with = "mixed_u64")]
    pub snapshot_timeout: Option<u64>,
    #[serde(rename = "snapshot-continue-on-error", deserialize_with = "mixed_bool")]
    pub snapshot_continue_on_error: Option<bool>,
    #[serde(rename = "snapshot-pre-script-url")]
    pub snapshot_pre_script_url: Option<String>,
    #[serde(rename = "snapshot-post-script-url")]
    pub snapshot_post_script_url: Option<String>,
}

impl Attributes {
    /// All `user:key` lines from this attribute set, merging the current
    /// and legacy key names. Blank lines are dropped.
    pub fn ssh_key_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for blob in [&self.ssh_keys, &self.ssh_keys_legacy].into_iter().flatten() {
            for line in blob.lines() {
                let line = line.trim();
                if !line.is_empty() {
                    lines.push(line.to_string());
                }
            }
        }
        lines
    }
}

/// Accepts `true`, `"true"`, `"false"`, `"1"`, `"0"` and friends; any
/// value that does not parse as a boolean counts as "not set" so a
/// malformed flag defers to the next precedence layer.
fn mixed_bool<'de, D>(de: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Str(String),
        Num(i64),
    }

    Ok(match Option::<Raw>::deserialize(de)? {
        None => None,
        Some(Raw::Bool(b)) => Some(b),
        Some(Raw::Num(n)) => Some(n != 0),
        Some(Raw::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
    })
}

fn mixed_u64<'de, D>(de: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }

    Ok(match Option::<Raw>::deserialize(de)? {
        None => None,
        Some(Raw::Num(n)) => Some(n),
        Some(Raw::Str(s)) => s.trim().parse().ok(),
    })
}

/// Long-poll client for the hanging metadata endpoint.
pub struct MetadataWatcher {
    client: reqwest::Client,
    base_url: String,
    etag: String,
}

impl MetadataWatcher {
    pub fn new() -> Self {
        Self::with_base_url(METADATA_URL)
    }

    /// Point the watcher somewhere else (tests run against a local server).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WATCH_TIMEOUT)
            .build()
            .expect("default reqwest client");
        Self {
            client,
            base_url: base_url.into(),
            etag: DEFAULT_ETAG.to_string(),
        }
    }

    /// Blocks until the metadata tree changes and returns the new
    /// snapshot. An unchanged ETag (the server returned early) restarts
    /// the request without delivering anything. Returns `Ok(None)` when
    /// the shutdown signal fires mid-request; transport and parse
    /// failures surface as errors for the caller to back off on.
    pub async fn watch(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<Option<Snapshot>> {
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }

            let url = format!("{}{}{}", self.base_url, HANG_QUERY, self.etag);
            let request = self
                .client
                .get(&url)
                .header("Metadata-Flavor", "Google")
                .send();

            let resp = tokio::select! {
                _ = shutdown.changed() => return Ok(None),
                resp = request => resp.context("metadata service request failed")?,
            };
            let resp = resp
                .error_for_status()
                .context("metadata service returned an error status")?;

            let new_etag = resp
                .headers()
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .unwrap_or(DEFAULT_ETAG)
                .to_string();
            let changed = new_etag != self.etag;
            self.etag = new_etag;
            if !changed {
                // Early return with nothing new; hang again.
                debug!("metadata etag unchanged, restarting watch");
                continue;
            }

            let body = resp
                .text()
                .await
                .context("reading metadata response body")?;
            let snapshot =
                serde_json::from_str(&body).context("parsing metadata response body")?;
            return Ok(Some(snapshot));
        }
    }
}

impl Default for MetadataWatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot fetch of an attributes directory (`instance` or `project`)
/// as a flat string map. Used by the metadata-script runner, which does
/// not long-poll.
pub async fn fetch_attributes(base_url: &str, tree: &str) -> Result<HashMap<String, String>> {
    let client = reqwest::Client::builder()
        .timeout(ATTRIBUTES_TIMEOUT)
        .build()
        .context("building metadata client")?;
    let url = format!(
        "{}/{}/attributes/?recursive=true&alt=json&timeout_sec=10&last_etag=NONE",
        base_url, tree
    );
    let attributes = client
        .get(&url)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .context("requesting attributes")?
        .error_for_status()
        .context("attributes request returned an error status")?
        .json()
        .await
        .context("parsing attributes")?;
    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_parses_recursive_json() {
        let body = r#"{
            "instance": {
                "attributes": {
                    "enable-wsfc": "true",
                    "disable-address-manager": false,
                    "wsfc-agent-port": "59999",
                    "windows-keys": "{\"userName\":\"alice\"}"
                },
                "networkInterfaces": [
                    {"mac": "42:01:0a:00:00:02", "forwardedIps": ["10.0.0.5"]}
                ]
            },
            "project": {
                "attributes": {"ssh-keys": "bob:ssh-rsa AAAA bob"}
            }
        }"#;
        let snap: Snapshot = serde_json::from_str(body).unwrap();
        assert_eq!(snap.instance.attributes.enable_wsfc, Some(true));
        assert_eq!(snap.instance.attributes.disable_address_manager, Some(false));
        assert_eq!(snap.instance.attributes.wsfc_agent_port.as_deref(), Some("59999"));
        assert_eq!(snap.instance.network_interfaces.len(), 1);
        assert_eq!(snap.instance.network_interfaces[0].forwarded_ips, ["10.0.0.5"]);
        assert_eq!(
            snap.project.attributes.ssh_key_lines(),
            vec!["bob:ssh-rsa AAAA bob".to_string()]
        );
    }

    #[test]
    fn test_empty_metadata_is_default() {
        let snap: Snapshot = serde_json::from_str("{}").unwrap();
        assert_eq!(snap, Snapshot::default());
        assert!(snap.instance.attributes.ssh_key_lines().is_empty());
    }

    #[test]
    fn test_malformed_flag_defers() {
        let body = r#"{"instance": {"attributes": {"enable-wsfc": "yes please"}}}"#;
        let snap: Snapshot = serde_json::from_str(body).unwrap();
        assert_eq!(snap.instance.attributes.enable_wsfc, None);
    }

    /// Answers exactly one request on the listener with a canned
    /// response, closing the connection so the client reconnects.
    fn serve_once(listener: &std::net::TcpListener, etag: &str, body: &str) {
        use std::io::{Read, Write};

        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 2048];
        let _ = stream.read(&mut buf);
        let resp = format!(
            "HTTP/1.1 200 OK\r\nETag: {etag}\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(resp.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_watch_delivers_only_on_etag_change() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            serve_once(
                &listener,
                "A",
                r#"{"instance":{"attributes":{"enable-wsfc":true}}}"#,
            );
            // Same ETag: the server returned early with no change, so
            // the watcher must re-request instead of delivering.
            serve_once(&listener, "A", "{}");
            serve_once(
                &listener,
                "B",
                r#"{"project":{"attributes":{"ssh-keys":"a:k"}}}"#,
            );
        });

        let (_tx, mut shutdown) = watch::channel(false);
        let mut watcher = MetadataWatcher::with_base_url(format!("http://{addr}"));

        let first = watcher.watch(&mut shutdown).await.unwrap().unwrap();
        assert_eq!(first.instance.attributes.enable_wsfc, Some(true));

        let second = watcher.watch(&mut shutdown).await.unwrap().unwrap();
        assert_eq!(
            second.project.attributes.ssh_key_lines(),
            vec!["a:k".to_string()]
        );
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_watch_returns_clean_when_already_shut_down() {
        let (tx, mut shutdown) = watch::channel(false);
        tx.send(true).unwrap();
        let mut watcher = MetadataWatcher::with_base_url("http://127.0.0.1:1");
        assert!(watcher.watch(&mut shutdown).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_cancels_mid_request() {
        // A listener that never answers: the request hangs until the
        // shutdown signal fires, which must not surface as an error.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, mut shutdown) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut watcher = MetadataWatcher::with_base_url(format!("http://{addr}"));
            watcher.watch(&mut shutdown).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = handle.await.unwrap().unwrap();
        assert!(result.is_none());
        drop(listener);
    }

    #[test]
    fn test_legacy_ssh_keys_merged() {
        let body = r#"{"instance": {"attributes": {
            "ssh-keys": "a:key-a\n\n",
            "sshKeys": "b:key-b"
        }}}"#;
        let snap: Snapshot = serde_json::from_str(body).unwrap();
        assert_eq!(
            snap.instance.attributes.ssh_key_lines(),
            vec!["a:key-a".to_string(), "b:key-b".to_string()]
        );
    }
}
