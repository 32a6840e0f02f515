//! Script fetch, staging and execution
//!
//! Scripts arrive either embedded in metadata attributes or as URLs.
//! URL sources are matched against the known object-store forms and
//! downloaded with retry (startup scripts often run before networking
//! is fully up, so object-store fetches first wait for DNS). Everything
//! is staged into a fresh temp directory, executed with stdout+stderr
//! streamed to the log line by line, and cleaned up on return.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Object-store host scripts are served from.
pub const STORAGE_HOST: &str = "storage.googleapis.com";

/// Exit code reported when a script exceeds its timeout, matching the
/// GNU `timeout` convention.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const DOWNLOAD_ATTEMPTS: u32 = 3;
const DOWNLOAD_RETRY_DELAY: Duration = Duration::from_secs(1);
const DNS_ATTEMPTS: u32 = 20;
const DNS_RETRY_DELAY: Duration = Duration::from_secs(5);

const BUCKET: &str = "([a-z0-9][-_.a-z0-9]*)";
const OBJECT: &str = "(.+)";

// The accepted object-store URL spellings, in match order. Customers
// should use the gs:// form; the HTTP forms are kept for compatibility.
static STORAGE_URL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(&format!("^gs://{BUCKET}/{OBJECT}$")).unwrap(),
        Regex::new(&format!(
            r"^http[s]?://{BUCKET}\.storage\.googleapis\.com/{OBJECT}$"
        ))
        .unwrap(),
        Regex::new(&format!(
            r"^http[s]?://storage\.cloud\.google\.com/{BUCKET}/{OBJECT}$"
        ))
        .unwrap(),
        Regex::new(&format!(
            r"^http[s]?://(?:commondata)?storage\.googleapis\.com/{BUCKET}/{OBJECT}$"
        ))
        .unwrap(),
    ]
});

/// Splits an object-store URL into (bucket, object), or None when the
/// path is not an object-store reference.
pub fn parse_storage_url(path: &str) -> Option<(String, String)> {
    for re in STORAGE_URL_PATTERNS.iter() {
        if let Some(caps) = re.captures(path) {
            return Some((caps[1].to_string(), caps[2].to_string()));
        }
    }
    None
}

/// How a staged script gets executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    Ps1,
    Cmd,
    Bat,
}

impl ScriptType {
    /// Maps a key or URL suffix to an interpreter.
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "ps1" => Some(Self::Ps1),
            "cmd" => Some(Self::Cmd),
            "bat" => Some(Self::Bat),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Ps1 => "ps1",
            Self::Cmd => "cmd",
            Self::Bat => "bat",
        }
    }

    /// The command line for a staged file of this type.
    pub fn command(&self, path: &Path) -> Command {
        match self {
            Self::Ps1 => {
                let mut cmd = Command::new("powershell.exe");
                cmd.args([
                    "-NoProfile",
                    "-NoLogo",
                    "-ExecutionPolicy",
                    "Unrestricted",
                    "-File",
                ])
                .arg(path);
                cmd
            }
            Self::Cmd | Self::Bat => Command::new(path),
        }
    }
}

/// Writes an embedded script body into the staging directory under
/// `<name>.<ext>` and returns the staged path.
pub fn stage(dir: &Path, name: &str, ext: &str, contents: &str) -> Result<PathBuf> {
    let path = dir.join(format!("{name}.{ext}"));
    std::fs::write(&path, contents)
        .with_context(|| format!("staging script to {}", path.display()))?;
    Ok(path)
}

async fn stream_lines<R>(reader: R, label: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!("{label}: {line}");
    }
}

/// Runs a prepared command, forwarding every output line to the log
/// prefixed with `label`. Returns the exit code; with a timeout set, an
/// overrun returns [`TIMEOUT_EXIT_CODE`] and the wait is abandoned (the
/// child is not force-killed).
pub async fn run_command(
    mut cmd: Command,
    label: &str,
    timeout: Option<Duration>,
) -> Result<i32> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().with_context(|| format!("starting {label}"))?;

    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        readers.push(tokio::spawn(stream_lines(out, label.to_string())));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(tokio::spawn(stream_lines(err, label.to_string())));
    }

    let status = match timeout {
        None => child.wait().await.with_context(|| format!("waiting on {label}"))?,
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status.with_context(|| format!("waiting on {label}"))?,
            Err(_) => {
                warn!("{label}: timed out after {}s", limit.as_secs());
                return Ok(TIMEOUT_EXIT_CODE);
            }
        },
    };
    for reader in readers {
        let _ = reader.await;
    }
    Ok(status.code().unwrap_or(-1))
}

async fn try_get(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()
        .with_context(|| format!("GET {url}"))?;
    let body = resp.bytes().await.context("reading download body")?;
    tokio::fs::write(dest, &body)
        .await
        .with_context(|| format!("writing {}", dest.display()))?;
    Ok(())
}

async fn download_with_retry(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    let mut last = None;
    for attempt in 1..=DOWNLOAD_ATTEMPTS {
        match try_get(client, url, dest).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                debug!("download attempt {attempt} of {url} failed: {err:#}");
                last = Some(err);
                if attempt < DOWNLOAD_ATTEMPTS {
                    tokio::time::sleep(DOWNLOAD_RETRY_DELAY).await;
                }
            }
        }
    }
    Err(last.expect("at least one attempt"))
}

/// Blocks until the object-store host resolves. Startup scripts run
/// early in boot, before the resolver is necessarily usable.
pub async fn wait_for_dns(host: &str) -> Result<()> {
    for attempt in 1..=DNS_ATTEMPTS {
        match tokio::net::lookup_host((host, 443)).await {
            Ok(mut addrs) => {
                if addrs.next().is_some() {
                    return Ok(());
                }
                debug!("dns lookup of {host} returned no addresses");
            }
            Err(err) => debug!("dns lookup of {host} failed: {err}"),
        }
        if attempt < DNS_ATTEMPTS {
            tokio::time::sleep(DNS_RETRY_DELAY).await;
        }
    }
    bail!("{host} did not resolve after {DNS_ATTEMPTS} attempts")
}

/// Fetches a script source to `dest`. Object-store URLs wait for DNS,
/// then try the bucket endpoint with retry and fall back to the
/// unauthenticated path-style URL; other http(s) URLs are fetched
/// directly with the same retry; anything else is treated as a local
/// file path.
pub async fn fetch_to(source: &str, dest: &Path) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("building download client")?;

    if let Some((bucket, object)) = parse_storage_url(source) {
        wait_for_dns(STORAGE_HOST).await?;
        let primary = format!("https://{bucket}.{STORAGE_HOST}/{object}");
        if let Err(err) = download_with_retry(&client, &primary, dest).await {
            info!("object-store download failed ({err:#}), trying unauthenticated fallback");
            let fallback = format!("https://{STORAGE_HOST}/{bucket}/{object}");
            return download_with_retry(&client, &fallback, dest).await;
        }
        return Ok(());
    }

    if source.starts_with("http://") || source.starts_with("https://") {
        return download_with_retry(&client, source, dest).await;
    }

    tokio::fs::copy(source, dest)
        .await
        .with_context(|| format!("copying local script {source}"))?;
    Ok(())
}

/// Fetches a hook script, stages it executable in a fresh temp
/// directory, and runs it directly with the optional argument under the
/// given timeout. The staging directory is removed on return.
pub async fn fetch_and_run(
    source: &str,
    label: &str,
    arg: Option<&str>,
    timeout: Duration,
) -> Result<i32> {
    let dir = tempfile::tempdir().context("creating staging directory")?;
    let staged = dir.path().join("hook-script");
    fetch_to(source, &staged).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o700))
            .context("marking staged script executable")?;
    }

    let mut cmd = Command::new(&staged);
    if let Some(arg) = arg {
        cmd.arg(arg);
    }
    run_command(cmd, label, Some(timeout)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_url_forms() {
        assert_eq!(
            parse_storage_url("gs://b/s.ps1"),
            Some(("b".to_string(), "s.ps1".to_string()))
        );
        assert_eq!(
            parse_storage_url("https://my-bucket.storage.googleapis.com/path/to/obj"),
            Some(("my-bucket".to_string(), "path/to/obj".to_string()))
        );
        assert_eq!(
            parse_storage_url("http://storage.cloud.google.com/b2/o2"),
            Some(("b2".to_string(), "o2".to_string()))
        );
        assert_eq!(
            parse_storage_url("https://storage.googleapis.com/b3/o3"),
            Some(("b3".to_string(), "o3".to_string()))
        );
        assert_eq!(
            parse_storage_url("https://commondatastorage.googleapis.com/b4/o4"),
            Some(("b4".to_string(), "o4".to_string()))
        );
    }

    #[test]
    fn test_non_storage_urls_do_not_match() {
        assert_eq!(parse_storage_url("https://example.com/script.sh"), None);
        assert_eq!(parse_storage_url("gs://UPPER/obj"), None);
        assert_eq!(parse_storage_url("gs://bucket-only"), None);
        assert_eq!(parse_storage_url("/usr/local/bin/script"), None);
    }

    #[test]
    fn test_script_type_from_suffix() {
        assert_eq!(ScriptType::from_suffix("ps1"), Some(ScriptType::Ps1));
        assert_eq!(ScriptType::from_suffix("cmd"), Some(ScriptType::Cmd));
        assert_eq!(ScriptType::from_suffix("bat"), Some(ScriptType::Bat));
        assert_eq!(ScriptType::from_suffix("sh"), None);
        assert_eq!(ScriptType::from_suffix(""), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_reports_exit_code() {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "exit 3"]);
        let rc = run_command(cmd, "exit-test", None).await.unwrap();
        assert_eq!(rc, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_timeout_returns_124() {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "sleep 5"]);
        let rc = run_command(cmd, "timeout-test", Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(rc, TIMEOUT_EXIT_CODE);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fetch_and_run_local_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hook.sh");
        std::fs::write(&script, "#!/bin/sh\necho ran with \"$1\"\nexit 0\n").unwrap();

        let rc = fetch_and_run(
            script.to_str().unwrap(),
            "local-hook",
            Some("disk-1"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(rc, 0);
    }

    #[test]
    fn test_stage_writes_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = stage(dir.path(), "windows-startup-script", "ps1", "Write-Host hi").unwrap();
        assert!(path.ends_with("windows-startup-script.ps1"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Write-Host hi");
    }
}
