//! OS user adapters
//!
//! Account reconcilers never shell out directly; they go through the
//! traits here. The Windows side wraps `net user`/`net localgroup`, the
//! Linux side wraps the configurable `useradd` family plus passwd/group
//! database lookups.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// One parsed passwd database entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

/// Parses a single passwd line (`name:passwd:uid:gid:gecos:home:shell`).
/// Comments, blanks and malformed lines yield None.
pub fn parse_passwd_line(line: &str) -> Option<PasswdEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let parts: Vec<&str> = line.splitn(7, ':').collect();
    if parts.len() != 7 {
        return None;
    }
    Some(PasswdEntry {
        name: parts[0].to_string(),
        uid: parts[2].parse().ok()?,
        gid: parts[3].parse().ok()?,
        home: parts[5].to_string(),
        shell: parts[6].to_string(),
    })
}

/// Fills a command template like `useradd -m -s /bin/bash -p * {user}`,
/// substituting each `{placeholder}` from `subs`. Returns the argv.
pub fn fill_template(template: &str, subs: &[(&str, &str)]) -> Vec<String> {
    template
        .split_whitespace()
        .map(|word| {
            let mut word = word.to_string();
            for (key, value) in subs {
                word = word.replace(&format!("{{{key}}}"), value);
            }
            word
        })
        .collect()
}

async fn run_checked(argv: &[String]) -> Result<()> {
    if argv.is_empty() {
        bail!("empty command");
    }
    debug!("exec: {}", argv.join(" "));
    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .output()
        .await
        .with_context(|| format!("running {}", argv[0]))?;
    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            argv[0],
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Windows account operations used by the windows-key reconciler.
#[async_trait]
pub trait AccountOps: Send + Sync {
    async fn user_exists(&self, user: &str) -> bool;
    async fn create_admin_user(&self, user: &str, password: &str) -> Result<()>;
    async fn set_password(&self, user: &str, password: &str) -> Result<()>;
}

pub struct SystemAccounts;

#[async_trait]
impl AccountOps for SystemAccounts {
    async fn user_exists(&self, user: &str) -> bool {
        Command::new("net")
            .args(["user", user])
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    async fn create_admin_user(&self, user: &str, password: &str) -> Result<()> {
        run_checked(&[
            "net".to_string(),
            "user".to_string(),
            user.to_string(),
            password.to_string(),
            "/add".to_string(),
        ])
        .await?;
        run_checked(&[
            "net".to_string(),
            "localgroup".to_string(),
            "Administrators".to_string(),
            user.to_string(),
            "/add".to_string(),
        ])
        .await
    }

    async fn set_password(&self, user: &str, password: &str) -> Result<()> {
        run_checked(&[
            "net".to_string(),
            "user".to_string(),
            user.to_string(),
            password.to_string(),
        ])
        .await
    }
}

/// Linux user database operations used by the ssh-key reconciler.
#[async_trait]
pub trait UserOps: Send + Sync {
    fn lookup(&self, user: &str) -> Result<Option<PasswdEntry>>;
    fn group_exists(&self, group: &str) -> Result<bool>;
    /// Runs one already-substituted command line.
    async fn run(&self, argv: &[String]) -> Result<()>;
}

pub struct SystemUsers;

#[async_trait]
impl UserOps for SystemUsers {
    fn lookup(&self, user: &str) -> Result<Option<PasswdEntry>> {
        let passwd = std::fs::read_to_string("/etc/passwd").context("reading /etc/passwd")?;
        Ok(passwd
            .lines()
            .filter_map(parse_passwd_line)
            .find(|entry| entry.name == user))
    }

    fn group_exists(&self, group: &str) -> Result<bool> {
        let groups = std::fs::read_to_string("/etc/group").context("reading /etc/group")?;
        Ok(groups
            .lines()
            .filter_map(|line| line.split(':').next())
            .any(|name| name == group))
    }

    async fn run(&self, argv: &[String]) -> Result<()> {
        run_checked(argv).await
    }
}
