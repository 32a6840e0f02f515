//! Linux account reconciler
//!
//! Keeps local users in line with the ssh-keys metadata: creates
//! accounts for key owners, maintains the google-sudoers group and its
//! sudoers file, and rewrites the Google-managed section of each user's
//! authorized_keys. Users the agent created are tracked in the
//! google-users file and deprovisioned when their keys disappear.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guest_core::config::{resolve_flag, InstanceConfig};
use guest_core::dedup::DedupSet;
use guest_core::metadata::Snapshot;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{error, info};

use crate::manager::{log_transition, Manager};
use crate::users::{fill_template, PasswdEntry, SystemUsers, UserOps};

const GOOGLE_COMMENT: &str = "# Added by Google";
const GOOGLE_SSH_MARKER: &str = "google-ssh";
const SUDOERS_GROUP: &str = "google-sudoers";
const SUDOERS_CONTENT: &str = "%google-sudoers ALL=(ALL:ALL) NOPASSWD:ALL\n";
const EXPIRE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

const DEFAULT_USERS_FILE: &str = "/var/lib/guest-agent/google_users";
const DEFAULT_SUDOERS_FILE: &str = "/etc/sudoers.d/google_sudoers";

const DEFAULT_USERADD_CMD: &str = "useradd -m -s /bin/bash -p * {user}";
const DEFAULT_USERDEL_CMD: &str = "userdel -r {user}";
const DEFAULT_GROUPADD_CMD: &str = "groupadd {group}";
const DEFAULT_GPASSWD_ADD_CMD: &str = "gpasswd -a {user} {group}";
const DEFAULT_GPASSWD_REMOVE_CMD: &str = "gpasswd -d {user} {group}";

static LINUX_ACCOUNTS_DISABLED: AtomicBool = AtomicBool::new(false);
static BAD_SSH_KEYS: LazyLock<Mutex<DedupSet>> = LazyLock::new(|| Mutex::new(DedupSet::new()));

type KeyCache = Arc<Mutex<HashMap<String, Vec<String>>>>;

// What was last written per user, so unchanged files are not rewritten
// every tick. Lives for the process.
static WRITTEN_KEYS: LazyLock<KeyCache> = LazyLock::new(KeyCache::default);

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ExpiringKeyInfo {
    #[allow(dead_code)]
    user_name: String,
    expire_on: String,
}

/// Whether a key's material carries a `google-ssh` expiry suffix that
/// has passed. Keys without the marker never expire; an unparseable
/// suffix counts as expired and is logged once.
pub fn key_expired(material: &str) -> bool {
    let Some(idx) = material.find(GOOGLE_SSH_MARKER) else {
        return false;
    };
    let json = material[idx + GOOGLE_SSH_MARKER.len()..].trim();
    let info: ExpiringKeyInfo = match serde_json::from_str(json) {
        Ok(info) => info,
        Err(err) => {
            if BAD_SSH_KEYS.lock().first(material) {
                error!("bad google-ssh expiry record: {err}");
            }
            return true;
        }
    };
    match DateTime::parse_from_str(&info.expire_on, EXPIRE_FORMAT) {
        Ok(when) => when < Utc::now(),
        Err(err) => {
            if BAD_SSH_KEYS.lock().first(&info.expire_on) {
                error!("error parsing key expiry time {:?}: {err}", info.expire_on);
            }
            true
        }
    }
}

/// Splits a `user:key-material` line at the first colon.
pub fn parse_key_line(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(':')?;
    let (user, material) = line.split_at(idx);
    if user.is_empty() {
        return None;
    }
    Some((user, &material[1..]))
}

/// The desired user → keys mapping from the snapshot: instance keys
/// plus project keys (unless blocked), with expired keys dropped.
pub fn desired_users(snapshot: &Snapshot) -> BTreeMap<String, Vec<String>> {
    let instance = &snapshot.instance.attributes;
    let project = &snapshot.project.attributes;

    let mut lines = instance.ssh_key_lines();
    let block_project = instance
        .block_project_ssh_keys
        .or(project.block_project_ssh_keys)
        .unwrap_or(false);
    if !block_project {
        lines.extend(project.ssh_key_lines());
    }

    let mut users: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in &lines {
        let Some((user, material)) = parse_key_line(line) else {
            continue;
        };
        if key_expired(material) {
            continue;
        }
        let keys = users.entry(user.to_string()).or_default();
        if !keys.contains(&material.to_string()) {
            keys.push(material.to_string());
        }
    }
    users
}

/// Rewrites the Google section of a user's authorized_keys: existing
/// user lines are kept verbatim, previous Google lines dropped, and
/// each desired key written under the marker comment. The file is
/// replaced through a temp file in the same directory. Returns false
/// for the non-error skips (no home directory, nologin shell).
pub fn write_authorized_keys(entry: &PasswdEntry, keys: &[String]) -> Result<bool> {
    if entry.home.is_empty() || !Path::new(&entry.home).is_dir() {
        return Ok(false);
    }
    if entry.shell == "/sbin/nologin" {
        return Ok(false);
    }

    let ssh_dir = Path::new(&entry.home).join(".ssh");
    if !ssh_dir.is_dir() {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .mode(0o700)
            .create(&ssh_dir)
            .with_context(|| format!("creating {}", ssh_dir.display()))?;
        std::os::unix::fs::chown(&ssh_dir, Some(entry.uid), Some(entry.gid))
            .with_context(|| format!("owning {}", ssh_dir.display()))?;
    }

    let ak_path = ssh_dir.join("authorized_keys");
    let existing = match std::fs::read_to_string(&ak_path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", ak_path.display()))
        }
    };

    // A Google line is the marker comment plus the line that follows
    // it; everything else belongs to the user and is kept as-is.
    let mut user_lines: Vec<&str> = Vec::new();
    let mut skip_next = false;
    for line in existing.lines() {
        if skip_next {
            skip_next = false;
            continue;
        }
        if line.trim() == GOOGLE_COMMENT {
            skip_next = true;
            continue;
        }
        user_lines.push(line);
    }
    while user_lines.last() == Some(&"") {
        user_lines.pop();
    }

    let mut contents = String::new();
    for line in &user_lines {
        contents.push_str(line);
        contents.push('\n');
    }
    for key in keys {
        contents.push_str(GOOGLE_COMMENT);
        contents.push('\n');
        contents.push_str(key);
        contents.push('\n');
    }

    let mut tmp = tempfile::Builder::new()
        .prefix(".authorized_keys")
        .tempfile_in(&ssh_dir)
        .context("staging authorized_keys")?;
    tmp.write_all(contents.as_bytes())
        .context("writing authorized_keys")?;
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
    std::os::unix::fs::chown(tmp.path(), Some(entry.uid), Some(entry.gid))
        .with_context(|| format!("owning {}", ak_path.display()))?;
    tmp.persist(&ak_path)
        .map_err(|e| e.error)
        .with_context(|| format!("replacing {}", ak_path.display()))?;
    Ok(true)
}

type SshInputs<'a> = (
    &'a Option<String>,
    &'a Option<String>,
    Option<bool>,
    &'a Option<String>,
    &'a Option<String>,
    Option<bool>,
);

fn ssh_inputs(snapshot: &Snapshot) -> SshInputs<'_> {
    let i = &snapshot.instance.attributes;
    let p = &snapshot.project.attributes;
    (
        &i.ssh_keys,
        &i.ssh_keys_legacy,
        i.block_project_ssh_keys,
        &p.ssh_keys,
        &p.ssh_keys_legacy,
        p.block_project_ssh_keys,
    )
}

pub struct LinuxAccountsManager {
    prev: Arc<Snapshot>,
    next: Arc<Snapshot>,
    config: Arc<InstanceConfig>,
    ops: Arc<dyn UserOps>,
    users_file: PathBuf,
    sudoers_file: PathBuf,
    cache: KeyCache,
}

impl LinuxAccountsManager {
    pub fn new(prev: Arc<Snapshot>, next: Arc<Snapshot>, config: Arc<InstanceConfig>) -> Self {
        Self::with_backend(
            prev,
            next,
            config,
            Arc::new(SystemUsers),
            DEFAULT_USERS_FILE.into(),
            DEFAULT_SUDOERS_FILE.into(),
            WRITTEN_KEYS.clone(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn with_backend(
        prev: Arc<Snapshot>,
        next: Arc<Snapshot>,
        config: Arc<InstanceConfig>,
        ops: Arc<dyn UserOps>,
        users_file: PathBuf,
        sudoers_file: PathBuf,
        cache: KeyCache,
    ) -> Self {
        Self {
            prev,
            next,
            config,
            ops,
            users_file,
            sudoers_file,
            cache,
        }
    }

    fn template(&self, key: &str, default: &str) -> String {
        self.config
            .get_str("Accounts", key)
            .unwrap_or_else(|| default.to_string())
    }

    fn read_owned_users(&self) -> Vec<String> {
        match std::fs::read_to_string(&self.users_file) {
            Ok(contents) => contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn write_owned_users(&self, users: &[String]) -> Result<()> {
        let parent = self
            .users_file
            .parent()
            .context("users file has no parent directory")?;
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        for user in users {
            writeln!(tmp, "{user}")?;
        }
        tmp.persist(&self.users_file).map_err(|e| e.error)?;
        Ok(())
    }

    async fn create_user(&self, user: &str) -> Result<()> {
        let useradd = fill_template(
            &self.template("useradd_cmd", DEFAULT_USERADD_CMD),
            &[("user", user)],
        );
        self.ops.run(&useradd).await.context("useradd")
    }

    /// Every user metadata names gets sudo: google-sudoers membership
    /// guarded by the exclusive-create sudoers file.
    async fn ensure_sudo_access(&self, user: &str) -> Result<()> {
        if !self.ops.group_exists(SUDOERS_GROUP)? {
            let groupadd = fill_template(
                &self.template("groupadd_cmd", DEFAULT_GROUPADD_CMD),
                &[("group", SUDOERS_GROUP)],
            );
            self.ops.run(&groupadd).await.context("groupadd")?;
        }
        let gpasswd = fill_template(
            &self.template("gpasswd_add_cmd", DEFAULT_GPASSWD_ADD_CMD),
            &[("user", user), ("group", SUDOERS_GROUP)],
        );
        self.ops.run(&gpasswd).await.context("gpasswd")?;

        self.ensure_sudoers_file()
    }

    /// Writes the sudoers guard with exclusive-create so an existing
    /// (possibly operator-edited) file is never overwritten.
    fn ensure_sudoers_file(&self) -> Result<()> {
        use std::os::unix::fs::OpenOptionsExt;
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o440)
            .open(&self.sudoers_file)
        {
            Ok(mut file) => {
                file.write_all(SUDOERS_CONTENT.as_bytes())?;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("creating {}", self.sudoers_file.display()))
            }
        }
    }

    /// Deprovisions a user we own that metadata no longer names. The
    /// default policy deletes the account; the alternative empties the
    /// Google-managed keys and drops the sudoers membership. Returns
    /// true when the user should leave the owned set.
    async fn remove_user(&self, user: &str) -> bool {
        let delete = self
            .config
            .get_bool("Accounts", "deprovision_remove")
            .unwrap_or(true);
        if delete {
            info!("removing user {user}");
            let userdel = fill_template(
                &self.template("userdel_cmd", DEFAULT_USERDEL_CMD),
                &[("user", user)],
            );
            if let Err(err) = self.ops.run(&userdel).await {
                error!("removing user {user}: {err:#}");
                return false;
            }
            return true;
        }

        info!("revoking access for user {user}");
        match self.ops.lookup(user) {
            Ok(Some(entry)) => {
                if let Err(err) = write_authorized_keys(&entry, &[]) {
                    error!("clearing keys for {user}: {err:#}");
                }
            }
            Ok(None) => {}
            Err(err) => error!("looking up {user}: {err:#}"),
        }
        let gpasswd = fill_template(
            &self.template("gpasswd_remove_cmd", DEFAULT_GPASSWD_REMOVE_CMD),
            &[("user", user), ("group", SUDOERS_GROUP)],
        );
        if let Err(err) = self.ops.run(&gpasswd).await {
            error!("removing {user} from {SUDOERS_GROUP}: {err:#}");
        }
        true
    }
}

#[async_trait]
impl Manager for LinuxAccountsManager {
    fn name(&self) -> &'static str {
        "account"
    }

    fn disabled(&self) -> bool {
        let disabled = resolve_flag(
            self.config.get_bool("accountManager", "disable"),
            self.next.instance.attributes.disable_account_manager,
            self.next.project.attributes.disable_account_manager,
            false,
        );
        log_transition(self.name(), disabled, &LINUX_ACCOUNTS_DISABLED);
        disabled
    }

    fn diff(&self) -> bool {
        if ssh_inputs(&self.next) != ssh_inputs(&self.prev) {
            return true;
        }
        // Time alone can invalidate state: an expiring key in a file we
        // wrote earlier forces a rescan even with unchanged metadata.
        self.cache
            .lock()
            .values()
            .flatten()
            .any(|key| key_expired(key))
    }

    async fn set(&mut self) -> Result<()> {
        let owned = self.read_owned_users();
        let desired = desired_users(&self.next);
        let mut created: Vec<String> = Vec::new();

        for (user, keys) in &desired {
            let entry = match self.ops.lookup(user) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    info!("creating user {user}");
                    if let Err(err) = self.create_user(user).await {
                        error!("creating user {user}: {err:#}");
                        continue;
                    }
                    created.push(user.clone());
                    match self.ops.lookup(user) {
                        Ok(Some(entry)) => entry,
                        Ok(None) => {
                            error!("user {user} missing after creation");
                            continue;
                        }
                        Err(err) => {
                            error!("looking up {user}: {err:#}");
                            continue;
                        }
                    }
                }
                Err(err) => {
                    error!("looking up {user}: {err:#}");
                    continue;
                }
            };

            if let Err(err) = self.ensure_sudo_access(user).await {
                error!("granting sudo access to {user}: {err:#}");
            }

            if self.cache.lock().get(user.as_str()) == Some(keys) {
                continue;
            }
            match write_authorized_keys(&entry, keys) {
                Ok(true) => {
                    self.cache.lock().insert(user.clone(), keys.clone());
                }
                Ok(false) => {}
                Err(err) => error!("updating keys for {user}: {err:#}"),
            }
        }

        let mut new_owned: Vec<String> = Vec::new();
        for user in &owned {
            if desired.contains_key(user) {
                new_owned.push(user.clone());
            } else if self.remove_user(user).await {
                self.cache.lock().remove(user);
            } else {
                // Removal failed; keep ownership so the next tick retries.
                new_owned.push(user.clone());
            }
        }
        for user in created {
            if !new_owned.contains(&user) {
                new_owned.push(user);
            }
        }

        if new_owned != owned {
            self.write_owned_users(&new_owned)
                .context("writing google-users file")?;
        }
        Ok(())
    }
}
