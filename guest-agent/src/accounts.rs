//! Windows account reconciler
//!
//! Each authorized windows-keys record asks the agent to create an
//! account or reset its password. The generated password is encrypted
//! under the requester's RSA public key with OAEP and published as one
//! JSON line on the credentials serial port, so the secret never leaves
//! the machine in the clear.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, LazyLock};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use guest_core::config::{resolve_flag, InstanceConfig};
use guest_core::dedup::DedupSet;
use guest_core::metadata::Snapshot;
use guest_core::serial::write_serial;
use guest_core::store::{KeyStore, StoreError};
use parking_lot::Mutex;
use rand::Rng;
use rsa::{BigUint, Oaep, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use tracing::{error, info};

use crate::manager::{log_transition, Manager};
use crate::users::{AccountOps, SystemAccounts};

const STORE_SECTION: &str = "accounts";
const STORE_NAME: &str = "public-keys";
const DEFAULT_CREDS_PORT: &str = "COM4";

const PASSWORD_LENGTH: usize = 15;
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
// Characters that are hard to type on a command line (quotes, non
// english characters) are left out.
const SPECIAL: &[u8] = br"~!@#$%^&*_-+=|\(){}[]:;<>,.?/";

static ACCOUNT_DISABLED: AtomicBool = AtomicBool::new(false);
static BAD_KEYS: LazyLock<Mutex<DedupSet>> = LazyLock::new(|| Mutex::new(DedupSet::new()));
static BAD_REGISTRY: LazyLock<Mutex<DedupSet>> = LazyLock::new(|| Mutex::new(DedupSet::new()));
static BAD_EXPIRE: LazyLock<Mutex<DedupSet>> = LazyLock::new(|| Mutex::new(DedupSet::new()));

/// One authorized password-reset request from metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WindowsKey {
    pub user_name: String,
    pub modulus: String,
    pub exponent: String,
    pub expire_on: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl WindowsKey {
    /// A key is live when every required field is present and it has
    /// not expired. Only live keys trigger provisioning; dead keys are
    /// still recorded in the registry baseline.
    pub fn is_live(&self) -> bool {
        !self.user_name.is_empty()
            && !self.modulus.is_empty()
            && !self.exponent.is_empty()
            && !self.expire_on.is_empty()
            && !timestamp_expired(&self.expire_on)
    }

    /// Two records are the same request iff user, modulus and expiry
    /// match; a changed exponent or email alone does not re-provision.
    pub fn equivalent(&self, other: &WindowsKey) -> bool {
        self.user_name == other.user_name
            && self.modulus == other.modulus
            && self.expire_on == other.expire_on
    }
}

/// RFC-3339 expiry check shared by the key and diagnostics records. An
/// unparseable timestamp counts as expired and is logged once.
pub fn timestamp_expired(expire_on: &str) -> bool {
    match DateTime::parse_from_rfc3339(expire_on) {
        Ok(when) => when < Utc::now(),
        Err(err) => {
            if BAD_EXPIRE.lock().first(expire_on) {
                error!("error parsing expiry time {expire_on:?}: {err}");
            }
            true
        }
    }
}

/// Parses the newline-separated JSON records of the windows-keys
/// attribute, skipping (and logging once) anything malformed.
pub fn parse_windows_keys(raw: &str) -> Vec<WindowsKey> {
    let mut keys = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<WindowsKey>(line) {
            Ok(key) => keys.push(key),
            Err(err) => {
                if BAD_KEYS.lock().first(line) {
                    error!("bad windows key in metadata: {err}");
                }
            }
        }
    }
    keys
}

/// Live keys in `new_keys` with no equivalent entry in the stored
/// registry list.
fn keys_to_add(new_keys: &[WindowsKey], registry: &[String]) -> Vec<WindowsKey> {
    if new_keys.is_empty() {
        return Vec::new();
    }
    let old_keys: Vec<WindowsKey> = registry
        .iter()
        .filter_map(|entry| match serde_json::from_str(entry) {
            Ok(key) => Some(key),
            Err(err) => {
                if BAD_REGISTRY.lock().first(entry) {
                    error!("bad windows key in registry: {err}");
                }
                None
            }
        })
        .collect();

    new_keys
        .iter()
        .filter(|key| key.is_live() && !old_keys.iter().any(|old| old.equivalent(key)))
        .cloned()
        .collect()
}

/// Generates a 15-character password meeting Windows complexity
/// requirements: drawn from four character classes with at least three
/// classes represented, retrying until that holds.
pub fn generate_password() -> String {
    let chars: Vec<u8> = [LOWER, UPPER, DIGITS, SPECIAL].concat();
    let mut rng = rand::thread_rng();
    loop {
        let pwd: Vec<u8> = (0..PASSWORD_LENGTH)
            .map(|_| chars[rng.gen_range(0..chars.len())])
            .collect();
        let classes = [LOWER, UPPER, DIGITS, SPECIAL]
            .iter()
            .filter(|class| pwd.iter().any(|b| class.contains(b)))
            .count();
        if classes >= 3 {
            return String::from_utf8(pwd).expect("ascii password");
        }
    }
}

/// The credentials record published on the serial port, one compact
/// JSON object per line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CredsRecord {
    pub password_found: bool,
    pub user_name: String,
    pub modulus: String,
    pub exponent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Builds the success record: the password OAEP-encrypted under the
/// key's RSA public key with the requested hash (default sha1).
pub fn encrypt_credentials(key: &WindowsKey, password: &str) -> Result<CredsRecord> {
    let modulus = BASE64
        .decode(&key.modulus)
        .context("decoding key modulus")?;
    let exponent = BASE64
        .decode(&key.exponent)
        .context("decoding key exponent")?;
    let public_key = RsaPublicKey::new(
        BigUint::from_bytes_be(&modulus),
        BigUint::from_bytes_be(&exponent),
    )
    .context("building RSA public key")?;

    let hash_function = key.hash_function.as_deref().unwrap_or("sha1");
    let padding = match hash_function {
        "sha1" => Oaep::new::<Sha1>(),
        "sha256" => Oaep::new::<Sha256>(),
        "sha512" => Oaep::new::<Sha512>(),
        other => bail!("unknown hash function requested: {other:?}"),
    };

    let encrypted = public_key
        .encrypt(&mut rand::thread_rng(), padding, password.as_bytes())
        .context("encrypting password")?;

    Ok(CredsRecord {
        password_found: true,
        user_name: key.user_name.clone(),
        modulus: key.modulus.clone(),
        exponent: key.exponent.clone(),
        hash_function: Some(hash_function.to_string()),
        encrypted_password: Some(BASE64.encode(encrypted)),
        error_message: None,
    })
}

fn failure_record(key: &WindowsKey, message: &str) -> CredsRecord {
    CredsRecord {
        password_found: false,
        user_name: key.user_name.clone(),
        modulus: key.modulus.clone(),
        exponent: key.exponent.clone(),
        hash_function: None,
        encrypted_password: None,
        error_message: Some(message.to_string()),
    }
}

/// Where finished credentials records go.
pub trait CredsSink: Send + Sync {
    fn publish(&self, creds: &CredsRecord) -> Result<()>;
}

/// The production sink: one JSON line per record on the serial port.
pub struct SerialSink {
    port: String,
}

impl CredsSink for SerialSink {
    fn publish(&self, creds: &CredsRecord) -> Result<()> {
        let line = serde_json::to_vec(creds).context("serializing credentials")?;
        write_serial(&self.port, &line)
    }
}

pub struct WindowsAccountsManager {
    prev: Arc<Snapshot>,
    next: Arc<Snapshot>,
    config: Arc<InstanceConfig>,
    store: Arc<KeyStore>,
    ops: Arc<dyn AccountOps>,
    sink: Arc<dyn CredsSink>,
}

impl WindowsAccountsManager {
    pub fn new(
        prev: Arc<Snapshot>,
        next: Arc<Snapshot>,
        config: Arc<InstanceConfig>,
        store: Arc<KeyStore>,
    ) -> Self {
        let port = config
            .get_str("accountManager", "port")
            .unwrap_or_else(|| DEFAULT_CREDS_PORT.to_string());
        Self::with_backend(
            prev,
            next,
            config,
            store,
            Arc::new(SystemAccounts),
            Arc::new(SerialSink { port }),
        )
    }

    fn with_backend(
        prev: Arc<Snapshot>,
        next: Arc<Snapshot>,
        config: Arc<InstanceConfig>,
        store: Arc<KeyStore>,
        ops: Arc<dyn AccountOps>,
        sink: Arc<dyn CredsSink>,
    ) -> Self {
        Self {
            prev,
            next,
            config,
            store,
            ops,
            sink,
        }
    }

    /// Creates the user or resets their password, then builds the
    /// encrypted credentials record.
    async fn provision(&self, key: &WindowsKey) -> Result<CredsRecord> {
        let password = generate_password();
        if self.ops.user_exists(&key.user_name).await {
            info!("resetting password for user {}", key.user_name);
            self.ops
                .set_password(&key.user_name, &password)
                .await
                .context("resetting password")?;
        } else {
            info!("creating user {}", key.user_name);
            self.ops
                .create_admin_user(&key.user_name, &password)
                .await
                .context("creating user")?;
        }
        encrypt_credentials(key, &password)
    }
}

#[async_trait]
impl Manager for WindowsAccountsManager {
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
        log_transition(self.name(), disabled, &ACCOUNT_DISABLED);
        disabled
    }

    fn diff(&self) -> bool {
        self.next.instance.attributes.windows_keys != self.prev.instance.attributes.windows_keys
    }

    async fn set(&mut self) -> Result<()> {
        let raw = self
            .next
            .instance
            .attributes
            .windows_keys
            .clone()
            .unwrap_or_default();
        let new_keys = parse_windows_keys(&raw);
        let registry = match self.store.read(STORE_SECTION, STORE_NAME) {
            Ok(values) => values,
            Err(StoreError::NotExist { .. }) => Vec::new(),
            Err(err) => return Err(err).context("reading windows-key registry"),
        };

        for key in keys_to_add(&new_keys, &registry) {
            let creds = match self.provision(&key).await {
                Ok(creds) => creds,
                Err(err) => {
                    error!("error setting password for {}: {err:#}", key.user_name);
                    failure_record(&key, &format!("{err:#}"))
                }
            };
            if let Err(err) = self.sink.publish(&creds) {
                error!("publishing credentials for {}: {err:#}", key.user_name);
            }
        }

        // The registry baseline becomes every key in the new snapshot,
        // live or not, so the next tick diffs against what it saw.
        let serialized: Vec<String> = new_keys
            .iter()
            .filter_map(|key| serde_json::to_string(key).ok())
            .collect();
        self.store
            .write(STORE_SECTION, STORE_NAME, &serialized)
            .context("writing windows-key registry")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::traits::PublicKeyParts;
    use rsa::RsaPrivateKey;

    fn future_timestamp() -> String {
        (Utc::now() + chrono::Duration::days(1)).to_rfc3339()
    }

    fn test_keypair() -> (RsaPrivateKey, String, String) {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let modulus = BASE64.encode(private.n().to_bytes_be());
        let exponent = BASE64.encode(private.e().to_bytes_be());
        (private, modulus, exponent)
    }

    fn live_key(user: &str, modulus: &str, exponent: &str) -> WindowsKey {
        WindowsKey {
            user_name: user.to_string(),
            modulus: modulus.to_string(),
            exponent: exponent.to_string(),
            expire_on: future_timestamp(),
            hash_function: None,
            email: None,
        }
    }

    #[test]
    fn test_password_complexity() {
        for _ in 0..200 {
            let pwd = generate_password();
            assert_eq!(pwd.len(), 15);
            let all: Vec<u8> = [LOWER, UPPER, DIGITS, SPECIAL].concat();
            assert!(pwd.bytes().all(|b| all.contains(&b)));
            let classes = [LOWER, UPPER, DIGITS, SPECIAL]
                .iter()
                .filter(|class| pwd.bytes().any(|b| class.contains(&b)))
                .count();
            assert!(classes >= 3, "only {classes} classes in {pwd:?}");
        }
    }

    #[test]
    fn test_credentials_round_trip_sha1() {
        let (private, modulus, exponent) = test_keypair();
        let key = live_key("alice", &modulus, &exponent);
        let creds = encrypt_credentials(&key, "s3cr3t-Passw0rd").unwrap();
        assert!(creds.password_found);
        assert_eq!(creds.hash_function.as_deref(), Some("sha1"));

        let ciphertext = BASE64.decode(creds.encrypted_password.unwrap()).unwrap();
        let plain = private.decrypt(Oaep::new::<Sha1>(), &ciphertext).unwrap();
        assert_eq!(plain, b"s3cr3t-Passw0rd");
    }

    #[test]
    fn test_credentials_round_trip_sha256() {
        let (private, modulus, exponent) = test_keypair();
        let mut key = live_key("alice", &modulus, &exponent);
        key.hash_function = Some("sha256".to_string());
        let creds = encrypt_credentials(&key, "pw").unwrap();

        let ciphertext = BASE64.decode(creds.encrypted_password.unwrap()).unwrap();
        let plain = private.decrypt(Oaep::new::<Sha256>(), &ciphertext).unwrap();
        assert_eq!(plain, b"pw");
    }

    #[test]
    fn test_unknown_hash_function_rejected() {
        let (_, modulus, exponent) = test_keypair();
        let mut key = live_key("alice", &modulus, &exponent);
        key.hash_function = Some("md5".to_string());
        assert!(encrypt_credentials(&key, "pw").is_err());
    }

    #[test]
    fn test_expiry_semantics() {
        assert!(!timestamp_expired(&future_timestamp()));
        assert!(timestamp_expired("2019-04-01T00:00:00Z"));
        assert!(timestamp_expired("the day after tomorrow"));
    }

    #[test]
    fn test_parse_skips_malformed_records() {
        let raw = "{\"userName\":\"a\",\"modulus\":\"m\"}\nnot json at all\n\n{\"userName\":\"b\"}";
        let keys = parse_windows_keys(raw);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].user_name, "a");
        assert_eq!(keys[1].user_name, "b");
    }

    #[test]
    fn test_equivalence_tuple() {
        let base = live_key("alice", "mod", "exp");
        let registry = vec![serde_json::to_string(&base).unwrap()];

        // Same user/modulus/expiry with different email and exponent:
        // not re-provisioned.
        let mut same = base.clone();
        same.email = Some("alice@example.com".to_string());
        same.exponent = "AQAC".to_string();
        assert!(keys_to_add(&[same], &registry).is_empty());

        // A new expiry is a new request.
        let mut renewed = base.clone();
        renewed.expire_on = (Utc::now() + chrono::Duration::days(2)).to_rfc3339();
        assert_eq!(keys_to_add(&[renewed], &registry).len(), 1);
    }

    #[test]
    fn test_dead_keys_not_provisioned() {
        let mut expired = live_key("old", "mod", "exp");
        expired.expire_on = "2019-04-01T00:00:00Z".to_string();
        let missing_field = WindowsKey {
            user_name: "incomplete".to_string(),
            ..Default::default()
        };
        assert!(keys_to_add(&[expired, missing_field], &[]).is_empty());
    }

    #[test]
    fn test_registry_round_trip_is_semantically_equal() {
        let key = live_key("alice", "mod", "exp");
        let serialized = serde_json::to_string(&key).unwrap();
        let reparsed: WindowsKey = serde_json::from_str(&serialized).unwrap();
        assert_eq!(key, reparsed);
    }

    struct FakeAccounts {
        existing: Vec<String>,
        fail: bool,
        created: Mutex<Vec<String>>,
        reset: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AccountOps for FakeAccounts {
        async fn user_exists(&self, user: &str) -> bool {
            self.existing.contains(&user.to_string())
        }

        async fn create_admin_user(&self, user: &str, _password: &str) -> Result<()> {
            if self.fail {
                anyhow::bail!("user database locked");
            }
            self.created.lock().push(user.to_string());
            Ok(())
        }

        async fn set_password(&self, user: &str, _password: &str) -> Result<()> {
            if self.fail {
                anyhow::bail!("user database locked");
            }
            self.reset.lock().push(user.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectSink {
        records: Mutex<Vec<CredsRecord>>,
    }

    impl CredsSink for CollectSink {
        fn publish(&self, creds: &CredsRecord) -> Result<()> {
            self.records.lock().push(creds.clone());
            Ok(())
        }
    }

    fn manager_for(
        raw_keys: &str,
        store: Arc<KeyStore>,
        ops: Arc<FakeAccounts>,
        sink: Arc<CollectSink>,
    ) -> WindowsAccountsManager {
        let mut next = Snapshot::default();
        next.instance.attributes.windows_keys = Some(raw_keys.to_string());
        WindowsAccountsManager::with_backend(
            Arc::new(Snapshot::default()),
            Arc::new(next),
            Arc::new(InstanceConfig::default()),
            store,
            ops,
            sink,
        )
    }

    #[tokio::test]
    async fn test_set_provisions_and_records() {
        let (private, modulus, exponent) = test_keypair();
        let key = live_key("alice", &modulus, &exponent);
        let raw = serde_json::to_string(&key).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KeyStore::new(dir.path()));
        let ops = Arc::new(FakeAccounts {
            existing: vec![],
            fail: false,
            created: Mutex::new(vec![]),
            reset: Mutex::new(vec![]),
        });
        let sink = Arc::new(CollectSink::default());

        let mut mgr = manager_for(&raw, store.clone(), ops.clone(), sink.clone());
        mgr.set().await.unwrap();

        assert_eq!(*ops.created.lock(), ["alice"]);
        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        assert!(records[0].password_found);

        // The published password decrypts and meets the complexity bar.
        let ciphertext = BASE64
            .decode(records[0].encrypted_password.as_ref().unwrap())
            .unwrap();
        let plain = private.decrypt(Oaep::new::<Sha1>(), &ciphertext).unwrap();
        assert_eq!(plain.len(), 15);

        // The registry now holds the serialized key.
        let registry = store.read(STORE_SECTION, STORE_NAME).unwrap();
        assert_eq!(registry.len(), 1);
        let stored: WindowsKey = serde_json::from_str(&registry[0]).unwrap();
        assert!(stored.equivalent(&key));
    }

    #[tokio::test]
    async fn test_set_failure_publishes_in_band_error() {
        let (_, modulus, exponent) = test_keypair();
        let key = live_key("bob", &modulus, &exponent);
        let raw = serde_json::to_string(&key).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KeyStore::new(dir.path()));
        let ops = Arc::new(FakeAccounts {
            existing: vec![],
            fail: true,
            created: Mutex::new(vec![]),
            reset: Mutex::new(vec![]),
        });
        let sink = Arc::new(CollectSink::default());

        let mut mgr = manager_for(&raw, store.clone(), ops, sink.clone());
        mgr.set().await.unwrap();

        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        assert!(!records[0].password_found);
        assert!(records[0].error_message.as_ref().unwrap().contains("locked"));
        // Registry still rewritten so the failure is not retried forever.
        assert_eq!(store.read(STORE_SECTION, STORE_NAME).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_is_idempotent_against_registry() {
        let (_, modulus, exponent) = test_keypair();
        let key = live_key("carol", &modulus, &exponent);
        let raw = serde_json::to_string(&key).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KeyStore::new(dir.path()));
        let sink = Arc::new(CollectSink::default());
        let ops = Arc::new(FakeAccounts {
            existing: vec![],
            fail: false,
            created: Mutex::new(vec![]),
            reset: Mutex::new(vec![]),
        });

        let mut first = manager_for(&raw, store.clone(), ops.clone(), sink.clone());
        first.set().await.unwrap();
        let mut second = manager_for(&raw, store.clone(), ops.clone(), sink.clone());
        second.set().await.unwrap();

        assert_eq!(sink.records.lock().len(), 1);
        assert_eq!(ops.created.lock().len(), 1);
    }
}
