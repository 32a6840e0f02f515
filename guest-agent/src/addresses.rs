//! Forwarded-IP address reconciler
//!
//! Brings each NIC's assigned addresses in line with the forwarded IPs
//! the metadata service says it should carry. The reconciler only ever
//! removes addresses it previously added itself, tracked per MAC in the
//! key store, so manually configured addresses are never touched.

use std::net::Ipv4Addr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use guest_core::config::{resolve_flag, InstanceConfig};
use guest_core::dedup::DedupSet;
use guest_core::metadata::{Attributes, NetworkInterface, Snapshot};
use guest_core::store::{KeyStore, StoreError};
use mac_address::MacAddress;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::manager::{log_transition, Manager};
use crate::net::NetOps;

const STORE_SECTION: &str = "forwarded-ips";

static ADDRESS_DISABLED: AtomicBool = AtomicBool::new(false);
static BAD_INPUT: LazyLock<Mutex<DedupSet>> = LazyLock::new(|| Mutex::new(DedupSet::new()));

/// The three-way diff at the heart of the reconciler:
/// add what metadata wants and the interface lacks; remove what we
/// added earlier, is still present, and is no longer wanted.
pub fn compare_ips(
    registry: &[String],
    metadata: &[String],
    configured: &[String],
) -> (Vec<String>, Vec<String>) {
    let to_add = metadata
        .iter()
        .filter(|ip| !configured.contains(ip))
        .cloned()
        .collect();
    let to_rm = configured
        .iter()
        .filter(|ip| registry.contains(ip) && !metadata.contains(ip))
        .cloned()
        .collect();
    (to_add, to_rm)
}

/// Applies the failover-cluster policy before diffing. A `wsfc-addrs`
/// list strips exactly those addresses everywhere; otherwise an
/// `enable-wsfc` flag surrenders every forwarded IP to the cluster.
pub fn apply_wsfc_filter(
    interfaces: &[NetworkInterface],
    attributes: &Attributes,
    dedup: &mut DedupSet,
) -> Vec<NetworkInterface> {
    let wsfc_addrs = attributes.wsfc_addrs.as_deref().unwrap_or("");
    if !wsfc_addrs.is_empty() {
        let mut blocked = Vec::new();
        for token in wsfc_addrs.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if token.parse::<Ipv4Addr>().is_ok() {
                blocked.push(token.to_string());
            } else if dedup.first(token) {
                error!("ignoring invalid address {token:?} in wsfc-addrs");
            }
        }
        return interfaces
            .iter()
            .map(|ni| {
                let mut ni = ni.clone();
                ni.forwarded_ips.retain(|ip| !blocked.contains(ip));
                ni
            })
            .collect();
    }

    if attributes.enable_wsfc == Some(true) {
        return interfaces
            .iter()
            .map(|ni| {
                let mut ni = ni.clone();
                ni.forwarded_ips.clear();
                ni
            })
            .collect();
    }

    interfaces.to_vec()
}

fn wsfc_inputs(snapshot: &Snapshot) -> (Option<bool>, Option<&str>) {
    let attrs = &snapshot.instance.attributes;
    (attrs.enable_wsfc, attrs.wsfc_addrs.as_deref())
}

pub struct AddressManager {
    prev: Arc<Snapshot>,
    next: Arc<Snapshot>,
    config: Arc<InstanceConfig>,
    store: Arc<KeyStore>,
    net: Arc<dyn NetOps>,
}

impl AddressManager {
    pub fn new(
        prev: Arc<Snapshot>,
        next: Arc<Snapshot>,
        config: Arc<InstanceConfig>,
        store: Arc<KeyStore>,
        net: Arc<dyn NetOps>,
    ) -> Self {
        Self {
            prev,
            next,
            config,
            store,
            net,
        }
    }

    async fn reconcile_interface(
        &self,
        ni: &NetworkInterface,
        interfaces: &[crate::net::Interface],
    ) {
        let mac: MacAddress = match ni.mac.parse() {
            Ok(mac) => mac,
            Err(err) => {
                if BAD_INPUT.lock().first(&ni.mac) {
                    error!("invalid MAC address {:?} in metadata: {err}", ni.mac);
                }
                return;
            }
        };
        let mac_key = mac.to_string();

        let Some(iface) = interfaces.iter().find(|i| i.mac == mac) else {
            if BAD_INPUT.lock().first(&ni.mac) {
                error!("no interface with MAC {mac} exists on this system");
            }
            return;
        };

        let registry = match self.store.read(STORE_SECTION, &mac_key) {
            Ok(values) => values,
            Err(StoreError::NotExist { .. }) => Vec::new(),
            Err(err) => {
                error!("reading forwarded-ip registry for {mac}: {err}");
                return;
            }
        };
        let configured: Vec<String> = iface.ipv4.iter().map(|ip| ip.to_string()).collect();

        let (to_add, to_rm) = compare_ips(&registry, &ni.forwarded_ips, &configured);
        if !to_add.is_empty() || !to_rm.is_empty() {
            info!(
                "changing forwarded IPs for {mac} from {registry:?} to {:?} by adding {to_add:?} and removing {to_rm:?}",
                ni.forwarded_ips
            );
        }

        // The new registry is the desired set, minus whatever failed to
        // apply, so the next tick retries exactly the failed pieces.
        let mut new_registry = ni.forwarded_ips.clone();
        for ip_str in &to_add {
            match ip_str.parse::<Ipv4Addr>() {
                Ok(ip) => {
                    if let Err(err) = self.net.add_ip(iface, ip).await {
                        error!("adding {ip} to {}: {err:#}", iface.name);
                        new_registry.retain(|r| r != ip_str);
                    }
                }
                Err(_) => {
                    if BAD_INPUT.lock().first(ip_str) {
                        error!("invalid forwarded IP {ip_str:?} in metadata");
                    }
                    new_registry.retain(|r| r != ip_str);
                }
            }
        }
        for ip_str in &to_rm {
            match ip_str.parse::<Ipv4Addr>() {
                Ok(ip) => {
                    if let Err(err) = self.net.remove_ip(iface, ip).await {
                        error!("removing {ip} from {}: {err:#}", iface.name);
                        new_registry.push(ip_str.clone());
                    }
                }
                Err(_) => {}
            }
        }

        if let Err(err) = self.store.write(STORE_SECTION, &mac_key, &new_registry) {
            error!("writing forwarded-ip registry for {mac}: {err}");
        }
    }
}

#[async_trait]
impl Manager for AddressManager {
    fn name(&self) -> &'static str {
        "address"
    }

    fn disabled(&self) -> bool {
        let disabled = resolve_flag(
            self.config.get_bool("addressManager", "disable"),
            self.next.instance.attributes.disable_address_manager,
            self.project_disable(),
            false,
        );
        log_transition(self.name(), disabled, &ADDRESS_DISABLED);
        disabled
    }

    fn diff(&self) -> bool {
        self.next.instance.network_interfaces != self.prev.instance.network_interfaces
            || wsfc_inputs(&self.next) != wsfc_inputs(&self.prev)
    }

    async fn set(&mut self) -> Result<()> {
        let interfaces = self
            .net
            .interfaces()
            .context("listing local interfaces")?;
        let filtered = apply_wsfc_filter(
            &self.next.instance.network_interfaces,
            &self.next.instance.attributes,
            &mut BAD_INPUT.lock(),
        );
        for ni in &filtered {
            self.reconcile_interface(ni, &interfaces).await;
        }
        Ok(())
    }
}

impl AddressManager {
    fn project_disable(&self) -> Option<bool> {
        self.next.project.attributes.disable_address_manager
    }
}
