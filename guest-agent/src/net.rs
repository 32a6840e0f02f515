//! Network adapters
//!
//! Everything the address reconciler and the health probe need from the
//! host network stack: interface enumeration (name, MAC, assigned IPv4
//! addresses) and adding/removing an address on an interface. The
//! mutating operations sit behind a trait so the reconciler is testable
//! without touching the system.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use if_addrs::{get_if_addrs, IfAddr};
use mac_address::{mac_address_by_name, MacAddress};
use tokio::process::Command;
use tracing::debug;

/// One local interface with its hardware address and IPv4 set.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub mac: MacAddress,
    pub ipv4: Vec<Ipv4Addr>,
}

#[async_trait]
pub trait NetOps: Send + Sync {
    fn interfaces(&self) -> Result<Vec<Interface>>;
    async fn add_ip(&self, iface: &Interface, ip: Ipv4Addr) -> Result<()>;
    async fn remove_ip(&self, iface: &Interface, ip: Ipv4Addr) -> Result<()>;
}

/// The real host network stack.
pub struct SystemNet;

async fn run_checked(argv: &[String]) -> Result<()> {
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

fn add_ip_argv(iface: &Interface, ip: Ipv4Addr) -> Vec<String> {
    if cfg!(windows) {
        [
            "netsh", "interface", "ipv4", "add", "address",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain([
            format!("name={}", iface.name),
            format!("address={ip}"),
            "mask=255.255.255.255".to_string(),
            "store=active".to_string(),
        ])
        .collect()
    } else {
        vec![
            "ip".to_string(),
            "addr".to_string(),
            "add".to_string(),
            format!("{ip}/32"),
            "dev".to_string(),
            iface.name.clone(),
        ]
    }
}

fn remove_ip_argv(iface: &Interface, ip: Ipv4Addr) -> Vec<String> {
    if cfg!(windows) {
        [
            "netsh", "interface", "ipv4", "delete", "address",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain([format!("name={}", iface.name), format!("address={ip}")])
        .collect()
    } else {
        vec![
            "ip".to_string(),
            "addr".to_string(),
            "del".to_string(),
            format!("{ip}/32"),
            "dev".to_string(),
            iface.name.clone(),
        ]
    }
}

#[async_trait]
impl NetOps for SystemNet {
    fn interfaces(&self) -> Result<Vec<Interface>> {
        let mut by_name: BTreeMap<String, Vec<Ipv4Addr>> = BTreeMap::new();
        for entry in get_if_addrs().context("enumerating network interfaces")? {
            if let IfAddr::V4(v4) = entry.addr {
                by_name.entry(entry.name).or_default().push(v4.ip);
            }
        }

        let mut interfaces = Vec::new();
        for (name, ipv4) in by_name {
            match mac_address_by_name(&name) {
                Ok(Some(mac)) => interfaces.push(Interface { name, mac, ipv4 }),
                Ok(None) => debug!("interface {name} has no hardware address"),
                Err(err) => debug!("reading hardware address of {name}: {err}"),
            }
        }
        Ok(interfaces)
    }

    async fn add_ip(&self, iface: &Interface, ip: Ipv4Addr) -> Result<()> {
        run_checked(&add_ip_argv(iface, ip)).await
    }

    async fn remove_ip(&self, iface: &Interface, ip: Ipv4Addr) -> Result<()> {
        run_checked(&remove_ip_argv(iface, ip)).await
    }
}

/// Whether `ip` is assigned to any non-loopback local interface.
pub fn local_ipv4_present(ip: Ipv4Addr) -> Result<bool> {
    for entry in get_if_addrs().context("enumerating network interfaces")? {
        if entry.is_loopback() {
            continue;
        }
        if let IfAddr::V4(v4) = entry.addr {
            if v4.ip == ip {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface() -> Interface {
        Interface {
            name: "eth0".to_string(),
            mac: MacAddress::new([0x42, 0x01, 0x0a, 0x00, 0x00, 0x02]),
            ipv4: vec![],
        }
    }

    #[test]
    fn test_address_command_shapes() {
        let ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        let add = add_ip_argv(&iface(), ip);
        let del = remove_ip_argv(&iface(), ip);
        if cfg!(windows) {
            assert!(add.contains(&"address=10.0.0.5".to_string()));
            assert!(del.contains(&"address=10.0.0.5".to_string()));
        } else {
            assert_eq!(add, ["ip", "addr", "add", "10.0.0.5/32", "dev", "eth0"]);
            assert_eq!(del, ["ip", "addr", "del", "10.0.0.5/32", "dev", "eth0"]);
        }
    }

    #[test]
    fn test_loopback_never_counts_as_local() {
        assert!(!local_ipv4_present("127.0.0.1".parse().unwrap()).unwrap());
    }
}
