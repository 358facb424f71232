//! Host networking substrate: the dedicated network namespace, its bridge,
//! the veth pair joining host and namespace, and per-VM tap devices.
//!
//! Guest traffic only ever touches the bridge inside the namespace; the
//! host-side veth carries the gateway address and the subnet route.

use std::os::unix::fs::PermissionsExt;

use tracing::info;

use crate::error::{Error, Result};
use crate::exec::{argv, Exec};
use crate::subnet::Ipv4Cidr;

pub const NETNS: &str = "minivmm";
pub const BRIDGE: &str = "br-minivmm";
pub const VETH_HOST: &str = "minivmm";
pub const VETH_PEER: &str = "minivmm-peer";

pub const IFUP_SCRIPT: &str = "/tmp/ifup";
pub const IFDOWN_SCRIPT: &str = "/tmp/ifdown";

/// QEMU's `script=` hook: move the tap into the namespace and enslave it
/// to the bridge.
const IFUP_CONTENTS: &str = "#!/bin/sh\n\
if_name=$1\n\
ip link set dev $if_name netns minivmm\n\
ip netns exec minivmm ip link set dev $if_name master br-minivmm\n\
ip netns exec minivmm ip link set dev $if_name promisc on\n\
ip netns exec minivmm ip link set dev $if_name up\n";

const IFDOWN_CONTENTS: &str = "#!/bin/sh\n\
if_name=$1\n\
ip netns exec minivmm ip link set dev $if_name down\n\
ip netns exec minivmm ip link set dev $if_name promisc off\n\
ip netns exec minivmm ip link set dev $if_name nomaster\n\
ip netns exec minivmm ip link set dev $if_name netns 1\n";

pub fn tap_name(vm_name: &str) -> String {
    format!("tap-{vm_name}")
}

#[derive(Clone)]
pub struct Network {
    exec: Exec,
    subnet: Option<Ipv4Cidr>,
}

impl Network {
    pub fn new(exec: Exec, subnet: Option<Ipv4Cidr>) -> Self {
        Network { exec, subnet }
    }

    fn subnet(&self) -> Result<Ipv4Cidr> {
        self.subnet
            .ok_or_else(|| Error::invalid("VMM_SUBNET_CIDR is not set"))
    }

    async fn netns_exists(&self) -> bool {
        self.exec.probe(&["ip", "netns", "exec", NETNS, "true"]).await
    }

    async fn link_exists(&self, dev: &str) -> bool {
        self.exec.probe(&["ip", "link", "show", "dev", dev]).await
    }

    async fn link_exists_in_ns(&self, dev: &str) -> bool {
        self.exec
            .probe(&["ip", "netns", "exec", NETNS, "ip", "link", "show", "dev", dev])
            .await
    }

    /// Create the namespace, veth pair, and bridge. Idempotent: each
    /// create step is probed first and skipped when already present.
    pub async fn init_netns(&self) -> Result<()> {
        if !self.netns_exists().await {
            self.exec.run(&["ip", "netns", "add", NETNS]).await?;
        }

        if !self.link_exists(VETH_HOST).await && !self.link_exists_in_ns(VETH_PEER).await {
            self.exec
                .run(&["ip", "link", "add", VETH_HOST, "type", "veth", "peer", "name", VETH_PEER])
                .await?;
            self.exec
                .run(&["ip", "link", "set", "netns", NETNS, "dev", VETH_PEER])
                .await?;
        }

        if !self.link_exists_in_ns(BRIDGE).await {
            self.exec
                .run(&[
                    "ip", "netns", "exec", NETNS, "ip", "link", "add", BRIDGE, "type", "bridge",
                ])
                .await?;
        }

        // Re-enslaving an already-enslaved peer succeeds.
        self.exec
            .run(&[
                "ip", "netns", "exec", NETNS, "ip", "link", "set", "master", BRIDGE, "dev",
                VETH_PEER,
            ])
            .await?;

        info!(netns = NETNS, bridge = BRIDGE, "network namespace ready");
        Ok(())
    }

    /// Bring links up and install addressing. Step failures are logged
    /// but not fatal so repeated starts converge on a configured host.
    pub async fn start_network(&self) -> Result<()> {
        let subnet = self.subnet()?;
        let gw = subnet.gateway().to_string();
        let cidr = subnet.to_string();

        self.exec
            .run_all_ignore_errors(&[
                argv(&["ip", "link", "set", "up", "dev", VETH_HOST]),
                argv(&["ip", "netns", "exec", NETNS, "ip", "link", "set", "up", "dev", VETH_PEER]),
                argv(&[
                    "ip", "netns", "exec", NETNS, "ip", "link", "set", "promisc", "on", "dev",
                    VETH_PEER,
                ]),
                argv(&["ip", "netns", "exec", NETNS, "ip", "link", "set", "up", "dev", BRIDGE]),
                argv(&["ip", "addr", "add", gw.as_str(), "dev", VETH_HOST]),
                argv(&["ip", "route", "add", cidr.as_str(), "dev", VETH_HOST]),
            ])
            .await;

        info!(gateway = %gw, subnet = %cidr, "guest network up");
        Ok(())
    }

    /// Reverse of `init_netns`; tolerates partially torn-down state.
    pub async fn reset_netns(&self) {
        self.exec
            .run_all_ignore_errors(&[
                argv(&[
                    "ip", "netns", "exec", NETNS, "ip", "link", "set", "down", "dev", VETH_PEER,
                ]),
                argv(&["ip", "link", "set", "down", "dev", VETH_HOST]),
                argv(&["ip", "link", "delete", "dev", VETH_HOST]),
                argv(&["ip", "netns", "exec", NETNS, "ip", "link", "delete", BRIDGE]),
                argv(&["ip", "netns", "delete", NETNS]),
            ])
            .await;
    }

    /// Create the tap for a VM in the root namespace; QEMU's ifup script
    /// moves it into the namespace at launch.
    pub async fn prepare_vm_if(&self, vm_name: &str) -> Result<String> {
        let tap = tap_name(vm_name);
        self.exec
            .run(&["ip", "tuntap", "add", "dev", tap.as_str(), "mode", "tap"])
            .await?;
        Ok(tap)
    }

    /// Delete the tap. QEMU may briefly hold a reference after shutdown,
    /// so callers retry on failure.
    pub async fn cleanup_vm_if(&self, vm_name: &str) -> Result<()> {
        let tap = tap_name(vm_name);
        self.exec
            .run(&["ip", "link", "del", "dev", tap.as_str()])
            .await?;
        Ok(())
    }

    /// The tap can live in the root namespace (before launch) or inside
    /// the VM namespace (while QEMU runs).
    pub async fn vm_if_exists(&self, vm_name: &str) -> bool {
        let tap = tap_name(vm_name);
        self.link_exists_in_ns(&tap).await || self.link_exists(&tap).await
    }

    /// Materialize the ifup/ifdown hook scripts QEMU invokes around tap
    /// attach/detach.
    pub fn write_if_scripts(&self) -> Result<()> {
        for (path, contents) in [(IFUP_SCRIPT, IFUP_CONTENTS), (IFDOWN_SCRIPT, IFDOWN_CONTENTS)] {
            std::fs::write(path, contents)
                .map_err(|e| Error::upstream(format!("write {path}"), e))?;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
                .map_err(|e| Error::upstream(format!("chmod {path}"), e))?;
        }
        Ok(())
    }
}
