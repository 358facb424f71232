//! Port forwarding: persistent rules exposing guest ports on
//! host-reachable endpoints.
//!
//! The dataplane is a userspace proxy — one task per rule, TCP via
//! `copy_bidirectional`, UDP via a per-client relay socket. Rules are
//! persisted under `<forward_dir>/<vm>/<id>.json` and reconciled to the
//! dataplane at startup and whenever DHCP teaches us a new guest address.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lockfile;
use crate::store::MetaStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    #[default]
    Tcp,
    Udp,
}

impl FromStr for Proto {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Proto::Tcp),
            "udp" => Ok(Proto::Udp),
            other => Err(Error::invalid(format!("unknown protocol '{other}'"))),
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ForwardRule {
    pub id: String,
    pub vm_name: String,
    pub proto: Proto,
    pub listen_host: String,
    pub listen_port: u16,
    pub guest_port: u16,
    /// Cached guest address; rewritten on every DHCP IP update.
    pub guest_ip: String,
}

impl ForwardRule {
    fn listen_key(&self) -> (Proto, String, u16) {
        (self.proto, self.listen_host.clone(), self.listen_port)
    }
}

pub struct Forwarder {
    forward_dir: PathBuf,
    store: MetaStore,
    /// Live dataplane tasks keyed by rule id.
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Forwarder {
    pub fn new(forward_dir: impl Into<PathBuf>, store: MetaStore) -> Arc<Self> {
        Arc::new(Forwarder {
            forward_dir: forward_dir.into(),
            store,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    fn rule_path(&self, vm_name: &str, id: &str) -> PathBuf {
        self.forward_dir.join(vm_name).join(format!("{id}.json"))
    }

    fn load_all(&self) -> Result<Vec<ForwardRule>> {
        let mut rules = Vec::new();
        let vm_dirs = match std::fs::read_dir(&self.forward_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(rules),
            Err(e) => {
                return Err(Error::upstream(
                    format!("read forward dir {}", self.forward_dir.display()),
                    e,
                ))
            }
        };

        for vm_dir in vm_dirs.filter_map(|e| e.ok()) {
            if !vm_dir.path().is_dir() {
                continue;
            }
            let Ok(entries) = std::fs::read_dir(vm_dir.path()) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match std::fs::read(&path).map_err(anyhow::Error::from).and_then(|b| {
                    serde_json::from_slice::<ForwardRule>(&b).map_err(anyhow::Error::from)
                }) {
                    Ok(rule) => rules.push(rule),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable rule"),
                }
            }
        }
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    fn persist(&self, rule: &ForwardRule) -> Result<()> {
        let dir = self.forward_dir.join(&rule.vm_name);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::upstream(format!("create {}", dir.display()), e))?;
        let bytes = serde_json::to_vec_pretty(rule)
            .map_err(|e| Error::upstream("serialize forward rule", e))?;
        let path = self.rule_path(&rule.vm_name, &rule.id);
        lockfile::write_locked(&path, &bytes)
            .map_err(|e| Error::upstream(format!("write {}", path.display()), e))
    }

    /// Create a rule. The guest address is resolved from current VM
    /// metadata; a rule for a VM without a lease yet is persisted and its
    /// dataplane comes up on the first IP update.
    pub async fn add(
        self: &Arc<Self>,
        vm_name: &str,
        proto: Proto,
        listen_host: &str,
        listen_port: u16,
        guest_port: u16,
    ) -> Result<ForwardRule> {
        let meta = self.store.load(vm_name)?;

        let rule = ForwardRule {
            id: Uuid::new_v4().to_string(),
            vm_name: vm_name.to_string(),
            proto,
            listen_host: listen_host.to_string(),
            listen_port,
            guest_port,
            guest_ip: meta.ip_address.clone(),
        };

        let taken = self
            .load_all()?
            .iter()
            .any(|r| r.listen_key() == rule.listen_key());
        if taken {
            return Err(Error::conflict(format!(
                "{proto} {listen_host}:{listen_port} is already forwarded"
            )));
        }

        self.persist(&rule)?;
        if let Err(e) = self.install(&rule).await {
            // Roll the persisted rule back so add() has no side effects on
            // a dataplane failure (e.g. the listen port is in use).
            let _ = std::fs::remove_file(self.rule_path(&rule.vm_name, &rule.id));
            return Err(e);
        }
        info!(rule = %rule.id, vm = %vm_name, %proto, port = listen_port, "forward rule added");
        Ok(rule)
    }

    /// Remove a rule and its dataplane. Idempotent.
    pub async fn remove(self: &Arc<Self>, rule_id: &str) -> Result<()> {
        if let Some(task) = self.tasks.lock().await.remove(rule_id) {
            task.abort();
        }
        for rule in self.load_all()? {
            if rule.id == rule_id {
                let path = self.rule_path(&rule.vm_name, &rule.id);
                std::fs::remove_file(&path)
                    .map_err(|e| Error::upstream(format!("remove {}", path.display()), e))?;
                info!(rule = %rule_id, "forward rule removed");
            }
        }
        Ok(())
    }

    /// All rules, or those belonging to one VM.
    pub fn list(&self, vm_name: Option<&str>) -> Result<Vec<ForwardRule>> {
        let mut rules = self.load_all()?;
        if let Some(vm) = vm_name {
            rules.retain(|r| r.vm_name == vm);
        }
        Ok(rules)
    }

    /// Retarget every rule of `vm_name` at `new_ip` and refresh their
    /// proxy tasks. Called by the IP-update worker on every DHCP lease.
    pub async fn update_ip(self: &Arc<Self>, vm_name: &str, new_ip: &str) -> Result<()> {
        for mut rule in self.list(Some(vm_name))? {
            if rule.guest_ip == new_ip {
                continue;
            }
            rule.guest_ip = new_ip.to_string();
            self.persist(&rule)?;
            if let Err(e) = self.install(&rule).await {
                warn!(rule = %rule.id, error = %e, "failed to refresh forward dataplane");
            }
        }
        Ok(())
    }

    /// Drop every rule for a VM (called on VM removal).
    pub async fn remove_vm(self: &Arc<Self>, vm_name: &str) -> Result<()> {
        for rule in self.list(Some(vm_name))? {
            if let Some(task) = self.tasks.lock().await.remove(&rule.id) {
                task.abort();
            }
        }
        let dir = self.forward_dir.join(vm_name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::upstream(format!("remove {}", dir.display()), e)),
        }
    }

    /// Bring the dataplane in line with the persisted rules: orphaned
    /// rules (VM gone) are dropped, everything else gets a proxy task.
    pub async fn reconcile(self: &Arc<Self>) -> Result<()> {
        for rule in self.load_all()? {
            if !self.store.exists(&rule.vm_name) {
                warn!(rule = %rule.id, vm = %rule.vm_name, "dropping rule for removed VM");
                let _ = std::fs::remove_file(self.rule_path(&rule.vm_name, &rule.id));
                continue;
            }
            if let Err(e) = self.install(&rule).await {
                warn!(rule = %rule.id, error = %e, "failed to install forward rule");
            }
        }
        Ok(())
    }

    /// (Re)spawn the proxy task for a rule. A rule without a guest
    /// address yet has nothing to proxy to.
    async fn install(self: &Arc<Self>, rule: &ForwardRule) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.remove(&rule.id) {
            task.abort();
        }
        if rule.guest_ip.is_empty() {
            debug!(rule = %rule.id, vm = %rule.vm_name, "no guest IP yet; dataplane deferred");
            return Ok(());
        }

        let listen = format!("{}:{}", rule.listen_host, rule.listen_port);
        let target = format!("{}:{}", rule.guest_ip, rule.guest_port);

        let task = match rule.proto {
            Proto::Tcp => {
                let listener = TcpListener::bind(&listen)
                    .await
                    .map_err(|e| Error::upstream(format!("bind {listen}"), e))?;
                spawn_tcp_proxy(listener, target)
            }
            Proto::Udp => {
                let socket = UdpSocket::bind(&listen)
                    .await
                    .map_err(|e| Error::upstream(format!("bind {listen}"), e))?;
                let target: SocketAddr = target
                    .parse()
                    .map_err(|_| Error::invalid(format!("bad forward target '{target}'")))?;
                spawn_udp_proxy(socket, target)
            }
        };
        tasks.insert(rule.id.clone(), task);
        Ok(())
    }
}

/// Accept loop: every inbound connection gets its own bidirectional copy
/// to the guest.
pub(crate) fn spawn_tcp_proxy(listener: TcpListener, target: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (mut inbound, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "forward accept failed");
                    break;
                }
            };
            let target = target.clone();
            tokio::spawn(async move {
                let mut outbound = match TcpStream::connect(&target).await {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(%peer, %target, error = %e, "guest connect failed");
                        return;
                    }
                };
                let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
            });
        }
    })
}

/// Datagram relay: one upstream socket per client address, replies routed
/// back through the listen socket.
pub(crate) fn spawn_udp_proxy(socket: UdpSocket, target: SocketAddr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let socket = Arc::new(socket);
        let mut upstreams: HashMap<SocketAddr, Arc<UdpSocket>> = HashMap::new();
        let mut buf = [0u8; 65535];
        loop {
            let (len, client) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "forward recv failed");
                    break;
                }
            };

            let upstream = match upstreams.get(&client) {
                Some(u) => u.clone(),
                None => {
                    let Ok(u) = UdpSocket::bind("0.0.0.0:0").await else {
                        continue;
                    };
                    if u.connect(target).await.is_err() {
                        continue;
                    }
                    let u = Arc::new(u);
                    upstreams.insert(client, u.clone());

                    // Reply pump: guest → client.
                    let socket = socket.clone();
                    let reply_upstream = u.clone();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 65535];
                        while let Ok(len) = reply_upstream.recv(&mut buf).await {
                            if socket.send_to(&buf[..len], client).await.is_err() {
                                break;
                            }
                        }
                    });
                    u
                }
            };
            let _ = upstream.send(&buf[..len]).await;
        }
    })
}
