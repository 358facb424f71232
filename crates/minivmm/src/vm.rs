//! VM lifecycle orchestration: create, start, stop, resize, lock,
//! volumes, remove, and the DHCP-fed IP-update worker.
//!
//! The supervisor is the sole writer of VM metadata; every other
//! subsystem reads it or feeds events back here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::dhcp::IpUpdate;
use crate::error::{Error, Result};
use crate::exec::Exec;
use crate::forward::Forwarder;
use crate::image::{self, ImageStore};
use crate::network::Network;
use crate::qemu;
use crate::qmp::QmpClient;
use crate::store::{validate_name, ExtraVolume, MetaStore, VmMetadata, VmStatus};

const MAX_EXTRA_VOLUMES: usize = 256;
const TAP_CLEANUP_RETRIES: u32 = 30;
const TAP_CLEANUP_INTERVAL: Duration = Duration::from_secs(3);

const USER_DATA_FILE: &str = "user-data";
const META_DATA_FILE: &str = "meta-data";
const CLOUD_INIT_ISO_FILE: &str = "cloud-init.iso";

#[derive(Debug, Clone, Default)]
pub struct CreateParams {
    pub name: String,
    pub owner: String,
    pub image: String,
    pub cpu: String,
    pub memory: String,
    pub disk: String,
    pub user_data: String,
    pub tag: String,
}

pub struct VmManager {
    cfg: Arc<Config>,
    exec: Exec,
    store: MetaStore,
    images: ImageStore,
    network: Network,
    forwarder: Arc<Forwarder>,
}

impl VmManager {
    pub fn new(cfg: Arc<Config>, exec: Exec) -> Arc<Self> {
        let store = MetaStore::new(&cfg.vm_dir);
        let images = ImageStore::new(&cfg.image_dir, exec.clone());
        let network = Network::new(exec.clone(), cfg.subnet);
        let forwarder = Forwarder::new(&cfg.forward_dir, store.clone());
        Arc::new(VmManager {
            cfg,
            exec,
            store,
            images,
            network,
            forwarder,
        })
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    fn vm_dir(&self, name: &str) -> PathBuf {
        self.store.vm_dir(name)
    }

    // ── Create ────────────────────────────────────────────────────────────

    /// Create a VM and start it. On any failure after the VM directory
    /// exists, the directory is removed again; cleanup errors are logged
    /// and ignored.
    pub async fn create(&self, params: CreateParams) -> Result<VmMetadata> {
        let name = params.name.clone();
        validate_name(&name)?;
        validate_cpu(&params.cpu)?;
        image::parse_size(&params.memory)?;
        image::parse_size(&params.disk)?;

        if self.store.exists(&name) {
            return Err(Error::conflict(format!("VM '{name}' already exists")));
        }

        let result = self.create_inner(&params).await;
        if let Err(e) = result {
            info!(vm = %name, error = %e, "create failed, rolling back");
            if let Err(rm) = self.store.remove_all(&name) {
                warn!(vm = %name, error = %rm, "ignoring rollback cleanup failure");
            }
            if let Err(tap) = self.network.cleanup_vm_if(&name).await {
                warn!(vm = %name, error = %tap, "ignoring rollback tap cleanup failure");
            }
            return Err(e);
        }

        self.get(&name).await
    }

    async fn create_inner(&self, params: &CreateParams) -> Result<()> {
        let name = &params.name;
        let vm_dir = self.vm_dir(name);
        std::fs::create_dir_all(&vm_dir)
            .map_err(|e| Error::upstream(format!("create VM dir {}", vm_dir.display()), e))?;

        let volume = self
            .images
            .create_image(name, &params.disk, &params.image, &vm_dir)
            .await?;

        let iso = self
            .create_cloud_init_iso(&vm_dir, name, &params.user_data)
            .await?;

        let meta = VmMetadata {
            name: name.clone(),
            owner: params.owner.clone(),
            image: params.image.clone(),
            arch: std::env::consts::ARCH.to_string(),
            volume: volume.to_string_lossy().to_string(),
            mac_address: generate_mac_address(),
            ip_address: String::new(),
            cpu: params.cpu.clone(),
            memory: params.memory.clone(),
            disk: params.disk.clone(),
            tag: params.tag.clone(),
            lock: false,
            vnc_password: generate_vnc_password(),
            vnc_port: String::new(),
            user_data: params.user_data.clone(),
            cloud_init_iso: iso.to_string_lossy().to_string(),
            extra_volumes: Vec::new(),
            status: VmStatus::Stopped,
        };
        self.store.save(name, &meta)?;

        self.start(name).await?;
        Ok(())
    }

    /// Write `user-data` and `meta-data` into the VM directory and build
    /// the `cidata` seed ISO cloud-init discovers on first boot.
    async fn create_cloud_init_iso(
        &self,
        vm_dir: &std::path::Path,
        name: &str,
        user_data: &str,
    ) -> Result<PathBuf> {
        let user_data_path = vm_dir.join(USER_DATA_FILE);
        std::fs::write(&user_data_path, user_data)
            .map_err(|e| Error::upstream(format!("write {}", user_data_path.display()), e))?;

        let meta_data_path = vm_dir.join(META_DATA_FILE);
        std::fs::write(&meta_data_path, format!("local-hostname: {name}"))
            .map_err(|e| Error::upstream(format!("write {}", meta_data_path.display()), e))?;

        let iso = vm_dir.join(CLOUD_INIT_ISO_FILE);
        let iso_arg = iso.to_string_lossy().into_owned();
        let user_data_arg = user_data_path.to_string_lossy().into_owned();
        let meta_data_arg = meta_data_path.to_string_lossy().into_owned();
        self.exec
            .run(&[
                "genisoimage",
                "-output",
                iso_arg.as_str(),
                "-volid",
                "cidata",
                "-joliet",
                "-rock",
                user_data_arg.as_str(),
                meta_data_arg.as_str(),
            ])
            .await?;
        Ok(iso)
    }

    // ── Start / stop ──────────────────────────────────────────────────────

    /// Launch QEMU for a stopped VM and record the VNC port it reports.
    pub async fn start(&self, name: &str) -> Result<VmMetadata> {
        let mut meta = self.store.load(name)?;

        let status = self.status(name).await;
        if status != VmStatus::Stopped {
            return Err(Error::conflict(format!(
                "cannot start VM '{name}' in state '{status}'"
            )));
        }

        self.network.write_if_scripts()?;
        if !self.network.vm_if_exists(name).await {
            self.network.prepare_vm_if(name).await?;
        }

        let vm_dir = self.vm_dir(name);
        qemu::launch(
            &self.exec,
            &meta,
            &vm_dir,
            self.cfg.no_kvm,
            &self.cfg.vnc_keyboard_layout,
        )
        .await?;

        let mut qmp = QmpClient::connect(&qemu::qmp_socket_path(&vm_dir)).await?;
        meta.vnc_port = qmp.query_vnc_port().await?;
        drop(qmp);

        self.store.save(name, &meta)?;
        info!(vm = %name, vnc_port = %meta.vnc_port, "VM started");

        meta.status = VmStatus::Running;
        Ok(meta)
    }

    /// Graceful shutdown: `system_powerdown` under its deadline,
    /// escalating to `quit`; then close the session and await the
    /// disconnect signal. Stopping a stopped VM is a no-op.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.store.load(name)?;

        if self.status(name).await == VmStatus::Stopped {
            return Ok(());
        }

        let vm_dir = self.vm_dir(name);
        let mut qmp = QmpClient::connect(&qemu::qmp_socket_path(&vm_dir)).await?;

        if let Err(e) = qmp.system_powerdown().await {
            warn!(vm = %name, error = %e, "powerdown failed, escalating to quit");
            qmp.quit().await?;
        }

        let disconnected = qmp.into_disconnect_signal();
        if tokio::time::timeout(crate::qmp::COMMAND_DEADLINE, disconnected)
            .await
            .is_err()
        {
            warn!(vm = %name, "QMP session did not close in time");
        }

        // A fresh port is assigned on the next start.
        if let Ok(mut meta) = self.store.load(name) {
            meta.vnc_port = String::new();
            self.store.save(name, &meta)?;
        }

        info!(vm = %name, "VM stopped");
        Ok(())
    }

    // ── Status ────────────────────────────────────────────────────────────

    /// Freshly derived state: no QMP connection means no QEMU
    /// (`stopped`); a connected-but-failing QMP is `unknown`.
    pub async fn status(&self, name: &str) -> VmStatus {
        let socket = qemu::qmp_socket_path(&self.vm_dir(name));
        let mut qmp = match QmpClient::connect(&socket).await {
            Ok(q) => q,
            Err(_) => return VmStatus::Stopped,
        };
        match qmp.query_status().await {
            Ok(s) => VmStatus::from_qmp(&s),
            Err(e) => {
                warn!(vm = %name, error = %e, "query-status failed");
                VmStatus::Unknown
            }
        }
    }

    pub async fn get(&self, name: &str) -> Result<VmMetadata> {
        let mut meta = self.store.load(name)?;
        meta.status = self.status(name).await;
        Ok(meta)
    }

    /// Every VM with its live status overlaid. Per-VM load errors were
    /// already skipped by the store.
    pub async fn list(&self) -> Result<Vec<VmMetadata>> {
        let mut vms = self.store.list()?;
        for meta in &mut vms {
            meta.status = self.status(&meta.name).await;
        }
        Ok(vms)
    }

    pub async fn get_by_mac(&self, mac: &str) -> Result<VmMetadata> {
        self.list()
            .await?
            .into_iter()
            .find(|m| m.mac_address == mac)
            .ok_or_else(|| Error::not_found("VM with MAC", mac))
    }

    // ── Mutations ─────────────────────────────────────────────────────────

    /// Metadata-only resize; non-empty fields overwrite and take effect
    /// at the next start.
    pub async fn resize(
        &self,
        name: &str,
        cpu: Option<&str>,
        memory: Option<&str>,
        disk: Option<&str>,
    ) -> Result<VmMetadata> {
        let mut meta = self.store.load(name)?;

        if let Some(cpu) = cpu.filter(|s| !s.is_empty()) {
            validate_cpu(cpu)?;
            meta.cpu = cpu.to_string();
        }
        if let Some(memory) = memory.filter(|s| !s.is_empty()) {
            image::parse_size(memory)?;
            meta.memory = memory.to_string();
        }
        if let Some(disk) = disk.filter(|s| !s.is_empty()) {
            image::parse_size(disk)?;
            meta.disk = disk.to_string();
        }

        self.store.save(name, &meta)?;
        Ok(meta)
    }

    pub async fn lock(&self, name: &str) -> Result<VmMetadata> {
        self.set_lock(name, true).await
    }

    pub async fn unlock(&self, name: &str) -> Result<VmMetadata> {
        self.set_lock(name, false).await
    }

    async fn set_lock(&self, name: &str, lock: bool) -> Result<VmMetadata> {
        let mut meta = self.store.load(name)?;
        meta.lock = lock;
        self.store.save(name, &meta)?;
        Ok(meta)
    }

    /// Attach a new qcow2 under the lowest unused `extra-volume<n>` name.
    pub async fn add_volume(&self, name: &str, size: &str) -> Result<VmMetadata> {
        let mut meta = self.store.load(name)?;
        image::parse_size(size)?;

        let vol_name = (1..=MAX_EXTRA_VOLUMES)
            .map(|i| format!("extra-volume{i}"))
            .find(|candidate| !meta.extra_volumes.iter().any(|v| v.name == *candidate))
            .ok_or_else(|| {
                Error::conflict(format!(
                    "maximum number of extra volumes ({MAX_EXTRA_VOLUMES}) reached"
                ))
            })?;

        let vm_dir = self.vm_dir(name);
        let path = self.images.create_image(&vol_name, size, "", &vm_dir).await?;

        meta.extra_volumes.push(ExtraVolume {
            name: vol_name.clone(),
            path: path.to_string_lossy().to_string(),
            size: size.to_string(),
        });

        if let Err(e) = self.store.save(name, &meta) {
            // Keep volume files and metadata in agreement.
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        info!(vm = %name, volume = %vol_name, %size, "extra volume added");
        Ok(meta)
    }

    /// Detach and delete an extra volume. Rejected while the VM is locked.
    pub async fn remove_volume(&self, name: &str, vol_name: &str) -> Result<VmMetadata> {
        let mut meta = self.store.load(name)?;
        if meta.lock {
            return Err(Error::conflict(format!("VM '{name}' is locked")));
        }

        let idx = meta
            .extra_volumes
            .iter()
            .position(|v| v.name == vol_name)
            .ok_or_else(|| Error::not_found("volume", vol_name))?;

        let removed = meta.extra_volumes.remove(idx);
        if let Err(e) = std::fs::remove_file(&removed.path) {
            warn!(vm = %name, volume = %vol_name, error = %e, "ignoring volume file removal failure");
        }
        self.store.save(name, &meta)?;

        info!(vm = %name, volume = %vol_name, "extra volume removed");
        Ok(meta)
    }

    // ── Remove ────────────────────────────────────────────────────────────

    /// Stop the VM, tear down its tap (QEMU can hold a reference briefly,
    /// hence the bounded retry), remove the directory, and purge its
    /// forwarder rules.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let meta = self.store.load(name)?;
        if meta.lock {
            return Err(Error::conflict(format!("VM '{name}' is locked")));
        }

        self.stop(name).await?;

        if self.network.vm_if_exists(name).await {
            let mut attempt = 0u32;
            loop {
                match self.network.cleanup_vm_if(name).await {
                    Ok(()) => break,
                    Err(_) if attempt < TAP_CLEANUP_RETRIES => {
                        attempt += 1;
                        tokio::time::sleep(TAP_CLEANUP_INTERVAL).await;
                    }
                    Err(_) => return Err(Error::timeout(format!("tap deletion for VM '{name}'"))),
                }
            }
        }

        self.store.remove_all(name)?;
        self.forwarder.remove_vm(name).await?;

        info!(vm = %name, "VM removed");
        Ok(())
    }

    // ── IP updates ────────────────────────────────────────────────────────

    /// Long-lived consumer of the DHCP lease channel: records each learned
    /// address in metadata and retargets the VM's forwarder rules.
    /// Per-event failures are logged and skipped; the loop never ends
    /// while the responder holds the sender.
    pub async fn ip_address_update_worker(self: Arc<Self>, mut updates: mpsc::Receiver<IpUpdate>) {
        while let Some(update) = updates.recv().await {
            let mut meta = match self.get_by_mac(&update.mac).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(mac = %update.mac, error = %e, "ignoring lease for unknown MAC");
                    continue;
                }
            };

            let ip = update.ip.to_string();
            if meta.ip_address != ip {
                meta.ip_address = ip.clone();
                if let Err(e) = self.store.save(&meta.name, &meta) {
                    warn!(vm = %meta.name, error = %e, "failed to record learned IP");
                    continue;
                }
                info!(vm = %meta.name, %ip, "IP address learned via DHCP");
            }

            if let Err(e) = self.forwarder.update_ip(&meta.name, &ip).await {
                warn!(vm = %meta.name, error = %e, "failed to retarget forwarder rules");
            }
        }
    }
}

fn validate_cpu(cpu: &str) -> Result<()> {
    match cpu.parse::<u32>() {
        Ok(n) if n >= 1 => Ok(()),
        _ => Err(Error::invalid(format!("invalid vCPU count '{cpu}'"))),
    }
}

/// Locally-administered MAC: the `52:54:00` vendor prefix plus 24 random
/// bits. Collisions are negligible at the supported scale.
fn generate_mac_address() -> String {
    let mut rng = rand::thread_rng();
    let suffix: [u8; 3] = rng.gen();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        suffix[0], suffix[1], suffix[2]
    )
}

/// 8 random bytes, URL-safe base64 without padding (11 characters).
fn generate_vnc_password() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 8] = rng.gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeExecutor;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    struct Harness {
        _dir: tempfile::TempDir,
        fake: Arc<FakeExecutor>,
        mgr: Arc<VmManager>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::with_dir(dir.path());
        cfg.subnet = Some("192.168.100.0/24".parse().unwrap());
        let fake = FakeExecutor::new();
        let mgr = VmManager::new(Arc::new(cfg), Exec::new(fake.clone()));
        Harness {
            _dir: dir,
            fake,
            mgr,
        }
    }

    fn params(name: &str) -> CreateParams {
        CreateParams {
            name: name.to_string(),
            owner: "alice".to_string(),
            image: "ubuntu-22.04".to_string(),
            cpu: "2".to_string(),
            memory: "1Gi".to_string(),
            disk: "10Gi".to_string(),
            user_data: "#cloud-config\nhostname: vm1\n".to_string(),
            tag: "dev".to_string(),
        }
    }

    fn seed_base_image(mgr: &VmManager, image: &str) {
        let path = mgr.images().base_image_path(image);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    /// Answer QMP sessions forever with canned replies per command.
    fn spawn_qmp_server(socket: PathBuf) -> tokio::task::JoinHandle<()> {
        std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                let greeting = r#"{"QMP":{"version":{"qemu":{"major":8,"minor":2,"micro":0}},"capabilities":[]}}"#;
                if write_half
                    .write_all(format!("{greeting}\n").as_bytes())
                    .await
                    .is_err()
                {
                    continue;
                }
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let reply = if line.contains("query-status") {
                        "{\"return\":{\"status\":\"running\",\"running\":true}}\n"
                    } else if line.contains("query-vnc") {
                        "{\"return\":{\"enabled\":true,\"service\":\"5901\"}}\n"
                    } else if line.contains("system_powerdown") {
                        "{\"error\":{\"class\":\"GenericError\",\"desc\":\"no power button\"}}\n"
                    } else {
                        "{\"return\":{}}\n"
                    };
                    if write_half.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                    if line.contains("\"quit\"") {
                        break;
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn create_provisions_everything() {
        let h = harness();
        seed_base_image(&h.mgr, "ubuntu-22.04");
        let vm_dir = h.mgr.store().vm_dir("vm1");

        // No tap exists yet, so start must create one.
        h.fake.fail("link show dev tap-vm1", "");

        // The fake QMP endpoint appears exactly when "QEMU" launches, so
        // the pre-launch status check still reads `stopped`.
        let socket = qemu::qmp_socket_path(&vm_dir);
        h.fake.on_command("qemu-system", move || {
            spawn_qmp_server(socket.clone());
        });

        let meta = h.mgr.create(params("vm1")).await.unwrap();

        assert_eq!(meta.name, "vm1");
        assert_eq!(meta.owner, "alice");
        assert!(meta.mac_address.starts_with("52:54:00:"), "{}", meta.mac_address);
        assert_eq!(meta.vnc_password.len(), 11);
        assert_eq!(meta.vnc_port, "5901");
        assert_eq!(meta.status, VmStatus::Running);

        assert!(h.mgr.store().metadata_path("vm1").exists());
        assert!(vm_dir.join("user-data").exists());
        assert_eq!(
            std::fs::read_to_string(vm_dir.join("meta-data")).unwrap(),
            "local-hostname: vm1"
        );

        let calls = h.fake.joined_calls();
        assert!(calls.iter().any(|c| c.starts_with("qemu-img create -f qcow2 -b")));
        assert!(calls.iter().any(|c| c.starts_with("genisoimage -output")));
        assert!(calls
            .iter()
            .any(|c| c.starts_with(&format!("qemu-system-{}", std::env::consts::ARCH))));
        assert!(calls.iter().any(|c| c == "ip tuntap add dev tap-vm1 mode tap"));
    }

    #[tokio::test]
    async fn create_existing_name_conflicts_without_side_effects() {
        let h = harness();
        let meta = VmMetadata {
            name: "vm1".to_string(),
            ..Default::default()
        };
        h.mgr.store().save("vm1", &meta).unwrap();

        let err = h.mgr.create(params("vm1")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        // The original metadata survives untouched.
        assert!(h.mgr.store().load("vm1").is_ok());
        assert!(h.fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_failure_rolls_back_directory() {
        let h = harness();
        seed_base_image(&h.mgr, "ubuntu-22.04");
        h.fake.fail("genisoimage", "mkisofs exploded");

        let err = h.mgr.create(params("vm1")).await.unwrap_err();
        assert!(matches!(err, Error::Upstream { .. }));
        assert!(!h.mgr.store().vm_dir("vm1").exists());
    }

    #[tokio::test]
    async fn create_rejects_bad_parameters() {
        let h = harness();
        let mut p = params("bad cpu");
        p.name = "vm1".to_string();
        p.cpu = "zero".to_string();
        assert!(matches!(h.mgr.create(p).await.unwrap_err(), Error::Invalid(_)));

        let mut p = params("vm1");
        p.memory = "1G".to_string();
        assert!(matches!(h.mgr.create(p).await.unwrap_err(), Error::Invalid(_)));

        let mut p = params("vm/1");
        p.cpu = "2".to_string();
        assert!(matches!(h.mgr.create(p).await.unwrap_err(), Error::Invalid(_)));
    }

    #[tokio::test]
    async fn stop_on_stopped_vm_is_a_noop() {
        let h = harness();
        let meta = VmMetadata {
            name: "vm1".to_string(),
            ..Default::default()
        };
        h.mgr.store().save("vm1", &meta).unwrap();

        // No QMP socket: status derives to stopped, stop succeeds.
        h.mgr.stop("vm1").await.unwrap();
        assert!(matches!(
            h.mgr.stop("ghost").await.unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn stop_escalates_powerdown_to_quit() {
        let h = harness();
        let meta = VmMetadata {
            name: "vm1".to_string(),
            ..Default::default()
        };
        h.mgr.store().save("vm1", &meta).unwrap();
        let _qmp = spawn_qmp_server(qemu::qmp_socket_path(&h.mgr.store().vm_dir("vm1")));

        // The canned server rejects system_powerdown, so stop must fall
        // back to quit and still succeed.
        h.mgr.stop("vm1").await.unwrap();
    }

    #[tokio::test]
    async fn status_overlay_distinguishes_running_and_stopped() {
        let h = harness();
        for name in ["up", "down"] {
            let meta = VmMetadata {
                name: name.to_string(),
                mac_address: format!("52:54:00:00:00:0{}", if name == "up" { 1 } else { 2 }),
                ..Default::default()
            };
            h.mgr.store().save(name, &meta).unwrap();
        }
        let _qmp = spawn_qmp_server(qemu::qmp_socket_path(&h.mgr.store().vm_dir("up")));

        let vms = h.mgr.list().await.unwrap();
        let by_name: std::collections::HashMap<_, _> =
            vms.into_iter().map(|m| (m.name.clone(), m)).collect();
        assert_eq!(by_name["up"].status, VmStatus::Running);
        assert_eq!(by_name["down"].status, VmStatus::Stopped);

        let found = h.mgr.get_by_mac("52:54:00:00:00:02").await.unwrap();
        assert_eq!(found.name, "down");
        assert!(h.mgr.get_by_mac("52:54:00:ff:ff:ff").await.is_err());
    }

    #[tokio::test]
    async fn resize_overwrites_only_given_fields() {
        let h = harness();
        let meta = VmMetadata {
            name: "vm1".to_string(),
            cpu: "2".to_string(),
            memory: "1Gi".to_string(),
            disk: "10Gi".to_string(),
            ..Default::default()
        };
        h.mgr.store().save("vm1", &meta).unwrap();

        let updated = h
            .mgr
            .resize("vm1", Some("4"), None, Some("20Gi"))
            .await
            .unwrap();
        assert_eq!(updated.cpu, "4");
        assert_eq!(updated.memory, "1Gi");
        assert_eq!(updated.disk, "20Gi");

        assert!(matches!(
            h.mgr.resize("vm1", None, Some("lots"), None).await.unwrap_err(),
            Error::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn lock_gates_destructive_operations() {
        let h = harness();
        let meta = VmMetadata {
            name: "vm1".to_string(),
            extra_volumes: vec![ExtraVolume {
                name: "extra-volume1".to_string(),
                path: "/nonexistent/extra-volume1.qcow2".to_string(),
                size: "5Gi".to_string(),
            }],
            ..Default::default()
        };
        h.mgr.store().save("vm1", &meta).unwrap();

        let locked = h.mgr.lock("vm1").await.unwrap();
        assert!(locked.lock);

        assert!(matches!(
            h.mgr.remove("vm1").await.unwrap_err(),
            Error::Conflict(_)
        ));
        assert!(matches!(
            h.mgr.remove_volume("vm1", "extra-volume1").await.unwrap_err(),
            Error::Conflict(_)
        ));
        // Still present after the rejected remove.
        assert!(h.mgr.store().exists("vm1"));

        let unlocked = h.mgr.unlock("vm1").await.unwrap();
        assert!(!unlocked.lock);
        h.mgr.remove("vm1").await.unwrap();
        assert!(!h.mgr.store().vm_dir("vm1").exists());
    }

    #[tokio::test]
    async fn add_volume_picks_lowest_unused_name() {
        let h = harness();
        let meta = VmMetadata {
            name: "vm1".to_string(),
            extra_volumes: vec![
                ExtraVolume {
                    name: "extra-volume1".to_string(),
                    path: "p1".to_string(),
                    size: "1Gi".to_string(),
                },
                ExtraVolume {
                    name: "extra-volume3".to_string(),
                    path: "p3".to_string(),
                    size: "1Gi".to_string(),
                },
            ],
            ..Default::default()
        };
        h.mgr.store().save("vm1", &meta).unwrap();

        let updated = h.mgr.add_volume("vm1", "5Gi").await.unwrap();
        let names: Vec<_> = updated.extra_volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["extra-volume1", "extra-volume3", "extra-volume2"]);
        assert!(updated.extra_volumes[2].path.ends_with("extra-volume2.qcow2"));
        assert_eq!(updated.extra_volumes[2].size, "5Gi");
    }

    #[tokio::test]
    async fn add_volume_enforces_the_cap() {
        let h = harness();
        let meta = VmMetadata {
            name: "vm1".to_string(),
            extra_volumes: (1..=256)
                .map(|i| ExtraVolume {
                    name: format!("extra-volume{i}"),
                    path: format!("p{i}"),
                    size: "1Gi".to_string(),
                })
                .collect(),
            ..Default::default()
        };
        h.mgr.store().save("vm1", &meta).unwrap();

        let err = h.mgr.add_volume("vm1", "1Gi").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(err.to_string().contains("maximum"), "{err}");
    }

    #[tokio::test]
    async fn add_then_remove_volume_restores_the_list() {
        let h = harness();
        let meta = VmMetadata {
            name: "vm1".to_string(),
            ..Default::default()
        };
        h.mgr.store().save("vm1", &meta).unwrap();

        let added = h.mgr.add_volume("vm1", "5Gi").await.unwrap();
        assert_eq!(added.extra_volumes.len(), 1);
        let vol_name = added.extra_volumes[0].name.clone();
        assert_eq!(vol_name, "extra-volume1");

        let removed = h.mgr.remove_volume("vm1", &vol_name).await.unwrap();
        assert!(removed.extra_volumes.is_empty());
        assert!(matches!(
            h.mgr.remove_volume("vm1", &vol_name).await.unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn remove_purges_forwarder_rules() {
        let h = harness();
        let meta = VmMetadata {
            name: "vm1".to_string(),
            ip_address: String::new(),
            ..Default::default()
        };
        h.mgr.store().save("vm1", &meta).unwrap();
        h.mgr
            .forwarder()
            .add("vm1", crate::forward::Proto::Tcp, "127.0.0.1", 0, 80)
            .await
            .unwrap();

        h.mgr.remove("vm1").await.unwrap();
        assert!(h.mgr.forwarder().list(None).unwrap().is_empty());
        assert!(!h.mgr.store().vm_dir("vm1").exists());
    }

    #[tokio::test]
    async fn ip_update_worker_records_address_and_retargets_rules() {
        let h = harness();
        let meta = VmMetadata {
            name: "vm1".to_string(),
            mac_address: "52:54:00:aa:bb:cc".to_string(),
            ..Default::default()
        };
        h.mgr.store().save("vm1", &meta).unwrap();
        h.mgr
            .forwarder()
            .add("vm1", crate::forward::Proto::Tcp, "127.0.0.1", 0, 80)
            .await
            .unwrap();

        let (tx, rx) = crate::dhcp::update_channel();
        let worker = tokio::spawn(h.mgr.clone().ip_address_update_worker(rx));

        // An event for an unknown MAC is skipped, not fatal.
        tx.send(IpUpdate {
            mac: "52:54:00:00:00:ff".to_string(),
            ip: "192.168.100.9".parse().unwrap(),
        })
        .await
        .unwrap();
        tx.send(IpUpdate {
            mac: "52:54:00:aa:bb:cc".to_string(),
            ip: "192.168.100.1".parse().unwrap(),
        })
        .await
        .unwrap();

        // The channel has capacity 1: once the second send completes the
        // worker has consumed the first. Poll briefly for the effect.
        let mut recorded = false;
        for _ in 0..100 {
            if h.mgr.store().load("vm1").unwrap().ip_address == "192.168.100.1" {
                recorded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(recorded, "worker never recorded the learned IP");

        let rules = h.mgr.forwarder().list(Some("vm1")).unwrap();
        assert_eq!(rules[0].guest_ip, "192.168.100.1");

        drop(tx);
        worker.await.unwrap();
    }
}
