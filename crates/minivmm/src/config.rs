//! Environment configuration, read once at startup.
//!
//! Missing variables yield empty values; only `VMM_SUBNET_CIDR` is parsed
//! eagerly because the networking substrate cannot run without it.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::subnet::Ipv4Cidr;

pub const ENV_DIR: &str = "VMM_DIR";
pub const ENV_LISTEN_PORT: &str = "VMM_LISTEN_PORT";
pub const ENV_ORIGIN: &str = "VMM_ORIGIN";
pub const ENV_OIDC_URL: &str = "VMM_OIDC_URL";
pub const ENV_AGENTS: &str = "VMM_AGENTS";
pub const ENV_CORS_ORIGINS: &str = "VMM_CORS_ALLOWED_ORIGINS";
pub const ENV_SUBNET_CIDR: &str = "VMM_SUBNET_CIDR";
pub const ENV_NAME_SERVERS: &str = "VMM_NAME_SERVERS";
pub const ENV_SERVER_CERT: &str = "VMM_SERVER_CERT";
pub const ENV_SERVER_KEY: &str = "VMM_SERVER_KEY";
pub const ENV_NO_TLS: &str = "VMM_NO_TLS";
pub const ENV_NO_AUTH: &str = "VMM_NO_AUTH";
pub const ENV_NO_KVM: &str = "VMM_NO_KVM";
pub const ENV_VNC_KEYBOARD_LAYOUT: &str = "VMM_VNC_KEYBOARD_LAYOUT";
pub const ENV_DHCP_LEASE_TTL: &str = "VMM_DHCP_LEASE_TTL";

const DEFAULT_LEASE_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    /// State root (`VMM_DIR`).
    pub dir: PathBuf,
    /// `<dir>/vms` — one subdirectory per VM.
    pub vm_dir: PathBuf,
    /// `<dir>/images` — base image library.
    pub image_dir: PathBuf,
    /// `<dir>/forwards` — persisted forwarder rules.
    pub forward_dir: PathBuf,

    /// Guest network CIDR; `None` until `VMM_SUBNET_CIDR` is set.
    pub subnet: Option<Ipv4Cidr>,
    /// DNS servers handed to guests via DHCP.
    pub name_servers: Vec<Ipv4Addr>,
    /// DHCP lease TTL.
    pub lease_ttl: Duration,

    /// Federation peers; proxied to by the external HTTP layer.
    pub agents: Vec<String>,

    /// Disable KVM acceleration (`VMM_NO_KVM` non-empty).
    pub no_kvm: bool,
    /// QEMU `-k` keyboard layout.
    pub vnc_keyboard_layout: String,

    // Consumed by the external HTTP layer only; carried here so the whole
    // environment is read in one place.
    pub listen_port: String,
    pub origin: String,
    pub oidc_url: String,
    pub cors_allowed_origins: Vec<String>,
    pub server_cert: String,
    pub server_key: String,
    pub no_tls: bool,
    pub no_auth: bool,
}

fn env_or_empty(key: &str) -> String {
    std::env::var(key).unwrap_or_default()
}

fn env_list(key: &str) -> Vec<String> {
    env_or_empty(key)
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        let dir = PathBuf::from(env_or_empty(ENV_DIR));

        let subnet = {
            let raw = env_or_empty(ENV_SUBNET_CIDR);
            if raw.is_empty() {
                None
            } else {
                match raw.parse::<Ipv4Cidr>() {
                    Ok(c) => Some(c),
                    Err(e) => {
                        tracing::warn!(cidr = %raw, error = %e, "ignoring unparsable {ENV_SUBNET_CIDR}");
                        None
                    }
                }
            }
        };

        let name_servers = env_list(ENV_NAME_SERVERS)
            .iter()
            .filter_map(|s| match s.parse::<Ipv4Addr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    tracing::warn!(server = %s, "ignoring unparsable name server");
                    None
                }
            })
            .collect();

        let lease_ttl = env_or_empty(ENV_DHCP_LEASE_TTL)
            .parse::<u64>()
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_LEASE_TTL_SECS));

        let layout = {
            let v = env_or_empty(ENV_VNC_KEYBOARD_LAYOUT);
            if v.is_empty() {
                "en-us".to_string()
            } else {
                v
            }
        };

        Config {
            vm_dir: dir.join("vms"),
            image_dir: dir.join("images"),
            forward_dir: dir.join("forwards"),
            dir,
            subnet,
            name_servers,
            lease_ttl,
            agents: env_list(ENV_AGENTS),
            no_kvm: !env_or_empty(ENV_NO_KVM).is_empty(),
            vnc_keyboard_layout: layout,
            listen_port: env_or_empty(ENV_LISTEN_PORT),
            origin: env_or_empty(ENV_ORIGIN),
            oidc_url: env_or_empty(ENV_OIDC_URL),
            cors_allowed_origins: env_list(ENV_CORS_ORIGINS),
            server_cert: env_or_empty(ENV_SERVER_CERT),
            server_key: env_or_empty(ENV_SERVER_KEY),
            no_tls: !env_or_empty(ENV_NO_TLS).is_empty(),
            no_auth: !env_or_empty(ENV_NO_AUTH).is_empty(),
        }
    }

    /// Build a config rooted at an explicit directory, for tests and
    /// embedding. Networking fields start empty.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Config {
            vm_dir: dir.join("vms"),
            image_dir: dir.join("images"),
            forward_dir: dir.join("forwards"),
            dir,
            subnet: None,
            name_servers: Vec::new(),
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            agents: Vec::new(),
            no_kvm: false,
            vnc_keyboard_layout: "en-us".to_string(),
            listen_port: String::new(),
            origin: String::new(),
            oidc_url: String::new(),
            cors_allowed_origins: Vec::new(),
            server_cert: String::new(),
            server_key: String::new(),
            no_tls: false,
            no_auth: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_hang_off_dir() {
        let cfg = Config::with_dir("/var/lib/minivmm");
        assert_eq!(cfg.vm_dir, PathBuf::from("/var/lib/minivmm/vms"));
        assert_eq!(cfg.image_dir, PathBuf::from("/var/lib/minivmm/images"));
        assert_eq!(cfg.forward_dir, PathBuf::from("/var/lib/minivmm/forwards"));
    }

    #[test]
    fn default_lease_ttl_is_a_day() {
        let cfg = Config::with_dir("/tmp/x");
        assert_eq!(cfg.lease_ttl, Duration::from_secs(86400));
    }
}
