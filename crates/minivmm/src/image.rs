//! qcow2 volume creation and the base-image library.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::exec::Exec;

const MIB: u64 = 1024 * 1024;

/// Parse an SI-prefixed size (`Ki`/`Mi`/`Gi`/`Ti`, or plain bytes).
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, multiplier) = if let Some(v) = s.strip_suffix("Ki") {
        (v, 1024u64)
    } else if let Some(v) = s.strip_suffix("Mi") {
        (v, 1024 * 1024)
    } else if let Some(v) = s.strip_suffix("Gi") {
        (v, 1024 * 1024 * 1024)
    } else if let Some(v) = s.strip_suffix("Ti") {
        (v, 1024 * 1024 * 1024 * 1024)
    } else {
        (s, 1u64)
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| Error::invalid(format!("invalid size '{s}'")))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::invalid(format!("size '{s}' overflows")))
}

/// Convert an SI-prefixed size to mebibytes, rounding up. QEMU's `-m`
/// takes MiB.
pub fn size_to_mib(s: &str) -> Result<u64> {
    let bytes = parse_size(s)?;
    Ok(bytes.div_ceil(MIB))
}

#[derive(Clone)]
pub struct ImageStore {
    image_dir: PathBuf,
    exec: Exec,
}

impl ImageStore {
    pub fn new(image_dir: impl Into<PathBuf>, exec: Exec) -> Self {
        ImageStore {
            image_dir: image_dir.into(),
            exec,
        }
    }

    pub fn base_image_path(&self, image: &str) -> PathBuf {
        self.image_dir.join(format!("{image}.qcow2"))
    }

    /// Names of every base image in the library.
    pub fn list_base_images(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.image_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::upstream(
                    format!("read image dir {}", self.image_dir.display()),
                    e,
                ))
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix(".qcow2").map(str::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// Create `<target_dir>/<name>.qcow2` — a thin clone of `base_image`
    /// when one is named, otherwise a standalone volume of `size`.
    pub async fn create_image(
        &self,
        name: &str,
        size: &str,
        base_image: &str,
        target_dir: &std::path::Path,
    ) -> Result<PathBuf> {
        let dst = target_dir.join(format!("{name}.qcow2"));
        if dst.exists() {
            return Err(Error::conflict(format!(
                "volume '{}' already exists",
                dst.display()
            )));
        }

        let dst_arg = dst.to_string_lossy().into_owned();
        if base_image.is_empty() {
            let bytes = parse_size(size)?.to_string();
            self.exec
                .run(&[
                    "qemu-img",
                    "create",
                    "-f",
                    "qcow2",
                    dst_arg.as_str(),
                    bytes.as_str(),
                ])
                .await?;
        } else {
            let base = self.base_image_path(base_image);
            if !base.exists() {
                return Err(Error::not_found("base image", base_image));
            }
            let base_arg = base.to_string_lossy().into_owned();
            self.exec
                .run(&[
                    "qemu-img",
                    "create",
                    "-f",
                    "qcow2",
                    "-b",
                    base_arg.as_str(),
                    "-F",
                    "qcow2",
                    dst_arg.as_str(),
                ])
                .await?;
        }

        Ok(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeExecutor;

    #[test]
    fn parses_si_sizes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4Ki").unwrap(), 4096);
        assert_eq!(parse_size("512Mi").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("2Ti").unwrap(), 2 * 1024u64.pow(4));
    }

    #[test]
    fn rejects_malformed_sizes() {
        assert!(parse_size("").is_err());
        assert!(parse_size("Gi").is_err());
        assert!(parse_size("10G").is_err());
        assert!(parse_size("-5Gi").is_err());
        assert!(parse_size("ten").is_err());
        assert!(parse_size("999999999999Ti").is_err());
    }

    #[test]
    fn converts_to_mebibytes() {
        assert_eq!(size_to_mib("512Mi").unwrap(), 512);
        assert_eq!(size_to_mib("1Gi").unwrap(), 1024);
        assert_eq!(size_to_mib("1Ki").unwrap(), 1); // rounds up
    }

    #[tokio::test]
    async fn standalone_volume_argv() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::new();
        let store = ImageStore::new(dir.path().join("images"), Exec::new(fake.clone()));

        let path = store
            .create_image("vm1", "10Gi", "", dir.path())
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("vm1.qcow2"));

        let calls = fake.joined_calls();
        let expect = format!(
            "qemu-img create -f qcow2 {} {}",
            path.display(),
            10u64 * 1024 * 1024 * 1024
        );
        assert_eq!(calls, vec![expect]);
    }

    #[tokio::test]
    async fn cloned_volume_uses_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let image_dir = dir.path().join("images");
        std::fs::create_dir_all(&image_dir).unwrap();
        std::fs::write(image_dir.join("ubuntu-22.04.qcow2"), "").unwrap();

        let fake = FakeExecutor::new();
        let store = ImageStore::new(&image_dir, Exec::new(fake.clone()));
        store
            .create_image("vm1", "10Gi", "ubuntu-22.04", dir.path())
            .await
            .unwrap();

        let call = &fake.joined_calls()[0];
        assert!(call.contains("-b"), "{call}");
        assert!(call.contains("ubuntu-22.04.qcow2"), "{call}");
        assert!(call.contains("-F qcow2"), "{call}");
    }

    #[tokio::test]
    async fn unknown_base_image_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path().join("images"), Exec::new(FakeExecutor::new()));
        let err = store
            .create_image("vm1", "10Gi", "missing", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn existing_target_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vm1.qcow2"), "").unwrap();
        let store = ImageStore::new(dir.path().join("images"), Exec::new(FakeExecutor::new()));
        let err = store
            .create_image("vm1", "10Gi", "", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn lists_base_images() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ubuntu-22.04.qcow2"), "").unwrap();
        std::fs::write(dir.path().join("debian-12.qcow2"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let store = ImageStore::new(dir.path(), Exec::new(FakeExecutor::new()));
        assert_eq!(
            store.list_base_images().unwrap(),
            vec!["debian-12", "ubuntu-22.04"]
        );
    }
}
