//! Squashfs tooling contract
//!
//! The core needs exactly two platform operations: pack a directory tree
//! into a squashfs file, and read a squashfs file as a read-only
//! filesystem. Both are fulfilled by the `mksquashfs`/`unsquashfs`
//! binaries; capability probing decides at startup whether the squashfs
//! compressor is usable at all.

use crate::error::{Result, TransmitError};
use crate::squashfs::tarsplit::sanitize_member_path;
use log::{debug, info};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// Pack/unpack contract over squashfs images.
pub trait SquashTooling: Send + Sync {
    fn pack(&self, dir: &Path, fs_file: &Path) -> Result<()>;
    fn unpack(&self, fs_file: &Path, dir: &Path) -> Result<()>;
}

/// Read-only view into a layer filesystem.
pub trait LayerFs: Send + Sync {
    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>>;
    fn exists(&self, name: &str) -> bool;
}

/// Shell-out implementation over the squashfs-tools binaries.
pub struct CommandTooling;

impl CommandTooling {
    /// Both binaries present?
    pub fn available() -> bool {
        Self::probe("mksquashfs") && Self::probe("unsquashfs")
    }

    pub fn unsquashfs_available() -> bool {
        Self::probe("unsquashfs")
    }

    fn probe(binary: &str) -> bool {
        Command::new(binary)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn run(command: &mut Command, what: &str) -> Result<()> {
        let output = command
            .output()
            .map_err(|e| TransmitError::Config(format!("{} failed to start: {}", what, e)))?;
        debug!("{}: {}", what, String::from_utf8_lossy(&output.stdout));
        if !output.status.success() {
            return Err(TransmitError::Io(format!(
                "{} exited with {}: {}",
                what,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

impl SquashTooling for CommandTooling {
    fn pack(&self, dir: &Path, fs_file: &Path) -> Result<()> {
        info!("mksquashfs {} -> {}", dir.display(), fs_file.display());
        CommandTooling::run(Command::new("mksquashfs").arg(dir).arg(fs_file), "mksquashfs")
    }

    fn unpack(&self, fs_file: &Path, dir: &Path) -> Result<()> {
        info!("unsquashfs {} -> {}", fs_file.display(), dir.display());
        CommandTooling::run(
            Command::new("unsquashfs").arg("-d").arg(dir).arg(fs_file),
            "unsquashfs",
        )
    }
}

/// Layer view over a plain directory (a save-run work dir or an unpacked
/// squashfs tree).
pub struct DirLayerFs {
    root: PathBuf,
}

impl DirLayerFs {
    pub fn new(root: impl Into<PathBuf>) -> DirLayerFs {
        DirLayerFs { root: root.into() }
    }
}

impl LayerFs for DirLayerFs {
    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.root.join(sanitize_member_path(name)?);
        Ok(Box::new(std::fs::File::open(path)?))
    }

    fn exists(&self, name: &str) -> bool {
        sanitize_member_path(name)
            .map(|rel| self.root.join(rel).is_file())
            .unwrap_or(false)
    }
}

/// Layer view that streams individual members straight out of a squashfs
/// image with `unsquashfs -cat`, without unpacking the whole archive. The
/// member list is read once up front, so existence checks are cheap.
pub struct SquashCatFs {
    fs_file: PathBuf,
    members: HashSet<String>,
}

impl SquashCatFs {
    pub fn new(fs_file: impl Into<PathBuf>) -> Result<SquashCatFs> {
        let fs_file = fs_file.into();
        let output = Command::new("unsquashfs")
            .arg("-ls")
            .arg(&fs_file)
            .output()
            .map_err(|e| TransmitError::Config(format!("unsquashfs -ls failed to start: {}", e)))?;
        if !output.status.success() {
            return Err(TransmitError::Io(format!(
                "unsquashfs -ls {} exited with {}",
                fs_file.display(),
                output.status
            )));
        }
        let members = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.strip_prefix("squashfs-root/"))
            .map(str::to_string)
            .collect();
        Ok(SquashCatFs { fs_file, members })
    }

    fn member_name(name: &str) -> Result<String> {
        Ok(sanitize_member_path(name)?.to_string_lossy().to_string())
    }
}

impl LayerFs for SquashCatFs {
    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let member = Self::member_name(name)?;
        if !self.members.contains(&member) {
            return Err(TransmitError::Io(format!(
                "{} not present in {}",
                member,
                self.fs_file.display()
            )));
        }
        let mut child = Command::new("unsquashfs")
            .arg("-cat")
            .arg(&self.fs_file)
            .arg(&member)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| TransmitError::Io(format!("unsquashfs -cat failed to start: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransmitError::Io("no stdout pipe on unsquashfs".to_string()))?;
        Ok(Box::new(CatStream { child, stdout }))
    }

    fn exists(&self, name: &str) -> bool {
        Self::member_name(name)
            .map(|m| self.members.contains(&m))
            .unwrap_or(false)
    }
}

struct CatStream {
    child: Child,
    stdout: std::process::ChildStdout,
}

impl Read for CatStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Drop for CatStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_layer_fs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("abc")).unwrap();
        std::fs::write(dir.path().join("abc/file.txt"), b"data").unwrap();

        let layer_fs = DirLayerFs::new(dir.path());
        assert!(layer_fs.exists("abc/file.txt"));
        assert!(layer_fs.exists("./abc/file.txt"));
        assert!(!layer_fs.exists("abc/missing.txt"));

        let mut content = String::new();
        layer_fs
            .open("abc/file.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "data");
    }
}
