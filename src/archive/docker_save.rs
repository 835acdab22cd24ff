//! Docker-save-layout tar emitter
//!
//! Writes a tar stream a local runtime can load directly: per-layer
//! directories, the config file, a trailing `manifest.json` and
//! `repositories`. The stream targets either a plain file or the stdin of
//! a `docker load` / `ctr image import` subprocess.

use crate::archive::{append_counted, ArchiveWriter};
use crate::error::{Result, TransmitError};
use crate::reference::strip_scheme;
use crate::registry::manifest::{BlobInfo, Manifest};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

/// Where the docker-tar stream goes.
#[derive(Debug, Clone)]
pub enum LoadTarget {
    File(PathBuf),
    /// `docker load`
    Docker,
    /// `ctr image import -`
    Ctr,
}

pub struct DockerTarWriter {
    builder: Option<tar::Builder<Box<dyn Write + Send>>>,
    child: Option<Child>,
}

impl DockerTarWriter {
    pub fn new(target: &LoadTarget) -> Result<DockerTarWriter> {
        let (writer, child): (Box<dyn Write + Send>, Option<Child>) = match target {
            LoadTarget::File(path) => (Box::new(File::create(path)?), None),
            LoadTarget::Docker => Self::spawn(Command::new("docker").arg("load"))?,
            LoadTarget::Ctr => {
                Self::spawn(Command::new("ctr").args(["image", "import", "-"]))?
            }
        };
        Ok(DockerTarWriter {
            builder: Some(tar::Builder::new(writer)),
            child,
        })
    }

    fn spawn(command: &mut Command) -> Result<(Box<dyn Write + Send>, Option<Child>)> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| TransmitError::Config(format!("spawn runtime loader failed: {}", e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransmitError::Io("no stdin pipe on runtime loader".to_string()))?;
        Ok((Box::new(stdin), Some(child)))
    }

    fn builder(&mut self) -> Result<&mut tar::Builder<Box<dyn Write + Send>>> {
        self.builder
            .as_mut()
            .ok_or_else(|| TransmitError::Io("docker tar writer already closed".to_string()))
    }

    /// Directory member name for a layer: the digest hex with the layer
    /// index keeps duplicated empty layers from colliding.
    pub fn layer_member(layer: &BlobInfo, index: usize) -> String {
        if layer.media_type.ends_with("tar.gzip") || layer.media_type.ends_with("tar+gzip") {
            format!("{}{}/layer.tar.gz", layer.hex(), index)
        } else {
            format!("{}{}/layer.raw", layer.hex(), index)
        }
    }

    /// Config member name.
    pub fn config_member(config: &BlobInfo) -> String {
        format!("{}.json", config.hex())
    }

    /// Trailing `manifest.json` and `repositories` members for one image,
    /// matching the layer members written during upload.
    pub fn append_meta(&mut self, manifest: &Manifest, url: &str) -> Result<()> {
        let img_url = strip_scheme(url);
        let layers: Vec<String> = manifest
            .layers
            .iter()
            .enumerate()
            .map(|(i, l)| Self::layer_member(l, i))
            .collect();
        let entry = serde_json::json!([{
            "Config": Self::config_member(&manifest.config),
            "RepoTags": [img_url],
            "Layers": layers,
        }]);
        self.append_json("manifest.json", &entry)?;

        let (image_name, image_tag) = img_url.rsplit_once(':').unwrap_or((img_url, "latest"));
        let last = manifest.layers.len().saturating_sub(1);
        let last_id = manifest
            .layers
            .last()
            .map(|l| format!("{}{}", l.hex(), last))
            .unwrap_or_default();
        let mut repositories: BTreeMap<&str, BTreeMap<&str, String>> = BTreeMap::new();
        repositories.insert(image_name, BTreeMap::from([(image_tag, last_id)]));
        self.append_json("repositories", &serde_json::json!(repositories))
    }

    /// Save-mode trailer: blobs were appended under their plain blob
    /// filenames, so the manifest references those directly.
    pub fn append_save_meta(&mut self, images: &[(String, Manifest)]) -> Result<()> {
        let mut entries = Vec::new();
        let mut repositories: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (url, manifest) in images {
            let img_url = strip_scheme(url).to_string();
            let layers: Vec<String> = manifest.layers.iter().map(|l| l.blob_filename()).collect();
            entries.push(serde_json::json!({
                "Config": Self::config_member(&manifest.config),
                "RepoTags": [img_url.clone()],
                "Layers": layers,
            }));
            let (name, tag) = img_url
                .rsplit_once(':')
                .map(|(n, t)| (n.to_string(), t.to_string()))
                .unwrap_or((img_url.clone(), "latest".to_string()));
            let last_hex = manifest.layers.last().map(|l| l.hex().to_string()).unwrap_or_default();
            repositories.entry(name).or_default().insert(tag, last_hex);
        }
        self.append_json("manifest.json", &serde_json::json!(entries))?;
        self.append_json("repositories", &serde_json::json!(repositories))
    }

    fn append_json(&mut self, name: &str, value: &serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let size = bytes.len() as i64;
        self.append_file_stream(name, size, &mut Cursor::new(bytes))
    }
}

impl ArchiveWriter for DockerTarWriter {
    fn append_file_stream(&mut self, name: &str, size: i64, reader: &mut dyn Read) -> Result<()> {
        append_counted(self.builder()?, name, size, reader)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(builder) = self.builder.take() {
            let writer = builder.into_inner()?;
            drop(writer);
        }
        if let Some(mut child) = self.child.take() {
            let status = child
                .wait()
                .map_err(|e| TransmitError::Io(format!("wait for runtime loader failed: {}", e)))?;
            if !status.success() {
                return Err(TransmitError::Io(format!(
                    "runtime loader exited with {}",
                    status
                )));
            }
        }
        Ok(())
    }

    fn as_docker(&mut self) -> Option<&mut DockerTarWriter> {
        Some(self)
    }
}

impl Drop for DockerTarWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(hex: &str, size: i64) -> BlobInfo {
        BlobInfo {
            digest: format!("sha256:{}", hex),
            size,
            media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".to_string(),
        }
    }

    #[test]
    fn test_docker_save_layout() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("image.tar");

        let manifest = Manifest {
            config: BlobInfo {
                digest: "sha256:cfg0".to_string(),
                size: 2,
                media_type: "application/vnd.docker.container.image.v1+json".to_string(),
            },
            layers: vec![layer("l0", 3), layer("l1", 3)],
        };

        let mut writer = DockerTarWriter::new(&LoadTarget::File(out.clone())).unwrap();
        writer
            .append_file_stream("cfg0.json", 2, &mut Cursor::new(b"{}".to_vec()))
            .unwrap();
        writer
            .append_file_stream("l00/layer.tar.gz", 3, &mut Cursor::new(b"abc".to_vec()))
            .unwrap();
        writer
            .append_file_stream("l11/layer.tar.gz", 3, &mut Cursor::new(b"def".to_vec()))
            .unwrap();
        writer.append_meta(&manifest, "hub.x.io/ns/img:1").unwrap();
        writer.close().unwrap();

        let mut names = Vec::new();
        let mut manifest_json = Vec::new();
        let mut repositories = Vec::new();
        let mut archive = tar::Archive::new(File::open(&out).unwrap());
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            if name == "manifest.json" {
                entry.read_to_end(&mut manifest_json).unwrap();
            } else if name == "repositories" {
                entry.read_to_end(&mut repositories).unwrap();
            }
            names.push(name);
        }
        assert_eq!(
            names,
            vec![
                "cfg0.json",
                "l00/layer.tar.gz",
                "l11/layer.tar.gz",
                "manifest.json",
                "repositories"
            ]
        );

        let parsed: serde_json::Value = serde_json::from_slice(&manifest_json).unwrap();
        assert_eq!(parsed[0]["Config"], "cfg0.json");
        assert_eq!(parsed[0]["RepoTags"][0], "hub.x.io/ns/img:1");
        assert_eq!(parsed[0]["Layers"][1], "l11/layer.tar.gz");

        let repos: serde_json::Value = serde_json::from_slice(&repositories).unwrap();
        assert_eq!(repos["hub.x.io/ns/img"]["1"], "l11");
    }
}
