//! Offline upload: push blobs out of archive datafiles
//!
//! Blobs are resolved by scanning the run's datafiles. In squashfs mode a
//! layer is reassembled twice: a hash pass first, then the stream pass; a
//! drifted gzip digest patches the manifest in place before it is pushed.
//! Destinations named after a local runtime receive a docker-save tar on
//! stdin instead of registry pushes.

use crate::archive::{ArchiveWriter, CompressedTarReader, Compressor, DockerTarWriter, LoadTarget};
use crate::error::{Result, TransmitError};
use crate::metadata::CompressionMetadata;
use crate::registry::manifest::{self, BlobInfo, Manifest, ManifestList};
use crate::registry::ImageDestination;
use crate::task::{Task, TaskContext};
use crate::util::{format_byte_size, shorten};
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct OfflineUploadTask {
    ctx: Arc<TaskContext>,
    destination: Option<ImageDestination>,
    url: String,
    path: PathBuf,
    load_target: Option<LoadTarget>,
}

impl OfflineUploadTask {
    pub fn new(
        ctx: Arc<TaskContext>,
        destination: Option<ImageDestination>,
        url: String,
        path: PathBuf,
        load_target: Option<LoadTarget>,
    ) -> OfflineUploadTask {
        OfflineUploadTask {
            ctx,
            destination,
            url,
            path,
            load_target,
        }
    }

    fn meta(&self) -> Result<&CompressionMetadata> {
        self.ctx
            .comp_meta
            .as_ref()
            .ok_or_else(|| TransmitError::Config("upload run without compression metadata".to_string()))
    }

    fn dst_url(&self) -> String {
        self.destination
            .as_ref()
            .map(|d| d.url())
            .unwrap_or_else(|| "local runtime".to_string())
    }

    /// Push one single-image manifest: its blobs, then the (possibly
    /// patched) manifest bytes. Returns what was actually pushed.
    /// `push_by_digest` addresses the manifest by the digest of its final
    /// bytes instead of the tag; sub-manifests of a list are pushed that
    /// way.
    fn upload_image(
        &self,
        mut manifest_text: String,
        push_by_digest: bool,
        docker: &mut Option<DockerTarWriter>,
        tid: usize,
    ) -> Result<String> {
        let m = Manifest::parse(manifest_text.as_bytes())?;
        let blobs = m.blob_infos();

        for (i, b) in blobs.iter().enumerate() {
            if self.ctx.cancelled() {
                return Err(TransmitError::Cancelled);
            }

            if let Some(dst) = &self.destination {
                let exist = dst.check_blob_exist(b).map_err(|e| {
                    TransmitError::Registry(format!(
                        "Check blob {}({}) to {} exist error: {}",
                        b.digest,
                        format_byte_size(b.size),
                        self.dst_url(),
                        e
                    ))
                })?;
                if exist {
                    debug!(
                        "Blob {}({}) has been pushed to {}, will not be pulled",
                        shorten(&b.digest, 19),
                        format_byte_size(b.size),
                        self.dst_url()
                    );
                    continue;
                }
            }

            let found = self.upload_blob(b, i, &mut manifest_text, docker, tid)?;
            if !found {
                return Err(TransmitError::BlobNotFound(b.hex().to_string()));
            }
        }

        match (&self.destination, docker.as_mut()) {
            (Some(dst), _) => {
                if push_by_digest {
                    let digest = format!(
                        "sha256:{}",
                        hex::encode(Sha256::digest(manifest_text.as_bytes()))
                    );
                    dst.push_manifest_digest(manifest_text.as_bytes(), &digest)?;
                } else {
                    dst.push_manifest(manifest_text.as_bytes())?;
                }
                info!("Put manifest to {}", self.dst_url());
            }
            (None, Some(docker)) => {
                // docker load recomputes digests itself, patching skipped
                let m = Manifest::parse(manifest_text.as_bytes())?;
                docker.append_meta(&m, &self.url)?;
            }
            (None, None) => {
                return Err(TransmitError::Config(
                    "upload task without destination or load target".to_string(),
                ));
            }
        }
        Ok(manifest_text)
    }

    /// Resolve a blob across datafiles and hand it to the destination or
    /// the docker-tar stream. `manifest_text` is patched when a squashfs
    /// reassembly drifts.
    fn upload_blob(
        &self,
        b: &BlobInfo,
        index: usize,
        manifest_text: &mut String,
        docker: &mut Option<DockerTarWriter>,
        tid: usize,
    ) -> Result<bool> {
        let meta = self.meta()?;
        let compressor: Compressor = meta.compressor().parse()?;

        if let Some(squashfs) = &self.ctx.squashfs_tar {
            // hash pass over the reassembled stream
            let mut hasher = Sha256::new();
            let mut counted = 0u64;
            {
                let mut reader = squashfs.get_file_stream(b.hex())?;
                let mut buf = [0u8; 64 * 1024];
                loop {
                    let n = reader.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    counted += n as u64;
                }
            }
            let actual = format!("sha256:{}", hex::encode(hasher.finalize()));

            let mut push_info = b.clone();
            if actual != b.digest {
                info!("Update digest from {} to {}", b.digest, actual);
                info!("Update size from {} to {}", b.size, counted);
                push_info.digest = actual.clone();
                push_info.size = counted as i64;
                if docker.is_none() {
                    *manifest_text =
                        manifest::patch_manifest(manifest_text, b, &actual, counted as i64)?;
                }
            }

            // stream pass
            let reader = squashfs.get_file_stream(b.hex())?;
            match docker.as_mut() {
                Some(docker) => {
                    let member = Self::docker_member(b, index);
                    let mut reader = reader;
                    docker.append_file_stream(&member, push_info.size, &mut reader)?;
                }
                None => self.push_blob(reader, &push_info)?,
            }
            return Ok(true);
        }

        // plain archive: scan every datafile for the digest prefix
        for name in meta.datafiles().keys() {
            let reader = CompressedTarReader::new(&self.path.join(name), compressor)?;
            let spool_name = format!("upload_{}_{}", tid, b.blob_filename());
            let (mut spool, spool_path) = self.ctx.temp.create_file(&spool_name)?;
            let Some((member, size)) = reader.copy_blob_to(b.hex(), &mut spool)? else {
                continue;
            };
            drop(spool);
            if size != b.size {
                return Err(TransmitError::Integrity(format!(
                    "Blob {} size mismatch, size in meta: {}, size in tar: {}",
                    member, b.size, size
                )));
            }

            let file = File::open(&spool_path)?;
            match docker.as_mut() {
                Some(docker) => {
                    let member = Self::docker_member(b, index);
                    let mut file = file;
                    docker.append_file_stream(&member, size, &mut file)?;
                }
                None => self.push_blob(file, b)?,
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Member name inside the docker-save stream: the config at index 0,
    /// layer directories after it.
    fn docker_member(b: &BlobInfo, index: usize) -> String {
        if index == 0 {
            DockerTarWriter::config_member(b)
        } else {
            DockerTarWriter::layer_member(b, index - 1)
        }
    }

    fn push_blob<R: Read + Send + 'static>(&self, reader: R, b: &BlobInfo) -> Result<()> {
        let dst = self
            .destination
            .as_ref()
            .ok_or_else(|| TransmitError::Config("no destination for blob push".to_string()))?;
        let begin = Instant::now();
        dst.put_a_blob(reader, b).map_err(|e| {
            TransmitError::Registry(format!(
                "Put blob {}({}) to {} failed: {}",
                b.digest,
                format_byte_size(b.size),
                self.dst_url(),
                e
            ))
        })?;
        debug!(
            "Put blob {}({}) to {} success",
            shorten(&b.digest, 19),
            format_byte_size(b.size),
            self.dst_url()
        );
        self.stat_up(b.size, begin.elapsed());
        Ok(())
    }
}

impl Task for OfflineUploadTask {
    fn run(&mut self, tid: usize) -> Result<()> {
        let manifest_text = self.meta()?.manifest_for(&self.url).ok_or_else(|| {
            TransmitError::Config(format!("no manifest recorded for {}", self.url))
        })?;

        let mut docker = match (&self.destination, &self.load_target) {
            (None, Some(target)) => Some(DockerTarWriter::new(target)?),
            _ => None,
        };

        let is_list = ManifestList::parse(manifest_text.as_bytes())
            .map(|l| !l.manifests.is_empty())
            .unwrap_or(false);

        if is_list {
            if docker.is_some() {
                return Err(TransmitError::Config(
                    "manifest lists cannot be loaded into a local runtime".to_string(),
                ));
            }
            let list = ManifestList::parse(manifest_text.as_bytes())?;
            let mut list_text = manifest_text;
            for descriptor in &list.manifests {
                let key = format!("{}@{}", self.url, descriptor.digest);
                let sub_text = self.meta()?.manifest_for(&key).ok_or_else(|| {
                    TransmitError::Config(format!("no sub-manifest recorded for {}", key))
                })?;
                let old_len = sub_text.len() as i64;
                let pushed = self.upload_image(sub_text, true, &mut docker, tid)?;

                // a patched sub-manifest changes its own digest; fix the
                // list entry the same way a layer entry is fixed
                let new_digest = format!("sha256:{}", hex::encode(Sha256::digest(pushed.as_bytes())));
                if new_digest != descriptor.digest {
                    let old = BlobInfo {
                        digest: descriptor.digest.clone(),
                        size: old_len,
                        media_type: descriptor.media_type.clone(),
                    };
                    list_text = manifest::patch_manifest(
                        &list_text,
                        &old,
                        &new_digest,
                        pushed.len() as i64,
                    )?;
                }
            }
            let dst = self
                .destination
                .as_ref()
                .ok_or_else(|| TransmitError::Config("no destination for manifest list".to_string()))?;
            dst.push_manifest(list_text.as_bytes())?;
            info!("Put manifest list to {}", self.dst_url());
        } else {
            self.upload_image(manifest_text, false, &mut docker, tid)?;
        }

        if let Some(mut docker) = docker {
            docker.close()?;
        }
        Ok(())
    }

    fn name(&self) -> String {
        self.url.clone()
    }

    fn stat_up(&self, bytes: i64, duration: Duration) {
        self.ctx.stat_up(bytes, duration);
    }

    fn status(&self) -> String {
        self.ctx.status_line()
    }
}
