//! Offline save: pull blobs into archive datafiles
//!
//! Workers share one ledger; the skip predicate guarantees each digest is
//! fetched and written exactly once per run, whichever image references it
//! and whichever worker gets there first.

use crate::archive::ArchiveWriter;
use crate::error::{Result, TransmitError};
use crate::registry::manifest::{self, BlobInfo, Manifest, ManifestList};
use crate::registry::ImageSource;
use crate::task::{Task, TaskContext};
use crate::util::{format_byte_size, shorten};
use log::{debug, info};
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct OfflineDownTask {
    ctx: Arc<TaskContext>,
    url: String,
    source: ImageSource,
}

impl OfflineDownTask {
    pub fn new(ctx: Arc<TaskContext>, url: String, source: ImageSource) -> OfflineDownTask {
        OfflineDownTask { ctx, url, source }
    }

    fn meta(&self) -> Result<&crate::metadata::CompressionMetadata> {
        self.ctx
            .comp_meta
            .as_ref()
            .ok_or_else(|| TransmitError::Config("save run without compression metadata".to_string()))
    }

    fn run_inner(&mut self, tid: usize) -> Result<()> {
        let src_url = self.source.url();
        let (manifest_bytes, media_type) = self.source.get_manifest().map_err(|e| {
            TransmitError::Registry(format!("Failed to get manifest from {} error: {}", src_url, e))
        })?;
        info!("Get manifest from {}", src_url);

        let meta = self.meta()?;
        meta.add_image(&self.url, &String::from_utf8_lossy(&manifest_bytes));

        let blobs = if manifest::is_manifest_list(&media_type) {
            // store each sub-manifest next to the list so upload can push
            // members before the list itself
            let list = ManifestList::parse(&manifest_bytes)?;
            let mut blobs = Vec::new();
            for descriptor in &list.manifests {
                let (sub_bytes, _) = self.source.get_manifest_by_digest(&descriptor.digest)?;
                meta.add_image(
                    &format!("{}@{}", self.url, descriptor.digest),
                    &String::from_utf8_lossy(&sub_bytes),
                );
                blobs.extend(Manifest::parse(&sub_bytes)?.blob_infos());
            }
            blobs
        } else {
            self.source.get_blob_infos(&manifest_bytes, &media_type)?
        };

        for b in &blobs {
            let begin = Instant::now();
            if self.ctx.cancelled() {
                return Err(TransmitError::Cancelled);
            }

            if self.meta()?.should_skip(b.hex(), tid) {
                debug!("Skip blob: {}", shorten(&b.digest, 19));
                // this image still owns the digest, but only blob_done by
                // the worker actually writing it may mark it present
                self.meta()?.blob_shared(b.hex(), &self.url);
                continue;
            }

            let (blob, size) = self.source.get_a_blob(b).map_err(|e| {
                TransmitError::Registry(format!(
                    "Get blob {}({}) from {} failed: {}",
                    b.digest,
                    format_byte_size(b.size),
                    src_url,
                    e
                ))
            })?;
            debug!(
                "Get a blob {}({}) from {} success",
                shorten(&b.digest, 19),
                format_byte_size(size),
                src_url
            );

            let net_bytes = self.route_blob(b, blob, size, tid)?;
            if net_bytes > 0 {
                self.stat_down(net_bytes, begin.elapsed());
            }
            self.meta()?.blob_done(b.hex(), &self.url);
        }
        Ok(())
    }

    /// Write one fetched blob to whichever writer this run configured.
    /// Returns the bytes that actually crossed the network (0 on cache
    /// reuse).
    fn route_blob<R: Read + Send + 'static>(
        &self,
        b: &BlobInfo,
        blob: R,
        size: i64,
        tid: usize,
    ) -> Result<i64> {
        let blob_name = b.blob_filename();

        if let Some(squashfs) = &self.ctx.squashfs_tar {
            match &self.ctx.cache {
                Some(cache) => {
                    if cache.matched(&blob_name, size).is_some() {
                        drop(blob);
                        debug!("Reuse cache: {}", blob_name);
                        let reader = cache.reuse(&blob_name)?;
                        squashfs.append_file_stream(&blob_name, size, reader)?;
                        Ok(0)
                    } else {
                        let tee = cache.save_stream(&blob_name, blob)?;
                        squashfs.append_file_stream(&blob_name, size, tee)?;
                        Ok(size)
                    }
                }
                None => {
                    squashfs.append_file_stream(&blob_name, size, blob)?;
                    Ok(size)
                }
            }
        } else if self.ctx.has_single_writer() {
            let (path, net) = match &self.ctx.cache {
                Some(cache) => {
                    if let Some(path) = cache.matched(&blob_name, size) {
                        drop(blob);
                        debug!("Reuse cache: {}", blob_name);
                        (path, 0)
                    } else {
                        (cache.save_file(&blob_name, blob, size)?, size)
                    }
                }
                None => (self.ctx.temp.save_file(&blob_name, blob)?, size),
            };
            self.ctx.put_single_file(path);
            Ok(net)
        } else {
            let writer = self.ctx.tar_writer(tid).ok_or_else(|| {
                TransmitError::Config(format!("no archive writer for worker {}", tid))
            })?;
            match &self.ctx.cache {
                Some(cache) => {
                    if cache.matched(&blob_name, size).is_some() {
                        drop(blob);
                        debug!("Reuse cache: {}", blob_name);
                        let mut reader = cache.reuse(&blob_name)?;
                        writer
                            .lock()
                            .unwrap()
                            .append_file_stream(&blob_name, size, &mut reader)?;
                        Ok(0)
                    } else {
                        let mut tee = cache.save_stream(&blob_name, blob)?;
                        writer
                            .lock()
                            .unwrap()
                            .append_file_stream(&blob_name, size, &mut tee)?;
                        tee.finish()?;
                        Ok(size)
                    }
                }
                None => {
                    let mut blob = blob;
                    writer
                        .lock()
                        .unwrap()
                        .append_file_stream(&blob_name, size, &mut blob)?;
                    Ok(size)
                }
            }
        }
    }
}

impl Task for OfflineDownTask {
    fn run(&mut self, tid: usize) -> Result<()> {
        let result = self.run_inner(tid);
        // release any reservation this worker still holds, success or not
        if let Some(meta) = self.ctx.comp_meta.as_ref() {
            meta.clear_doing(tid);
        }
        result
    }

    fn name(&self) -> String {
        self.url.clone()
    }

    fn stat_down(&self, bytes: i64, duration: Duration) {
        self.ctx.stat_down(bytes, duration);
    }

    fn status(&self) -> String {
        self.ctx.status_line()
    }
}
