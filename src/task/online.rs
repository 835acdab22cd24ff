//! Online transmit: stream blobs straight from source to destination

use crate::error::{Result, TransmitError};
use crate::registry::manifest::{self, BlobInfo, Manifest, ManifestList};
use crate::registry::{ImageDestination, ImageSource};
use crate::task::{Task, TaskContext};
use crate::util::{format_byte_size, shorten};
use log::{debug, info};
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

type TaskCallback = Box<dyn Fn(bool, &str) + Send + Sync>;

pub struct OnlineTask {
    source: ImageSource,
    destination: ImageDestination,
    ctx: Arc<TaskContext>,
    on_done: Option<TaskCallback>,
}

impl OnlineTask {
    pub fn new(source: ImageSource, destination: ImageDestination, ctx: Arc<TaskContext>) -> OnlineTask {
        OnlineTask {
            source,
            destination,
            ctx,
            on_done: None,
        }
    }

    /// Watch mode attaches a notification callback per task.
    pub fn with_callback(
        source: ImageSource,
        destination: ImageDestination,
        ctx: Arc<TaskContext>,
        on_done: TaskCallback,
    ) -> OnlineTask {
        OnlineTask {
            source,
            destination,
            ctx,
            on_done: Some(on_done),
        }
    }

    /// Move every blob of one (sub-)manifest that the destination does not
    /// already hold.
    fn transfer_blobs(&self, blobs: &[BlobInfo]) -> Result<()> {
        for b in blobs {
            let exist = self.destination.check_blob_exist(b).map_err(|e| {
                TransmitError::Registry(format!(
                    "Check blob {}({}) to {} exist error: {}",
                    b.digest,
                    format_byte_size(b.size),
                    self.destination.url(),
                    e
                ))
            })?;
            if exist {
                info!(
                    "Blob {}({}) has been pushed to {}, will not be pulled",
                    shorten(&b.digest, 19),
                    format_byte_size(b.size),
                    self.destination.url()
                );
                continue;
            }

            let begin = Instant::now();
            let (blob, size) = self.source.get_a_blob(b).map_err(|e| {
                TransmitError::Registry(format!(
                    "Get blob {}({}) from {} failed: {}",
                    b.digest,
                    format_byte_size(b.size),
                    self.source.url(),
                    e
                ))
            })?;
            debug!(
                "Get a blob {}({}) from {} success",
                shorten(&b.digest, 19),
                format_byte_size(size),
                self.source.url()
            );

            if self.ctx.cancelled() {
                return Err(TransmitError::Cancelled);
            }

            let mut b = b.clone();
            b.size = size;
            let blob_name = b.blob_filename();

            // cache hits contribute nothing to down-bytes
            let mut down_size = size;
            let up_reader: Box<dyn Read + Send> = match &self.ctx.cache {
                Some(cache) if cache.matched(&blob_name, size).is_some() => {
                    drop(blob);
                    debug!("Reuse cache: {}", blob_name);
                    down_size = 0;
                    Box::new(cache.reuse(&blob_name)?)
                }
                Some(cache) => Box::new(cache.save_stream(&blob_name, blob)?),
                None => Box::new(blob),
            };

            self.destination.put_a_blob(up_reader, &b).map_err(|e| {
                TransmitError::Registry(format!(
                    "Put blob {}({}) to {} failed: {}",
                    b.digest,
                    format_byte_size(b.size),
                    self.destination.url(),
                    e
                ))
            })?;
            info!(
                "Put blob {}({}) to {} success",
                shorten(&b.digest, 19),
                format_byte_size(b.size),
                self.destination.url()
            );

            let elapsed = begin.elapsed();
            if down_size > 0 {
                self.stat_down(down_size, elapsed);
            }
            self.stat_up(size, elapsed);

            if self.ctx.cancelled() {
                return Err(TransmitError::Cancelled);
            }
        }
        Ok(())
    }
}

impl Task for OnlineTask {
    fn run(&mut self, _tid: usize) -> Result<()> {
        let (manifest_bytes, media_type) = self.source.get_manifest().map_err(|e| {
            TransmitError::Registry(format!(
                "Failed to get manifest from {} error: {}",
                self.source.url(),
                e
            ))
        })?;
        info!("Get manifest from {}", self.source.url());

        if manifest::is_manifest_list(&media_type) {
            // fan out: every sub-manifest is pushed before the list itself
            let list = ManifestList::parse(&manifest_bytes)?;
            for descriptor in &list.manifests {
                let (sub_bytes, _) =
                    self.source
                        .get_manifest_by_digest(&descriptor.digest)
                        .map_err(|e| {
                            TransmitError::Registry(format!(
                                "Get manifest {} for manifest list error: {}",
                                descriptor.digest, e
                            ))
                        })?;
                let sub = Manifest::parse(&sub_bytes)?;
                self.transfer_blobs(&sub.blob_infos())?;
                self.destination
                    .push_manifest_digest(&sub_bytes, &descriptor.digest)?;
            }
            self.destination.push_manifest(&manifest_bytes)?;
            info!("Put manifest list to {}", self.destination.url());
        } else {
            let blobs = self.source.get_blob_infos(&manifest_bytes, &media_type)?;
            self.transfer_blobs(&blobs)?;
            self.destination.push_manifest(&manifest_bytes)?;
            info!("Put manifest to {}", self.destination.url());
        }

        info!(
            "Transmit successfully from {} to {}",
            self.source.url(),
            self.destination.url()
        );
        if let Some(history) = &self.ctx.history {
            history.add(&self.source.url());
        }
        Ok(())
    }

    fn name(&self) -> String {
        self.source.url()
    }

    fn callback(&self, success: bool, content: &str) {
        if let Some(on_done) = &self.on_done {
            on_done(success, content);
        }
    }

    fn stat_down(&self, bytes: i64, duration: Duration) {
        self.ctx.stat_down(bytes, duration);
    }

    fn stat_up(&self, bytes: i64, duration: Duration) {
        self.ctx.stat_up(bytes, duration);
    }

    fn status(&self) -> String {
        self.ctx.status_line()
    }
}
