//! Compression metadata: the ledger of blobs, manifests and datafiles
//!
//! One instance lives for the whole save or upload run. `blobs` membership
//! is the deduplication oracle: a digest appears there iff its bytes are
//! fully written to some datafile in this run or inherited from an
//! incremental-reference meta file. `blob_doing` holds in-flight
//! reservations keyed by worker id and never reaches disk.

use crate::error::{Result, TransmitError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetaInner {
    compressor: String,
    /// datafile name -> size, verified on upload
    datafiles: BTreeMap<String, i64>,
    /// image reference -> manifest bytes as text
    manifests: BTreeMap<String, String>,
    /// blob hex -> image references owning the blob
    blobs: BTreeMap<String, Vec<String>>,
    /// blob hex -> worker id holding the reservation
    #[serde(skip)]
    blob_doing: HashMap<String, usize>,
    /// blob hex -> owners recorded on the skip path while the digest is
    /// still being written; promoted into `blobs` by `blob_done`
    #[serde(skip)]
    pending_refs: HashMap<String, Vec<String>>,
}

pub struct CompressionMetadata {
    inner: Mutex<MetaInner>,
}

impl CompressionMetadata {
    pub fn new(compressor: &str) -> CompressionMetadata {
        CompressionMetadata {
            inner: Mutex::new(MetaInner {
                compressor: compressor.to_string(),
                ..Default::default()
            }),
        }
    }

    /// Load a `*_meta.yaml` written by a previous save run.
    pub fn load(path: &Path) -> Result<CompressionMetadata> {
        let text = std::fs::read_to_string(path)?;
        let inner: MetaInner = serde_yaml::from_str(&text).map_err(|e| {
            TransmitError::Parse(format!(
                "meta file {} unreadable (version incompatible or corrupt?): {}",
                path.display(),
                e
            ))
        })?;
        Ok(CompressionMetadata {
            inner: Mutex::new(inner),
        })
    }

    /// Serialize the ledger next to the datafiles, recording their final
    /// on-disk sizes first.
    pub fn save(&self, pathname: &Path, work_name: &str) -> Result<std::path::PathBuf> {
        {
            let mut inner = self.inner.lock().unwrap();
            let names: Vec<String> = inner.datafiles.keys().cloned().collect();
            for name in names {
                let meta = std::fs::metadata(pathname.join(&name))?;
                inner.datafiles.insert(name, meta.len() as i64);
            }
        }
        let meta_file = pathname.join(format!("{}_meta.yaml", work_name));
        let text = serde_yaml::to_string(&*self.inner.lock().unwrap())?;
        std::fs::write(&meta_file, text)?;
        Ok(meta_file)
    }

    pub fn compressor(&self) -> String {
        self.inner.lock().unwrap().compressor.clone()
    }

    pub fn blob_exists(&self, hex: &str) -> bool {
        self.inner.lock().unwrap().blobs.contains_key(hex)
    }

    /// Try to reserve a blob for a worker. Returns true iff the
    /// reservation was granted: the digest was in neither `blobs` nor
    /// `blob_doing`.
    pub fn blob_start(&self, hex: &str, tid: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.blobs.contains_key(hex) || inner.blob_doing.contains_key(hex) {
            return false;
        }
        inner.blob_doing.insert(hex.to_string(), tid);
        true
    }

    /// Record a fully written blob as owned by `reference`, promoting any
    /// owners that skipped while the write was in flight. Idempotent per
    /// pair, so a retried task never duplicates ownership. The
    /// reservation stays in `blob_doing` until the worker's teardown;
    /// other workers see doneness via `blobs`.
    pub fn blob_done(&self, hex: &str, reference: &str) {
        let mut inner = self.inner.lock().unwrap();
        let pending = inner.pending_refs.remove(hex).unwrap_or_default();
        let owners = inner.blobs.entry(hex.to_string()).or_default();
        for r in std::iter::once(reference.to_string()).chain(pending) {
            if !owners.contains(&r) {
                owners.push(r);
            }
        }
    }

    /// Record ownership for a digest some other worker writes. Must never
    /// mark the digest done: while the write is still in flight the owner
    /// is held back and only promoted by the writer's `blob_done`, so a
    /// failed writer can retry the fetch instead of finding the digest
    /// pre-empted by its sibling's skip record.
    pub fn blob_shared(&self, hex: &str, reference: &str) {
        let mut inner = self.inner.lock().unwrap();
        match inner.blobs.get_mut(hex) {
            Some(owners) => {
                if !owners.iter().any(|r| r == reference) {
                    owners.push(reference.to_string());
                }
            }
            None => {
                let pending = inner.pending_refs.entry(hex.to_string()).or_default();
                if !pending.iter().any(|r| r == reference) {
                    pending.push(reference.to_string());
                }
            }
        }
    }

    /// Release every reservation held by a worker. Called from task
    /// teardown so an aborted reservation never wedges the digest.
    pub fn clear_doing(&self, tid: usize) {
        self.inner.lock().unwrap().blob_doing.retain(|_, v| *v != tid);
    }

    /// Save-worker skip predicate: skip when the blob is already done or
    /// the reservation went to someone else.
    pub fn should_skip(&self, hex: &str, tid: usize) -> bool {
        self.blob_exists(hex) || !self.blob_start(hex, tid)
    }

    pub fn add_image(&self, name: &str, manifest: &str) {
        self.inner
            .lock()
            .unwrap()
            .manifests
            .insert(name.to_string(), manifest.to_string());
    }

    pub fn add_datafile(&self, name: &str, size: i64) {
        self.inner
            .lock()
            .unwrap()
            .datafiles
            .insert(name.to_string(), size);
    }

    pub fn datafiles(&self) -> BTreeMap<String, i64> {
        self.inner.lock().unwrap().datafiles.clone()
    }

    pub fn manifests(&self) -> BTreeMap<String, String> {
        self.inner.lock().unwrap().manifests.clone()
    }

    pub fn manifest_for(&self, reference: &str) -> Option<String> {
        self.inner.lock().unwrap().manifests.get(reference).cloned()
    }

    pub fn blob_owners(&self, hex: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .blobs
            .get(hex)
            .cloned()
            .unwrap_or_default()
    }

    /// Seed `blobs` from a reference meta file so an incremental save
    /// skips everything the referenced archive already carries.
    pub fn seed_from(&self, reference: &CompressionMetadata, inc_basename: &str) {
        let marker = format!("https://last.img/skip/it:{}", inc_basename);
        let hexes: Vec<String> = reference
            .inner
            .lock()
            .unwrap()
            .blobs
            .keys()
            .cloned()
            .collect();
        for hex in hexes {
            self.blob_done(&hex, &marker);
        }
    }

    /// Upload preflight: every datafile must exist with its recorded size.
    pub fn verify_datafiles(&self, pathname: &Path) -> Result<()> {
        for (name, size) in self.datafiles() {
            let path = pathname.join(&name);
            let meta = std::fs::metadata(&path).map_err(|_| {
                TransmitError::Config(format!("datafile {} missing", path.display()))
            })?;
            if meta.len() as i64 != size {
                return Err(TransmitError::Integrity(format!(
                    "datafile {} mismatch in size, origin: {}, now: {}",
                    path.display(),
                    size,
                    meta.len()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_granted_once() {
        let meta = CompressionMetadata::new("tar");
        assert!(meta.blob_start("aaa", 0));
        assert!(!meta.blob_start("aaa", 1));
        assert!(!meta.blob_start("aaa", 0));
    }

    #[test]
    fn test_skip_predicate() {
        let meta = CompressionMetadata::new("tar");
        // first worker wins the reservation
        assert!(!meta.should_skip("aaa", 0));
        // everyone else skips while it is in flight
        assert!(meta.should_skip("aaa", 1));

        meta.blob_done("aaa", "hub.x.io/ns/img:1");
        meta.clear_doing(0);
        // done blobs keep skipping even after the reservation is released
        assert!(meta.should_skip("aaa", 2));
        assert_eq!(meta.blob_owners("aaa"), vec!["hub.x.io/ns/img:1"]);
    }

    #[test]
    fn test_clear_doing_releases_reservations() {
        let meta = CompressionMetadata::new("tar");
        assert!(meta.blob_start("aaa", 3));
        assert!(meta.blob_start("bbb", 3));
        assert!(meta.blob_start("ccc", 4));
        meta.clear_doing(3);
        assert!(meta.blob_start("aaa", 5));
        assert!(meta.blob_start("bbb", 5));
        assert!(!meta.blob_start("ccc", 5));
    }

    #[test]
    fn test_multiple_owners_without_duplicates() {
        let meta = CompressionMetadata::new("tar");
        meta.blob_done("shared", "hub.x.io/a:1");
        meta.blob_done("shared", "hub.x.io/b:1");
        meta.blob_done("shared", "hub.x.io/a:1");
        assert_eq!(
            meta.blob_owners("shared"),
            vec!["hub.x.io/a:1", "hub.x.io/b:1"]
        );
    }

    #[test]
    fn test_shared_owner_held_back_until_done() {
        let meta = CompressionMetadata::new("tar");
        assert!(meta.blob_start("aaa", 0));

        // a sibling image skips while the write is in flight; the digest
        // must not become globally done
        meta.blob_shared("aaa", "hub.x.io/ns/two:1");
        assert!(!meta.blob_exists("aaa"));
        assert!(meta.blob_owners("aaa").is_empty());

        // the writer finishes and the held-back owner is promoted
        meta.blob_done("aaa", "hub.x.io/ns/one:1");
        assert!(meta.blob_exists("aaa"));
        assert_eq!(
            meta.blob_owners("aaa"),
            vec!["hub.x.io/ns/one:1", "hub.x.io/ns/two:1"]
        );
    }

    #[test]
    fn test_shared_owner_on_done_blob_is_direct() {
        let meta = CompressionMetadata::new("tar");
        meta.blob_done("aaa", "hub.x.io/ns/one:1");
        meta.blob_shared("aaa", "hub.x.io/ns/two:1");
        meta.blob_shared("aaa", "hub.x.io/ns/two:1");
        assert_eq!(
            meta.blob_owners("aaa"),
            vec!["hub.x.io/ns/one:1", "hub.x.io/ns/two:1"]
        );
    }

    #[test]
    fn test_failed_writer_retries_despite_sibling_skip() {
        let meta = CompressionMetadata::new("tar");
        // worker 0 wins the reservation and starts fetching
        assert!(!meta.should_skip("aaa", 0));
        // worker 1 shares the layer, skips, and records its ownership
        assert!(meta.should_skip("aaa", 1));
        meta.blob_shared("aaa", "hub.x.io/ns/two:1");

        // worker 0's fetch fails before a byte is written; teardown
        // releases the reservation
        meta.clear_doing(0);
        assert!(!meta.blob_exists("aaa"));

        // the retry pass must fetch again, not skip on the sibling's record
        assert!(!meta.should_skip("aaa", 0));
        meta.blob_done("aaa", "hub.x.io/ns/one:1");
        meta.clear_doing(0);

        assert!(meta.blob_exists("aaa"));
        assert_eq!(
            meta.blob_owners("aaa"),
            vec!["hub.x.io/ns/one:1", "hub.x.io/ns/two:1"]
        );
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("work_0.tar"), vec![0u8; 42]).unwrap();

        let meta = CompressionMetadata::new("tar");
        meta.add_datafile("work_0.tar", 0);
        meta.add_image("hub.x.io/ns/img:1", "{\"layers\":[]}");
        meta.blob_done("aaa", "hub.x.io/ns/img:1");
        assert!(meta.blob_start("inflight", 0));

        let meta_file = meta.save(dir.path(), "work").unwrap();
        assert_eq!(meta_file, dir.path().join("work_meta.yaml"));

        let loaded = CompressionMetadata::load(&meta_file).unwrap();
        assert_eq!(loaded.compressor(), "tar");
        assert_eq!(loaded.datafiles().get("work_0.tar"), Some(&42));
        assert_eq!(
            loaded.manifest_for("hub.x.io/ns/img:1").unwrap(),
            "{\"layers\":[]}"
        );
        assert!(loaded.blob_exists("aaa"));
        // reservations are transient and never persisted
        assert!(loaded.blob_start("inflight", 9));
        loaded.verify_datafiles(dir.path()).unwrap();
    }

    #[test]
    fn test_incremental_seeding() {
        let reference = CompressionMetadata::new("tar");
        reference.blob_done("h", "hub.x.io/ns/img:1");

        let meta = CompressionMetadata::new("tar");
        meta.seed_from(&reference, "img_full_202106122344_meta.yaml");
        assert!(meta.blob_exists("h"));
        assert_eq!(
            meta.blob_owners("h"),
            vec!["https://last.img/skip/it:img_full_202106122344_meta.yaml"]
        );
    }

    #[test]
    fn test_verify_datafiles_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let meta = CompressionMetadata::new("tar");
        meta.add_datafile("missing.tar", 10);
        assert!(matches!(
            meta.verify_datafiles(dir.path()),
            Err(TransmitError::Config(_))
        ));

        std::fs::write(dir.path().join("missing.tar"), vec![0u8; 5]).unwrap();
        assert!(matches!(
            meta.verify_datafiles(dir.path()),
            Err(TransmitError::Integrity(_))
        ));
    }
}
