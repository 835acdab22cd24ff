//! Content-addressed local blob cache
//!
//! Blob files are named `<digest-hex><suffix>`, so a hit by name plus size
//! is trusted without re-hashing. Eviction keeps the hot set by mtime:
//! `keep_days` drops stale files, `keep_size` caps the aggregate size in
//! GiB, oldest first.

use crate::error::{Result, TransmitError};
use log::warn;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub struct LocalCache {
    pathname: PathBuf,
    keep_days: u64,
    keep_size: u64,
}

impl LocalCache {
    pub fn new(pathname: impl Into<PathBuf>, keep_days: u64, keep_size: u64) -> Result<LocalCache> {
        let pathname = pathname.into();
        if !pathname.exists() {
            fs::create_dir_all(&pathname)?;
        }
        Ok(LocalCache {
            pathname,
            keep_days,
            keep_size,
        })
    }

    pub fn pathname(&self) -> &Path {
        &self.pathname
    }

    /// Exact name and size match.
    pub fn matched(&self, blob_name: &str, size: i64) -> Option<PathBuf> {
        let path = self.pathname.join(blob_name);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() as i64 == size => Some(path),
            _ => None,
        }
    }

    /// Open a cached blob for reading, bumping its mtime so LRU eviction
    /// keeps the hot set.
    pub fn reuse(&self, blob_name: &str) -> Result<File> {
        let path = self.pathname.join(blob_name);
        let file = File::open(&path)?;
        if let Err(e) = file.set_modified(SystemTime::now()) {
            warn!("touch cache file {} failed: {}", path.display(), e);
        }
        Ok(file)
    }

    /// Wrap `reader` so that everything read from it is also written into
    /// the cache file. The file is flushed when the tee is finished or
    /// dropped.
    pub fn save_stream<R: Read>(&self, blob_name: &str, reader: R) -> Result<CacheTee<R>> {
        let file = File::create(self.pathname.join(blob_name))?;
        Ok(CacheTee {
            inner: reader,
            file: Some(file),
        })
    }

    /// Spool a stream fully into the cache; the copied byte count must
    /// match `expected_size`.
    pub fn save_file<R: Read>(&self, blob_name: &str, mut reader: R, expected_size: i64) -> Result<PathBuf> {
        let path = self.pathname.join(blob_name);
        let mut file = File::create(&path)?;
        let copied = io::copy(&mut reader, &mut file)?;
        file.flush()?;
        if copied as i64 != expected_size {
            return Err(TransmitError::Integrity(format!(
                "cache file {} size mismatch, expected: {}, copied: {}",
                blob_name, expected_size, copied
            )));
        }
        Ok(path)
    }

    /// Apply `keep_days`, then `keep_size`.
    pub fn clean(&self) {
        let mut files: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
        let entries = match fs::read_dir(&self.pathname) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    files.push((entry.path(), meta.len(), mtime));
                }
            }
        }

        if self.keep_days > 0 {
            let limit = Duration::from_secs(self.keep_days * 86400);
            let now = SystemTime::now();
            files.retain(|(path, _, mtime)| {
                let stale = now
                    .duration_since(*mtime)
                    .map(|age| age > limit)
                    .unwrap_or(false);
                if stale {
                    let _ = fs::remove_file(path);
                }
                !stale
            });
        }

        if self.keep_size > 0 {
            Self::apply_size_cap(files, self.keep_size * 1024 * 1024 * 1024);
        }
    }

    fn apply_size_cap(mut files: Vec<(PathBuf, u64, SystemTime)>, cap: u64) {
        // newest first; the newest file survives even when it alone
        // exceeds the cap
        files.sort_by(|a, b| b.2.cmp(&a.2));
        let mut total: u64 = 0;
        for (i, (path, size, _)) in files.iter().enumerate() {
            total += size;
            if i > 0 && total > cap {
                let _ = fs::remove_file(path);
            }
        }
    }
}

/// Reader returned by [`LocalCache::save_stream`]: a tee that writes every
/// chunk into the cache file as the caller consumes the upstream reader.
pub struct CacheTee<R: Read> {
    inner: R,
    file: Option<File>,
}

impl<R: Read> CacheTee<R> {
    /// Flush and close the cache-file side of the tee.
    pub fn finish(mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

impl<R: Read> Read for CacheTee<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            if let Some(file) = &mut self.file {
                file.write_all(&buf[..n])?;
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_match_by_name_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), 0, 0).unwrap();
        cache
            .save_file("abc.raw", Cursor::new(b"hello".to_vec()), 5)
            .unwrap();

        assert!(cache.matched("abc.raw", 5).is_some());
        assert!(cache.matched("abc.raw", 4).is_none());
        assert!(cache.matched("missing.raw", 5).is_none());
    }

    #[test]
    fn test_save_file_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), 0, 0).unwrap();
        let err = cache
            .save_file("abc.raw", Cursor::new(b"hello".to_vec()), 99)
            .unwrap_err();
        assert!(matches!(err, TransmitError::Integrity(_)));
    }

    #[test]
    fn test_stream_tee_fidelity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), 0, 0).unwrap();
        let payload: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();

        let mut tee = cache.save_stream("blob.tar.gz", Cursor::new(payload.clone())).unwrap();
        let mut consumed = Vec::new();
        tee.read_to_end(&mut consumed).unwrap();
        tee.finish().unwrap();
        assert_eq!(consumed, payload);

        // what Reuse yields equals what SaveStream was fed
        let mut reused = Vec::new();
        cache.reuse("blob.tar.gz").unwrap().read_to_end(&mut reused).unwrap();
        assert_eq!(reused, payload);
        assert!(cache.matched("blob.tar.gz", payload.len() as i64).is_some());
    }

    #[test]
    fn test_clean_keep_days() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), 2, 0).unwrap();
        cache.save_file("old.raw", Cursor::new(vec![0u8; 10]), 10).unwrap();
        cache.save_file("new.raw", Cursor::new(vec![0u8; 10]), 10).unwrap();

        let old = File::open(dir.path().join("old.raw")).unwrap();
        old.set_modified(SystemTime::now() - Duration::from_secs(3 * 86400))
            .unwrap();

        cache.clean();
        assert!(!dir.path().join("old.raw").exists());
        assert!(dir.path().join("new.raw").exists());
    }

    #[test]
    fn test_clean_keep_size_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), 0, 0).unwrap();
        let mut files = Vec::new();
        for (i, age) in [(0u32, 10u64), (1, 20), (2, 30)] {
            let name = format!("f{}.raw", i);
            let path = cache
                .save_file(&name, Cursor::new(vec![0u8; 512]), 512)
                .unwrap();
            let mtime = SystemTime::now() - Duration::from_secs(age);
            File::open(&path).unwrap().set_modified(mtime).unwrap();
            files.push((path, 512u64, mtime));
        }

        // cap fits exactly the newest two; the oldest goes
        LocalCache::apply_size_cap(files.clone(), 1024);
        assert!(dir.path().join("f0.raw").exists());
        assert!(dir.path().join("f1.raw").exists());
        assert!(!dir.path().join("f2.raw").exists());

        // a cap below any single file still keeps the newest one
        LocalCache::apply_size_cap(files[..2].to_vec(), 100);
        assert!(dir.path().join("f0.raw").exists());
        assert!(!dir.path().join("f1.raw").exists());
    }
}
