//! Temp store tracking files and directories for end-of-run cleanup

use crate::error::Result;
use log::warn;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct LocalTemp {
    temp_path: PathBuf,
    files: Mutex<Vec<PathBuf>>,
}

impl LocalTemp {
    pub fn new(pathname: impl Into<PathBuf>) -> Result<LocalTemp> {
        let temp_path = pathname.into();
        if !temp_path.exists() {
            fs::create_dir_all(&temp_path)?;
        }
        Ok(LocalTemp {
            temp_path,
            files: Mutex::new(Vec::new()),
        })
    }

    pub fn pathname(&self) -> &Path {
        &self.temp_path
    }

    /// Create and track a working directory.
    pub fn save_path(&self, path: &str) -> Result<PathBuf> {
        let full = self.temp_path.join(path);
        fs::create_dir_all(&full)?;
        self.files.lock().unwrap().push(full.clone());
        Ok(full)
    }

    /// Track an entry created by an external tool (e.g. an unsquashfs
    /// output tree) so `clean` removes it with everything else.
    pub fn track(&self, path: PathBuf) {
        self.files.lock().unwrap().push(path);
    }

    /// Create an empty tracked temp file for the caller to fill.
    pub fn create_file(&self, filename: &str) -> Result<(File, PathBuf)> {
        let full = self.temp_path.join(filename);
        let file = File::create(&full)?;
        self.files.lock().unwrap().push(full.clone());
        Ok((file, full))
    }

    /// Spool a stream into a tracked temp file.
    pub fn save_file<R: Read>(&self, filename: &str, mut reader: R) -> Result<PathBuf> {
        let full = self.temp_path.join(filename);
        let mut file = File::create(&full)?;
        io::copy(&mut reader, &mut file)?;
        self.files.lock().unwrap().push(full.clone());
        Ok(full)
    }

    /// Remove everything this store created.
    pub fn clean(&self) {
        let files = std::mem::take(&mut *self.files.lock().unwrap());
        for f in files {
            let meta = match fs::symlink_metadata(&f) {
                Ok(m) => m,
                Err(e) => {
                    warn!("stat temp entry {} failed: {}", f.display(), e);
                    continue;
                }
            };
            let removed = if meta.is_dir() {
                fs::remove_dir_all(&f)
            } else {
                fs::remove_file(&f)
            };
            if let Err(e) = removed {
                warn!("remove temp entry {} failed: {}", f.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_tracked_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let temp = LocalTemp::new(dir.path().join("temp")).unwrap();

        let d = temp.save_path("work").unwrap();
        std::fs::write(d.join("inner.txt"), b"x").unwrap();
        let f = temp.save_file("blob.raw", Cursor::new(b"data".to_vec())).unwrap();
        assert!(d.is_dir());
        assert_eq!(std::fs::read(&f).unwrap(), b"data");

        temp.clean();
        assert!(!d.exists());
        assert!(!f.exists());
    }

    #[test]
    fn test_untracked_files_survive() {
        let dir = tempfile::tempdir().unwrap();
        let temp = LocalTemp::new(dir.path().join("temp")).unwrap();
        let keep = temp.pathname().join("keep.txt");
        std::fs::write(&keep, b"x").unwrap();
        temp.clean();
        assert!(keep.exists());
    }
}
