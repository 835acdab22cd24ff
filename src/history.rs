//! Transfer history for watch mode
//!
//! Maps every successfully transmitted image reference to the timestamp of
//! its first transmit. The whole map is rewritten to disk on each addition;
//! that is O(N) per write but N stays small in practice.

use crate::error::Result;
use log::error;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

pub struct History {
    filename: PathBuf,
    images: Mutex<BTreeMap<String, String>>,
}

impl History {
    pub fn new(filename: impl Into<PathBuf>) -> Result<History> {
        let filename = filename.into();
        let images = match std::fs::read_to_string(&filename) {
            Ok(text) if !text.trim().is_empty() => serde_yaml::from_str(&text)?,
            Ok(_) => BTreeMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(History {
            filename,
            images: Mutex::new(images),
        })
    }

    /// Record a transmitted reference and persist the whole map.
    pub fn add(&self, url: &str) {
        let mut images = self.images.lock().unwrap();
        images.insert(
            url.to_string(),
            chrono::Local::now().format("%Y%m%d%H%M%S").to_string(),
        );
        match serde_yaml::to_string(&*images) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.filename, text) {
                    error!("write history file failed: {}", e);
                }
            }
            Err(e) => error!("serialize history failed: {}", e),
        }
    }

    pub fn skip(&self, url: &str) -> bool {
        self.images.lock().unwrap().contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.images.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
