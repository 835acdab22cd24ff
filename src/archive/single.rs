//! Single-stream archive writer
//!
//! Producers enqueue finished blob files; one dedicated consumer thread
//! appends them to the archive in order. `set_quit` closes the producer
//! side; the consumer drains what is left and terminates.

use crate::archive::ArchiveWriter;
use crate::error::{Result, TransmitError};
use log::{debug, error};
use std::collections::VecDeque;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub struct SingleTarWriter {
    queue: Arc<Mutex<VecDeque<PathBuf>>>,
    quit: Arc<AtomicBool>,
    consumer: JoinHandle<Result<Box<dyn ArchiveWriter>>>,
}

impl SingleTarWriter {
    /// Spawn the consumer loop over `writer`.
    pub fn new(writer: Box<dyn ArchiveWriter>) -> SingleTarWriter {
        let queue: Arc<Mutex<VecDeque<PathBuf>>> = Arc::new(Mutex::new(VecDeque::new()));
        let quit = Arc::new(AtomicBool::new(false));

        let consumer_queue = Arc::clone(&queue);
        let consumer_quit = Arc::clone(&quit);
        let consumer = std::thread::spawn(move || {
            let mut writer = writer;
            loop {
                let next = consumer_queue.lock().unwrap().pop_front();
                match next {
                    None => {
                        if consumer_quit.load(Ordering::SeqCst) {
                            break;
                        }
                        std::thread::sleep(Duration::from_secs(1));
                    }
                    Some(path) => {
                        if let Err(e) = Self::append_one(writer.as_mut(), &path) {
                            error!("append {} to archive failed: {}", path.display(), e);
                            return Err(e);
                        }
                        debug!("Put file to archive: {}", path.display());
                    }
                }
            }
            Ok(writer)
        });

        SingleTarWriter {
            queue,
            quit,
            consumer,
        }
    }

    fn append_one(writer: &mut dyn ArchiveWriter, path: &PathBuf) -> Result<()> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len() as i64;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| TransmitError::Io(format!("no file name in {}", path.display())))?;
        writer.append_file_stream(&name, size, &mut file)
    }

    /// Enqueue a finished blob file.
    pub fn put_file(&self, path: PathBuf) {
        self.queue.lock().unwrap().push_back(path);
    }

    /// Mark the producer side closed.
    pub fn set_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    /// Close producers, wait for the consumer to drain, and hand back the
    /// underlying writer so the caller can append trailing metadata before
    /// closing it.
    pub fn wait(self) -> Result<Box<dyn ArchiveWriter>> {
        self.set_quit();
        self.consumer
            .join()
            .map_err(|_| TransmitError::Io("archive consumer thread panicked".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::compression::Compressor;
    use crate::archive::tar_writer::{CompressedTarReader, CompressedTarWriter};

    #[test]
    fn test_queue_drains_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in [("aaa.raw", "first"), ("bbb.raw", "second")] {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        let archive_path = dir.path().join("work.tar");
        let writer = CompressedTarWriter::new(&archive_path, Compressor::Tar).unwrap();

        let single = SingleTarWriter::new(Box::new(writer));
        single.put_file(dir.path().join("aaa.raw"));
        single.put_file(dir.path().join("bbb.raw"));
        let mut writer = single.wait().unwrap();
        writer.close().unwrap();

        let reader = CompressedTarReader::new(&archive_path, Compressor::Tar).unwrap();
        let mut sink = Vec::new();
        let (name, size) = reader.copy_blob_to("aaa", &mut sink).unwrap().unwrap();
        assert_eq!((name.as_str(), size), ("aaa.raw", 5));
        assert_eq!(sink, b"first");

        let reader = CompressedTarReader::new(&archive_path, Compressor::Tar).unwrap();
        let mut sink = Vec::new();
        let (name, _) = reader.copy_blob_to("bbb", &mut sink).unwrap().unwrap();
        assert_eq!(name, "bbb.raw");
        assert_eq!(sink, b"second");
    }
}
