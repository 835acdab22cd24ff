//! Run-scope shared state
//!
//! One [`TaskContext`] is created per invocation and shared by the engine,
//! every task, the ledger and the writers. Mutation is guarded per field:
//! statistics behind one mutex, cancellation on an atomic, the ledger and
//! writers carrying their own locks.

use crate::archive::{ArchiveWriter, CompressedTarWriter, SingleTarWriter};
use crate::cache::LocalCache;
use crate::error::Result;
use crate::history::History;
use crate::metadata::CompressionMetadata;
use crate::squashfs::SquashfsTar;
use crate::temp::LocalTemp;
use crate::util::{format_byte_size, format_seconds};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Outbound notification seam; transports live outside the core.
pub trait Notifier: Send + Sync {
    fn send(&self, message: &str);
}

/// Notifier that lands in the log stream.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, message: &str) {
        log::info!("{}", message);
    }
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub down_bytes: i64,
    pub up_bytes: i64,
    pub down_secs: i64,
    pub up_secs: i64,
    pub parallelism: i64,
    pub total_task: usize,
    pub wait_task: usize,
    pub failed_task: usize,
    pub invalid_task: usize,
    pub sec_start: i64,
    pub sec_end: i64,
}

pub struct TaskContext {
    pub cache: Option<LocalCache>,
    pub temp: LocalTemp,
    pub history: Option<History>,
    pub comp_meta: Option<CompressionMetadata>,
    pub squashfs_tar: Option<SquashfsTar>,
    pub tar_writers: Vec<Mutex<CompressedTarWriter>>,
    pub single_writer: Mutex<Option<SingleTarWriter>>,
    pub notify: Option<Box<dyn Notifier>>,
    cancelled: AtomicBool,
    stats: Mutex<Stats>,
}

impl TaskContext {
    pub fn new(cache: Option<LocalCache>, temp: LocalTemp) -> TaskContext {
        TaskContext {
            cache,
            temp,
            history: None,
            comp_meta: None,
            squashfs_tar: None,
            tar_writers: Vec::new(),
            single_writer: Mutex::new(None),
            notify: None,
            cancelled: AtomicBool::new(false),
            stats: Mutex::new(Stats {
                down_secs: 1,
                up_secs: 1,
                ..Default::default()
            }),
        }
    }

    /// Clear per-phase state between watch iterations.
    pub fn reset(&self) {
        let mut stats = self.stats.lock().unwrap();
        *stats = Stats {
            down_secs: 1,
            up_secs: 1,
            ..Default::default()
        };
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn set_cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn stat_down(&self, bytes: i64, duration: Duration) {
        let mut stats = self.stats.lock().unwrap();
        stats.down_bytes += bytes;
        stats.down_secs += duration.as_secs() as i64;
    }

    pub fn stat_up(&self, bytes: i64, duration: Duration) {
        let mut stats = self.stats.lock().unwrap();
        stats.up_bytes += bytes;
        stats.up_secs += duration.as_secs() as i64;
    }

    pub fn update_current_conn(&self, delta: i64) {
        self.stats.lock().unwrap().parallelism += delta;
    }

    pub fn update_total_task(&self, n: usize) {
        self.stats.lock().unwrap().total_task = n;
    }

    pub fn total_task(&self) -> usize {
        self.stats.lock().unwrap().total_task
    }

    pub fn update_wait_task(&self, n: usize) {
        self.stats.lock().unwrap().wait_task = n;
    }

    pub fn update_failed_task(&self, n: usize) {
        self.stats.lock().unwrap().failed_task = n;
    }

    pub fn update_invalid_task(&self, n: usize) {
        self.stats.lock().unwrap().invalid_task = n;
    }

    pub fn update_sec_start(&self, n: i64) {
        self.stats.lock().unwrap().sec_start = n;
    }

    pub fn update_sec_end(&self, n: i64) {
        self.stats.lock().unwrap().sec_end = n;
    }

    pub fn stats(&self) -> Stats {
        self.stats.lock().unwrap().clone()
    }

    /// Aggregate one-line status for the reporter.
    pub fn status_line(&self) -> String {
        let s = self.stats.lock().unwrap();
        let total_sec = if s.sec_start > 0 {
            if s.sec_end > 0 {
                s.sec_end - s.sec_start
            } else {
                chrono::Local::now().timestamp() - s.sec_start
            }
        } else {
            0
        };
        let success = s
            .total_task
            .saturating_sub(s.wait_task + s.failed_task + s.parallelism.max(0) as usize);
        format!(
            "Invalid:{} Total:{} Success:{} Failed:{} Doing:{} Down:{}/s Up:{}/s, Total Down:{} Up:{} Time:{}",
            s.invalid_task,
            s.total_task,
            success,
            s.failed_task,
            s.parallelism,
            format_byte_size(s.down_bytes / s.down_secs.max(1)),
            format_byte_size(s.up_bytes / s.up_secs.max(1)),
            format_byte_size(s.down_bytes),
            format_byte_size(s.up_bytes),
            format_seconds(total_sec),
        )
    }

    /// The per-worker parallel writer, locked for the duration of one
    /// append. Each writer belongs to exactly one worker id.
    pub fn tar_writer(&self, tid: usize) -> Option<&Mutex<CompressedTarWriter>> {
        self.tar_writers.get(tid)
    }

    /// Close every parallel writer, flushing tar trailers and compressor
    /// frames.
    pub fn close_tar_writers(&self) -> Result<()> {
        for writer in &self.tar_writers {
            writer.lock().unwrap().close()?;
        }
        Ok(())
    }

    /// Stop the single-writer consumer and hand back the archive for
    /// trailing metadata.
    pub fn finish_single_writer(&self) -> Result<Option<Box<dyn ArchiveWriter>>> {
        match self.single_writer.lock().unwrap().take() {
            Some(writer) => Ok(Some(writer.wait()?)),
            None => Ok(None),
        }
    }

    pub fn has_single_writer(&self) -> bool {
        self.single_writer.lock().unwrap().is_some()
    }

    pub fn put_single_file(&self, path: std::path::PathBuf) {
        if let Some(writer) = self.single_writer.lock().unwrap().as_ref() {
            writer.put_file(path);
        }
    }

    pub fn notify(&self, message: &str) {
        if let Some(notify) = &self.notify {
            notify.send(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TaskContext {
        let dir = tempfile::tempdir().unwrap();
        let temp = LocalTemp::new(dir.path().join("temp")).unwrap();
        TaskContext::new(None, temp)
    }

    #[test]
    fn test_cancel_flag() {
        let ctx = context();
        assert!(!ctx.cancelled());
        ctx.set_cancel();
        assert!(ctx.cancelled());
        ctx.reset();
        assert!(!ctx.cancelled());
    }

    #[test]
    fn test_stats_accumulate() {
        let ctx = context();
        ctx.stat_down(1000, Duration::from_secs(2));
        ctx.stat_up(500, Duration::from_secs(1));
        ctx.update_total_task(3);
        let s = ctx.stats();
        assert_eq!(s.down_bytes, 1000);
        assert_eq!(s.up_bytes, 500);
        assert_eq!(s.down_secs, 3);

        let line = ctx.status_line();
        assert!(line.contains("Total:3"));
        assert!(line.contains("Total Down:1000 B Up:500 B"));
    }
}
