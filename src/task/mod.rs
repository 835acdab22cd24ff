//! Units of work and the engine that drives them

pub mod context;
pub mod engine;
pub mod offline_down;
pub mod offline_up;
pub mod online;

pub use context::{LogNotifier, Notifier, TaskContext};
pub use engine::TaskEngine;
pub use offline_down::OfflineDownTask;
pub use offline_up::OfflineUploadTask;
pub use online::OnlineTask;

use crate::error::Result;
use std::time::Duration;

/// One unit of work: transmit, save or upload a single image reference.
pub trait Task: Send {
    fn run(&mut self, tid: usize) -> Result<()>;

    fn name(&self) -> String;

    /// Invoked by the engine with the task's outcome.
    fn callback(&self, _success: bool, _content: &str) {}

    /// Record bytes pulled over the network.
    fn stat_down(&self, _bytes: i64, _duration: Duration) {}

    /// Record bytes pushed over the network.
    fn stat_up(&self, _bytes: i64, _duration: Duration) {}

    fn status(&self) -> String {
        String::new()
    }
}
