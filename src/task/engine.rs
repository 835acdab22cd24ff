//! The task engine: a fixed pool of worker threads over FIFO queues
//!
//! Workers pop from `pending` until it runs dry or the run is cancelled.
//! A failing task moves to `failed`; after the first pass the engine makes
//! up to `retries` additional passes, each time moving `failed` back into
//! `pending`. Unparseable references never become tasks at all: they
//! accumulate in `invalid` and are reported at the end.

use crate::error::{Result, TransmitError};
use crate::reference::{insecure_target, RepoUrl};
use crate::registry::{ImageDestination, ImageSource};
use crate::task::{OfflineDownTask, OfflineUploadTask, OnlineTask, Task, TaskContext};
use log::{error, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub struct TaskEngine {
    pending: Mutex<VecDeque<Box<dyn Task>>>,
    failed: Mutex<VecDeque<Box<dyn Task>>>,
    invalid: Mutex<Vec<String>>,
    worker_count: usize,
    retries: usize,
    ctx: Arc<TaskContext>,
}

impl TaskEngine {
    pub fn new(worker_count: usize, retries: usize, ctx: Arc<TaskContext>) -> TaskEngine {
        TaskEngine {
            pending: Mutex::new(VecDeque::new()),
            failed: Mutex::new(VecDeque::new()),
            invalid: Mutex::new(Vec::new()),
            worker_count: worker_count.max(1),
            retries,
            ctx,
        }
    }

    pub fn put_task(&self, task: Box<dyn Task>) {
        self.pending.lock().unwrap().push_back(task);
    }

    pub fn put_invalid_task(&self, url: &str) {
        self.invalid.lock().unwrap().push(url.to_string());
    }

    pub fn task_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn failed_len(&self) -> usize {
        self.failed.lock().unwrap().len()
    }

    pub fn invalid_len(&self) -> usize {
        self.invalid.lock().unwrap().len()
    }

    /// Non-blocking pop: an empty queue means the worker is done.
    fn take_task(&self) -> Option<Box<dyn Task>> {
        self.pending.lock().unwrap().pop_front()
    }

    fn put_failed_task(&self, task: Box<dyn Task>) {
        self.failed.lock().unwrap().push_back(task);
    }

    /// Process every pending task, then retry the failed ones, then
    /// report. Cancellation stops task pickup but the report still runs.
    pub fn run(&self) {
        self.ctx.update_invalid_task(self.invalid_len());
        info!("Start processing tasks, total {} ...", self.task_len());

        self.run_one_pass();

        for _ in 0..self.retries {
            if self.ctx.cancelled() {
                break;
            }
            if self.failed_len() > 0 {
                let mut failed = self.failed.lock().unwrap();
                let mut pending = self.pending.lock().unwrap();
                pending.append(&mut *failed);
                drop(pending);
                drop(failed);
                self.ctx.update_failed_task(0);
            }
            if self.task_len() > 0 {
                info!("Start retrying failed tasks");
                self.run_one_pass();
            }
        }

        info!(
            "Task completed, total {} tasks with {} failed",
            self.ctx.total_task(),
            self.failed_len()
        );
        let failed = self.failed.lock().unwrap();
        if !failed.is_empty() {
            let names: Vec<String> = failed.iter().map(|t| t.name()).collect();
            warn!("Failed tasks:\n{}", names.join("\n"));
        }
        let invalid = self.invalid.lock().unwrap();
        if !invalid.is_empty() {
            warn!(
                "WARNING: there are {} images failed with invalid url (ex: image not exists)",
                invalid.len()
            );
            warn!("Invalid url list:\n{}", invalid.join("\n"));
        }
    }

    fn run_one_pass(&self) {
        std::thread::scope(|scope| {
            for tid in 0..self.worker_count {
                scope.spawn(move || self.worker_loop(tid));
            }
        });
    }

    fn worker_loop(&self, tid: usize) {
        self.ctx.update_current_conn(1);
        loop {
            if self.ctx.cancelled() {
                error!("User cancelled...");
                break;
            }
            let Some(mut task) = self.take_task() else {
                break;
            };
            self.ctx.update_wait_task(self.task_len());
            match task.run(tid) {
                Ok(()) => {
                    let status = task.status();
                    task.callback(true, &status);
                }
                Err(e) => {
                    let message = format!("Task failed with {}", e);
                    error!("{}", message);
                    task.callback(false, &message);
                    self.put_failed_task(task);
                }
            }
            self.ctx.update_failed_task(self.failed_len());
        }
        self.ctx.update_current_conn(-1);
    }

    /// Build a transmit task from one rewritten list line. Construction
    /// failures classify the reference as invalid, never retried.
    pub fn generate_online_task(
        &self,
        img_src: &str,
        user_src: &str,
        pswd_src: &str,
        img_dst: &str,
        user_dst: &str,
        pswd_dst: &str,
        skip_tls_verify: bool,
    ) -> Result<()> {
        let src = match self.parse_source(img_src, user_src, pswd_src, skip_tls_verify) {
            Ok(src) => src,
            Err(e) => return Err(e),
        };

        let dst_url = RepoUrl::parse(img_dst);
        let dst = dst_url.and_then(|u| {
            ImageDestination::new(
                u.registry(),
                u.repository(),
                u.tag(),
                user_dst,
                pswd_dst,
                insecure_target(img_dst, skip_tls_verify),
            )
        });
        let dst = match dst {
            Ok(dst) => dst,
            Err(e) => {
                self.put_invalid_task(img_dst);
                error!("Url {} format error: {}, skipped", img_dst, e);
                return Err(TransmitError::InvalidUrl(img_dst.to_string()));
            }
        };

        info!("Generated a task for {} to {}", src.url(), dst.url());
        self.put_task(Box::new(OnlineTask::new(src, dst, Arc::clone(&self.ctx))));
        Ok(())
    }

    /// Build a save task for one source reference.
    pub fn generate_offline_down_task(
        &self,
        url: &str,
        username: &str,
        password: &str,
        skip_tls_verify: bool,
    ) -> Result<()> {
        let src = self.parse_source(url, username, password, skip_tls_verify)?;
        info!("Generated a download task for {}", src.url());
        self.put_task(Box::new(OfflineDownTask::new(
            Arc::clone(&self.ctx),
            url.to_string(),
            src,
        )));
        Ok(())
    }

    /// Build an upload task; `dst_url` empty means the local runtime
    /// target configured on the task itself.
    pub fn generate_offline_upload_task(
        &self,
        src_url: &str,
        dst_url: &str,
        path: &std::path::Path,
        username: &str,
        password: &str,
        skip_tls_verify: bool,
        load_target: Option<crate::archive::LoadTarget>,
    ) -> Result<()> {
        let dst = if dst_url.is_empty() {
            None
        } else {
            let parsed = RepoUrl::parse(dst_url).and_then(|u| {
                ImageDestination::new(
                    u.registry(),
                    u.repository(),
                    u.tag(),
                    username,
                    password,
                    insecure_target(dst_url, skip_tls_verify),
                )
            });
            match parsed {
                Ok(dst) => Some(dst),
                Err(e) => {
                    self.put_invalid_task(dst_url);
                    error!("Url {} format error: {}, skipped", dst_url, e);
                    return Err(TransmitError::InvalidUrl(dst_url.to_string()));
                }
            }
        };

        info!(
            "Generated an upload task for {}",
            if dst_url.is_empty() { src_url } else { dst_url }
        );
        self.put_task(Box::new(OfflineUploadTask::new(
            Arc::clone(&self.ctx),
            dst,
            src_url.to_string(),
            path.to_path_buf(),
            load_target,
        )));
        Ok(())
    }

    fn parse_source(
        &self,
        url: &str,
        username: &str,
        password: &str,
        skip_tls_verify: bool,
    ) -> Result<ImageSource> {
        let parsed = RepoUrl::parse(url).and_then(|u| {
            ImageSource::new(
                u.registry(),
                u.repository(),
                u.tag(),
                username,
                password,
                insecure_target(url, skip_tls_verify),
            )
        });
        match parsed {
            Ok(src) => Ok(src),
            Err(e) => {
                self.put_invalid_task(url);
                error!("Url {} format error: {}, skipped", url, e);
                Err(TransmitError::InvalidUrl(url.to_string()))
            }
        }
    }
}
