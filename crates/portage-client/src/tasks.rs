//! Background transfer tasks.
//!
//! The manager admits at most `max_parallel` tasks at a time through a
//! semaphore; the rest wait as `Pending`. Tasks publish progress through
//! atomics so observers never contend with the worker, and completion is
//! announced exactly once, to the subscriber registered at construction,
//! only after the task has reached a terminal status. Finished tasks linger
//! for a grace period so late observers can still read the outcome, then
//! the manager forgets them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use portage_proto::ArchiveFormat;

use crate::client::Client;
use crate::error::{Error, Result};
use crate::pack::{download_packed, upload_packed, PackConfig};
use crate::transfer::{download_file, upload_file, CancelFlag, ProgressFn};

/// Default number of tasks allowed to run at once.
pub const DEFAULT_MAX_PARALLEL: usize = 3;

/// How long a terminal task stays visible before the manager drops it.
pub const REMOVAL_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Download,
    Upload,
    Compress,
    Extract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Canceled = 4,
}

impl TaskStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TaskStatus::Running,
            2 => TaskStatus::Completed,
            3 => TaskStatus::Failed,
            4 => TaskStatus::Canceled,
            _ => TaskStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// One background transfer. All observation goes through atomics; the only
/// lock guards the failure message.
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub local_path: PathBuf,
    pub remote_path: String,
    status: AtomicU8,
    /// Fraction done, stored as `f64` bits. Monotonic while running.
    progress_bits: AtomicU64,
    /// MiB/s, stored as `f64` bits.
    speed_bits: AtomicU64,
    total_bytes: AtomicU64,
    error: std::sync::Mutex<Option<String>>,
    cancel: CancelFlag,
}

impl Task {
    fn new(kind: TaskKind, local_path: PathBuf, remote_path: String, total_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            kind,
            local_path,
            remote_path,
            status: AtomicU8::new(TaskStatus::Pending as u8),
            progress_bits: AtomicU64::new(0f64.to_bits()),
            speed_bits: AtomicU64::new(0f64.to_bits()),
            total_bytes: AtomicU64::new(total_bytes),
            error: std::sync::Mutex::new(None),
            cancel: CancelFlag::new(),
        })
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Fraction done in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress_bits.load(Ordering::Relaxed))
    }

    pub fn speed_mib_s(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Relaxed))
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().expect("error lock poisoned").clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            local_path: self.local_path.clone(),
            remote_path: self.remote_path.clone(),
            status: self.status(),
            progress: self.progress(),
            speed_mib_s: self.speed_mib_s(),
            total_bytes: self.total_bytes(),
            error: self.error(),
        }
    }

    fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn set_total(&self, total: u64) {
        self.total_bytes.store(total, Ordering::Relaxed);
    }

    /// Single-writer progress update; the fraction never moves backwards.
    fn record_progress(&self, fraction: f64, speed: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction >= self.progress() {
            self.progress_bits
                .store(fraction.to_bits(), Ordering::Relaxed);
        }
        self.speed_bits.store(speed.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn finish(&self, outcome: &Result<()>) {
        match outcome {
            Ok(()) => {
                self.record_progress(1.0, self.speed_mib_s());
                self.set_status(TaskStatus::Completed);
            }
            Err(Error::Canceled) => self.set_status(TaskStatus::Canceled),
            Err(_) if self.cancel.is_canceled() => self.set_status(TaskStatus::Canceled),
            Err(err) => {
                *self.error.lock().expect("error lock poisoned") = Some(err.to_string());
                self.set_status(TaskStatus::Failed);
            }
        }
    }
}

/// Point-in-time copy of a task's observable state.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: String,
    pub kind: TaskKind,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub speed_mib_s: f64,
    pub total_bytes: u64,
    pub error: Option<String>,
}

/// Called once per task, after it reaches a terminal status.
pub type CompletionFn = Arc<dyn Fn(&Task) + Send + Sync>;

pub struct TaskManager {
    client: Arc<Client>,
    pack: PackConfig,
    tasks: Arc<RwLock<HashMap<String, Arc<Task>>>>,
    semaphore: Arc<Semaphore>,
    on_complete: Option<CompletionFn>,
    removal_grace: Duration,
}

impl TaskManager {
    /// `max_parallel` of zero falls back to the default. The completion
    /// subscriber, if any, is fixed for the manager's lifetime.
    pub fn new(
        client: Arc<Client>,
        pack: PackConfig,
        max_parallel: usize,
        on_complete: Option<CompletionFn>,
    ) -> Self {
        let cap = if max_parallel == 0 { DEFAULT_MAX_PARALLEL } else { max_parallel };
        Self {
            client,
            pack,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            semaphore: Arc::new(Semaphore::new(cap)),
            on_complete,
            removal_grace: REMOVAL_GRACE,
        }
    }

    /// Shorten (or stretch) how long terminal tasks remain visible.
    pub fn with_removal_grace(mut self, grace: Duration) -> Self {
        self.removal_grace = grace;
        self
    }

    fn read_tasks(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Task>>> {
        self.tasks.read().expect("tasks lock poisoned")
    }

    fn write_tasks(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Task>>> {
        self.tasks.write().expect("tasks lock poisoned")
    }

    pub fn get_task(&self, id: &str) -> Option<Arc<Task>> {
        self.read_tasks().get(id).cloned()
    }

    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.read_tasks().values().cloned().collect()
    }

    /// Flag a task for cancellation. Pending tasks never start; running ones
    /// stop at the next chunk or frame boundary. Returns false for unknown
    /// or already-terminal tasks.
    pub fn cancel_task(&self, id: &str) -> bool {
        let Some(task) = self.get_task(id) else {
            return false;
        };
        if task.status().is_terminal() {
            return false;
        }
        debug!(id, "canceling task");
        task.cancel_flag().cancel();
        true
    }

    /// Drop a task from the manager, canceling it first if still active.
    pub fn remove_task(&self, id: &str) -> Option<Arc<Task>> {
        let task = self.write_tasks().remove(id)?;
        if !task.status().is_terminal() {
            task.cancel_flag().cancel();
        }
        Some(task)
    }

    /// Queue a download of `remote` into `local`.
    pub fn add_download_task(&self, remote: &str, local: &Path) -> Arc<Task> {
        let task = Task::new(TaskKind::Download, local.to_path_buf(), remote.to_string(), 0);
        let client = Arc::clone(&self.client);
        let pack = self.pack;
        let remote = remote.to_string();
        let local = local.to_path_buf();
        let progress = progress_writer(&task);
        let cancel = task.cancel_flag();
        let sizer = Arc::clone(&task);
        self.spawn(Arc::clone(&task), async move {
            if let Ok(size) = client.remote_size(&remote).await {
                sizer.set_total(size);
            }
            let result = if pack.enabled {
                download_packed(&client, &remote, &local, &pack, Some(progress), &cancel).await
            } else {
                download_file(&client, &remote, &local, Some(progress), &cancel).await
            };
            if ended_by_cancel(&result, &cancel) {
                // Leave nothing partial behind.
                let _ = tokio::fs::remove_file(&local).await;
            }
            result
        });
        task
    }

    /// Queue an upload of a single local file.
    pub async fn add_upload_task(&self, local: &Path, remote: &str) -> Result<Arc<Task>> {
        let meta = tokio::fs::metadata(local).await?;
        if meta.is_dir() {
            return Err(Error::Config(format!(
                "{} is a directory; use add_upload_folder_task",
                local.display()
            )));
        }
        let task = Task::new(
            TaskKind::Upload,
            local.to_path_buf(),
            remote.to_string(),
            meta.len(),
        );
        let client = Arc::clone(&self.client);
        let pack = self.pack;
        let local = local.to_path_buf();
        let remote = remote.to_string();
        let progress = progress_writer(&task);
        let cancel = task.cancel_flag();
        self.spawn(Arc::clone(&task), async move {
            if pack.enabled {
                upload_packed(&client, &local, &remote, &pack, Some(progress), &cancel).await
            } else {
                upload_file(&client, &local, &remote, Some(progress), &cancel).await
            }
        });
        Ok(task)
    }

    /// Queue an upload of a whole directory tree.
    ///
    /// With packing enabled the tree moves as one archive. Otherwise the
    /// files upload one by one, mirroring the local layout under `remote`;
    /// empty directories are recreated explicitly.
    pub async fn add_upload_folder_task(&self, local: &Path, remote: &str) -> Result<Arc<Task>> {
        let meta = tokio::fs::metadata(local).await?;
        if !meta.is_dir() {
            return Err(Error::Config(format!(
                "{} is not a directory",
                local.display()
            )));
        }
        let root = local.to_path_buf();
        let walk = tokio::task::spawn_blocking(move || walk_local_dir(&root))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))??;

        let task = Task::new(
            TaskKind::Upload,
            local.to_path_buf(),
            remote.to_string(),
            walk.total_bytes,
        );
        let client = Arc::clone(&self.client);
        let pack = self.pack;
        let local = local.to_path_buf();
        let remote = remote.trim_end_matches('/').to_string();
        let progress = progress_writer(&task);
        let cancel = task.cancel_flag();
        let reporter = Arc::clone(&task);
        self.spawn(Arc::clone(&task), async move {
            if pack.enabled {
                return upload_packed(&client, &local, &remote, &pack, Some(progress), &cancel)
                    .await;
            }
            for dir in &walk.dirs {
                cancel.check()?;
                client.mkdir(&format!("{remote}/{dir}")).await?;
            }
            let total = walk.total_bytes.max(1);
            let mut completed: u64 = 0;
            for file in &walk.files {
                cancel.check()?;
                let base = completed;
                let size = file.size;
                let reporter = Arc::clone(&reporter);
                let per_file: ProgressFn = Arc::new(move |fraction, speed| {
                    let done = base + (fraction * size as f64) as u64;
                    reporter.record_progress(done as f64 / total as f64, speed);
                });
                let target = format!("{remote}/{}", file.relative);
                upload_file(&client, &file.path, &target, Some(per_file), &cancel).await?;
                completed += size;
            }
            Ok(())
        });
        Ok(task)
    }

    /// Queue a server-side compress action.
    pub fn add_compress_task(
        &self,
        sources: Vec<String>,
        output: String,
        format: ArchiveFormat,
    ) -> Arc<Task> {
        let task = Task::new(TaskKind::Compress, PathBuf::new(), output.clone(), 0);
        let client = Arc::clone(&self.client);
        let cancel = task.cancel_flag();
        self.spawn(Arc::clone(&task), async move {
            cancel.check()?;
            client.compress_remote(&sources, &output, format).await
        });
        task
    }

    /// Queue a server-side extract action.
    pub fn add_extract_task(&self, archive: String, dest: Option<String>) -> Arc<Task> {
        let task = Task::new(TaskKind::Extract, PathBuf::new(), archive.clone(), 0);
        let client = Arc::clone(&self.client);
        let cancel = task.cancel_flag();
        self.spawn(Arc::clone(&task), async move {
            cancel.check()?;
            client.extract_remote(&archive, dest.as_deref()).await
        });
        task
    }

    /// Register the task and run `job` once the semaphore admits it.
    fn spawn<F>(&self, task: Arc<Task>, job: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.write_tasks().insert(task.id.clone(), Arc::clone(&task));
        let semaphore = Arc::clone(&self.semaphore);
        let tasks = Arc::clone(&self.tasks);
        let on_complete = self.on_complete.clone();
        let grace = self.removal_grace;
        tokio::spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Err(_) => Err(Error::Canceled),
                Ok(_permit) => {
                    if task.cancel_flag().is_canceled() {
                        Err(Error::Canceled)
                    } else {
                        task.set_status(TaskStatus::Running);
                        job.await
                    }
                }
            };
            if let Err(err) = &outcome {
                if !matches!(err, Error::Canceled) {
                    warn!(id = %task.id, error = %err, "task failed");
                }
            }
            task.finish(&outcome);
            if let Some(on_complete) = &on_complete {
                on_complete(&task);
            }
            tokio::time::sleep(grace).await;
            tasks
                .write()
                .expect("tasks lock poisoned")
                .remove(&task.id);
        });
    }
}

/// Whether an outcome counts as a cancellation. Mirrors [`Task::finish`]:
/// a cancel that surfaces as some other error (a closed stream, a failed
/// write) still counts once the flag is set.
fn ended_by_cancel(result: &Result<()>, cancel: &CancelFlag) -> bool {
    match result {
        Ok(()) => false,
        Err(Error::Canceled) => true,
        Err(_) => cancel.is_canceled(),
    }
}

struct LocalFile {
    path: PathBuf,
    relative: String,
    size: u64,
}

struct LocalWalk {
    total_bytes: u64,
    dirs: Vec<String>,
    files: Vec<LocalFile>,
}

/// Collect every file and directory under `root`, with `/`-joined paths
/// relative to it.
fn walk_local_dir(root: &Path) -> std::io::Result<LocalWalk> {
    let mut walk = LocalWalk { total_bytes: 0, dirs: Vec::new(), files: Vec::new() };
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .map_err(std::io::Error::other)?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let meta = entry.metadata()?;
            if meta.is_dir() {
                walk.dirs.push(relative);
                stack.push(path);
            } else if meta.is_file() {
                walk.total_bytes += meta.len();
                walk.files.push(LocalFile { path, relative, size: meta.len() });
            }
        }
    }
    walk.dirs.sort();
    walk.files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(walk)
}

fn progress_writer(task: &Arc<Task>) -> ProgressFn {
    let task = Arc::clone(task);
    Arc::new(move |fraction, speed| task.record_progress(fraction, speed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_manager(max_parallel: usize, on_complete: Option<CompletionFn>) -> TaskManager {
        let client = Arc::new(Client::new("127.0.0.1:1".parse().unwrap(), "pw").unwrap());
        TaskManager::new(client, PackConfig::default(), max_parallel, on_complete)
    }

    fn inject<F>(manager: &TaskManager, job: F) -> Arc<Task>
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let task = Task::new(TaskKind::Download, PathBuf::from("x"), "/x".into(), 0);
        manager.spawn(Arc::clone(&task), job);
        task
    }

    async fn wait_terminal(task: &Arc<Task>) {
        for _ in 0..200 {
            if task.status().is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never reached a terminal status");
    }

    #[tokio::test]
    async fn semaphore_caps_concurrent_running_tasks() {
        let manager = test_manager(2, None);
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                inject(&manager, async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(())
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let running = tasks
            .iter()
            .filter(|t| t.status() == TaskStatus::Running)
            .count();
        let pending = tasks
            .iter()
            .filter(|t| t.status() == TaskStatus::Pending)
            .count();
        assert_eq!(running, 2);
        assert_eq!(pending, 2);

        for task in &tasks {
            wait_terminal(task).await;
            assert_eq!(task.status(), TaskStatus::Completed);
            assert_eq!(task.progress(), 1.0);
        }
    }

    #[tokio::test]
    async fn cancel_stops_a_running_task() {
        let manager = test_manager(1, None);
        let task = {
            let probe = inject(&manager, async { Ok(()) });
            wait_terminal(&probe).await;
            let task = Task::new(TaskKind::Download, PathBuf::from("x"), "/x".into(), 0);
            let cancel = task.cancel_flag();
            manager.spawn(Arc::clone(&task), async move {
                loop {
                    cancel.check()?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            });
            task
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(task.status(), TaskStatus::Running);
        assert!(manager.cancel_task(&task.id));
        wait_terminal(&task).await;
        assert_eq!(task.status(), TaskStatus::Canceled);
        // Already terminal; a second cancel is a no-op.
        assert!(!manager.cancel_task(&task.id));
    }

    #[tokio::test]
    async fn canceled_pending_task_never_runs() {
        let manager = test_manager(1, None);
        let blocker = inject(&manager, async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        });
        let pending = inject(&manager, async {
            panic!("pending job must not run");
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.cancel_task(&pending.id));
        wait_terminal(&pending).await;
        assert_eq!(pending.status(), TaskStatus::Canceled);
        wait_terminal(&blocker).await;
        assert_eq!(blocker.status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn completion_fires_once_after_terminal_status() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let on_complete: CompletionFn = {
            let fired = Arc::clone(&fired);
            let observed = Arc::clone(&observed);
            Arc::new(move |task| {
                fired.fetch_add(1, Ordering::SeqCst);
                observed.lock().unwrap().push(task.status());
            })
        };
        let manager = test_manager(2, Some(on_complete));

        let ok = inject(&manager, async { Ok(()) });
        let failed = inject(&manager, async {
            Err(Error::Config("boom".into()))
        });
        wait_terminal(&ok).await;
        wait_terminal(&failed).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 2);
        let observed = observed.lock().unwrap();
        assert!(observed.iter().all(|s| s.is_terminal()));
        assert_eq!(failed.error().as_deref(), Some("configuration: boom"));
    }

    #[tokio::test]
    async fn terminal_tasks_are_reaped_after_the_grace_period() {
        let manager = test_manager(1, None).with_removal_grace(Duration::from_millis(50));
        let task = inject(&manager, async { Ok(()) });
        wait_terminal(&task).await;
        assert!(manager.get_task(&task.id).is_some());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(manager.get_task(&task.id).is_none());
    }

    #[tokio::test]
    async fn progress_never_moves_backwards() {
        let task = Task::new(TaskKind::Upload, PathBuf::from("x"), "/x".into(), 100);
        task.record_progress(0.5, 1.0);
        task.record_progress(0.3, 2.0);
        assert_eq!(task.progress(), 0.5);
        assert_eq!(task.speed_mib_s(), 2.0);
    }

    #[test]
    fn cancel_surfacing_as_another_error_still_counts_as_canceled() {
        let flag = CancelFlag::new();
        let io_err: Result<()> = Err(Error::Io(std::io::Error::other("stream closed")));

        assert!(!ended_by_cancel(&io_err, &flag));
        flag.cancel();
        assert!(ended_by_cancel(&io_err, &flag));

        assert!(ended_by_cancel(&Err(Error::Canceled), &CancelFlag::new()));
        assert!(!ended_by_cancel(&Ok(()), &flag));
    }

    #[test]
    fn walk_collects_files_and_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        std::fs::write(dir.path().join("a/top.txt"), b"12345").unwrap();
        std::fs::write(dir.path().join("a/b/deep.bin"), vec![0u8; 10]).unwrap();

        let walk = walk_local_dir(dir.path()).unwrap();
        assert_eq!(walk.total_bytes, 15);
        assert_eq!(walk.dirs, vec!["a", "a/b", "empty"]);
        let names: Vec<_> = walk.files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(names, vec!["a/b/deep.bin", "a/top.txt"]);
    }
}
