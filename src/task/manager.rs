//! Task Manager
//!
//! Owns every Task and drives it through its lifecycle:
//!
//! - validates config and builds the command line at creation
//! - admits Tasks under a global cap, queueing the rest in FIFO order
//! - reacts to process exits and frees slots, pins and queued work
//! - persists every status change and publishes it on a watch channel
//!
//! All mutations go through one mutex; process exits are delivered by one
//! watcher task per running process.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use tokio::sync::watch;
use uuid::Uuid;

use super::command::{self, CommandPaths};
use super::{Task, TaskArtifact, TaskFilter, TaskRequest, TaskStatus};
use crate::artifact::{ArtifactOwners, ArtifactPins, ArtifactStore, FileRef, Upload};
use crate::batch::BatchReport;
use crate::catalog::{validate_config, Catalog};
use crate::config::{Settings, ToolsSettings};
use crate::context::CallerContext;
use crate::error::{Error, Result};
use crate::pagination::{Page, PageRequest};
use crate::process::{ExitReport, LaunchSpec, ProcessHandle, ProcessRunner};
use crate::store::RecordStore;

/// Error message of Tasks that were live when the orchestrator stopped.
pub const RESTART_MESSAGE: &str = "interrupted by orchestrator restart";

/// Latest lifecycle state of a Task, as published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSignal {
    pub status: TaskStatus,
    /// The process has exited (or never started) and its slot is free.
    pub released: bool,
}

/// Creates, schedules, cancels and deletes Tasks.
///
/// Cloning is cheap; clones share the same state. Methods that may start
/// a process must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: Arc<Catalog>,
    artifacts: Arc<dyn ArtifactStore>,
    pins: Arc<ArtifactPins>,
    owners: ArtifactOwners,
    records: RecordStore<Task>,
    uploads: RecordStore<Upload>,
    runner: ProcessRunner,
    tools: ToolsSettings,
    max_running: usize,
    queue_when_busy: bool,
    table: Mutex<TaskTable>,
}

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<Uuid, TaskEntry>,
    queue: VecDeque<Uuid>,
    running: usize,
    next_seq: u64,
    shutting_down: bool,
}

impl TaskTable {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

struct TaskEntry {
    task: Task,
    /// Creation order; breaks ties between equal timestamps.
    seq: u64,
    launch: Option<LaunchSpec>,
    handle: Option<ProcessHandle>,
    released: bool,
    signal: watch::Sender<TaskSignal>,
}

impl TaskEntry {
    fn new(task: Task, seq: u64, launch: Option<LaunchSpec>, released: bool) -> Self {
        let (signal, _) = watch::channel(TaskSignal {
            status: task.status,
            released,
        });
        Self {
            task,
            seq,
            launch,
            handle: None,
            released,
            signal,
        }
    }

    fn notify(&self) {
        self.signal.send_replace(TaskSignal {
            status: self.task.status,
            released: self.released,
        });
    }

    fn finish(&mut self, status: TaskStatus, message: Option<String>) {
        self.task.status = status;
        self.task.ended_at = Some(Utc::now());
        if message.is_some() {
            self.task.error_message = message;
        }
    }
}

fn visible_mut<'a>(
    tasks: &'a mut HashMap<Uuid, TaskEntry>,
    ctx: &CallerContext,
    id: Uuid,
) -> Result<&'a mut TaskEntry> {
    tasks
        .get_mut(&id)
        .filter(|entry| ctx.can_access(&entry.task.owner))
        .ok_or_else(|| Error::not_found("task", id.to_string()))
}

impl TaskManager {
    pub fn new(
        settings: &Settings,
        catalog: Arc<Catalog>,
        artifacts: Arc<dyn ArtifactStore>,
        records: RecordStore<Task>,
        uploads: RecordStore<Upload>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                artifacts,
                pins: Arc::new(ArtifactPins::new()),
                owners: ArtifactOwners::new(),
                records,
                uploads,
                runner: ProcessRunner::new(settings.kill_grace()),
                tools: settings.tools.clone(),
                max_running: settings.max_running_tasks.max(1),
                queue_when_busy: settings.queue_when_busy,
                table: Mutex::new(TaskTable::default()),
            }),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.inner.catalog
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.inner.artifacts
    }

    /// Pins shared with the workflow engine.
    pub fn pins(&self) -> &Arc<ArtifactPins> {
        &self.inner.pins
    }

    /// Uploaders and record claims, shared with the workflow engine.
    pub fn owners(&self) -> &ArtifactOwners {
        &self.inner.owners
    }

    fn table(&self) -> MutexGuard<'_, TaskTable> {
        self.inner.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, task: &Task) {
        if let Err(e) = self.inner.records.save(&task.id.to_string(), task) {
            error!("Failed to persist task {}: {}", task.id, e);
        }
    }

    /// Validates a request, stores its inline inputs and queues the Task.
    ///
    /// The returned Task is already `running` if a slot was free. A tool
    /// that cannot be started yields a `failed` Task, not an error.
    pub fn create_task(&self, ctx: &CallerContext, request: TaskRequest) -> Result<Task> {
        let inner = &self.inner;
        let schema = inner.catalog.tool(request.tool_kind);
        let config = validate_config(&schema.fields, &request.config)?;

        for file in &request.input_file_refs {
            if !inner.artifacts.exists(file) {
                return Err(Error::Validation(format!(
                    "input file '{}' does not exist",
                    file
                )));
            }
        }
        for file in &request.input_files {
            if file.content.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "input file '{}' is empty",
                    file.name
                )));
            }
        }
        if let Some(file) = command::config_file_ref(&config)? {
            if !inner.artifacts.exists(&file) {
                return Err(Error::Validation(format!(
                    "config file '{}' does not exist",
                    file
                )));
            }
        }
        let input_count = request.input_file_refs.len() + request.input_files.len();
        command::check(request.tool_kind, &config, input_count)?;

        let queue = request.queue.unwrap_or(inner.queue_when_busy);
        if !queue {
            self.ensure_free_slot(&self.table())?;
        }

        let mut allocated = Vec::new();
        let (task, launch) = match self.prepare(ctx, &request, config, &mut allocated) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.discard(&allocated);
                return Err(e);
            }
        };
        let id = task.id;

        let mut table = self.table();
        let admitted = if queue {
            Ok(())
        } else {
            self.ensure_free_slot(&table)
        };
        let saved = admitted.and_then(|_| {
            inner
                .records
                .save(&id.to_string(), &task)
                .map_err(Error::from)
        });
        if let Err(e) = saved {
            drop(table);
            self.discard(&allocated);
            return Err(e);
        }

        inner.pins.pin(&task.artifacts());
        inner.owners.claim(&task.owned_artifacts());
        info!(
            "Task {} queued: {} for {}",
            id, request.tool_kind, task.owner
        );
        debug!("Task {} command: {}", id, task.command.join(" "));

        let seq = table.next_seq();
        table.tasks.insert(id, TaskEntry::new(task, seq, Some(launch), false));
        table.queue.push_back(id);
        self.admit(&mut table);

        table
            .tasks
            .get(&id)
            .map(|entry| entry.task.clone())
            .ok_or_else(|| Error::not_found("task", id.to_string()))
    }

    fn ensure_free_slot(&self, table: &TaskTable) -> Result<()> {
        if table.running >= self.inner.max_running {
            return Err(Error::ResourceExhausted(format!(
                "all {} task slots are busy",
                self.inner.max_running
            )));
        }
        Ok(())
    }

    /// Stores inline inputs, reserves the output artifacts and builds the
    /// command line. Every artifact created is recorded in `allocated`.
    fn prepare(
        &self,
        ctx: &CallerContext,
        request: &TaskRequest,
        config: Map<String, Value>,
        allocated: &mut Vec<FileRef>,
    ) -> Result<(Task, LaunchSpec)> {
        let inner = &self.inner;
        let kind = request.tool_kind;
        let tool_name = &inner.catalog.tool(kind).name;

        let mut owned = Vec::new();
        for file in &request.input_files {
            let stored = inner.artifacts.put(&file.name, file.content.as_bytes())?;
            allocated.push(stored.clone());
            owned.push(stored);
        }

        let (result_ref, result_path) = inner.artifacts.reserve(&format!("{}-result.json", tool_name))?;
        allocated.push(result_ref.clone());
        let (log_ref, log_path) = inner.artifacts.reserve(&format!("{}.log", tool_name))?;
        allocated.push(log_ref.clone());

        let inputs: Vec<FileRef> = request
            .input_file_refs
            .iter()
            .chain(owned.iter())
            .cloned()
            .collect();
        let input_paths = inputs
            .iter()
            .map(|file| inner.artifacts.path(file))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let config_file = command::config_file_ref(&config)?
            .map(|file| inner.artifacts.path(&file))
            .transpose()?;

        let args = command::build_args(
            kind,
            &config,
            &CommandPaths {
                inputs: input_paths,
                result: result_path,
                config_file,
            },
        )?;

        let tool = inner.tools.get(kind);
        let (program, prefix) = tool.program();
        let launch = LaunchSpec::new(program, log_path)
            .args(prefix)
            .args(args)
            .env(tool.env.clone())
            .working_dir(tool.working_dir.clone());

        let task = Task {
            id: Uuid::new_v4(),
            owner: ctx.caller_id.clone(),
            tool_kind: kind,
            status: TaskStatus::Queued,
            description: request
                .description
                .clone()
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| format!("{} scan", tool_name)),
            config,
            command: launch.argv(),
            input_file_refs: inputs,
            owned_input_refs: owned,
            result_file_ref: Some(result_ref),
            log_file_ref: Some(log_ref),
            exit_code: None,
            error_message: None,
            origin: request.origin.clone(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        Ok((task, launch))
    }

    fn discard(&self, files: &[FileRef]) {
        for file in files {
            if let Err(e) = self.inner.artifacts.delete(file) {
                warn!("Failed to remove artifact {}: {}", file, e);
            }
        }
    }

    /// Starts queued Tasks while slots are free.
    fn admit(&self, table: &mut TaskTable) {
        if table.shutting_down {
            return;
        }

        while table.running < self.inner.max_running {
            let Some(id) = table.queue.pop_front() else {
                break;
            };
            let Some(entry) = table.tasks.get_mut(&id) else {
                continue;
            };
            if entry.task.status != TaskStatus::Queued {
                continue;
            }
            let Some(launch) = entry.launch.take() else {
                continue;
            };

            match self.inner.runner.spawn(launch) {
                Ok((handle, exit)) => {
                    entry.task.status = TaskStatus::Running;
                    entry.task.started_at = Some(Utc::now());
                    info!("Task {} running (pid {:?})", id, handle.pid());
                    entry.handle = Some(handle);
                    table.running += 1;
                    self.persist(&entry.task);
                    entry.notify();

                    let manager = self.clone();
                    tokio::spawn(async move {
                        let report = exit.wait().await;
                        manager.on_exit(id, report);
                    });
                }
                Err(e) => {
                    warn!("Task {} could not start: {}", id, e);
                    entry.finish(
                        TaskStatus::Failed,
                        Some(Error::ProcessFault(e.to_string()).to_string()),
                    );
                    entry.released = true;
                    self.inner.pins.unpin(&entry.task.artifacts());
                    self.persist(&entry.task);
                    entry.notify();
                }
            }
        }

        if !table.queue.is_empty() {
            debug!("{} tasks waiting for a slot", table.queue.len());
        }
    }

    /// Records a process exit, frees its slot and admits the next Task.
    fn on_exit(&self, id: Uuid, report: ExitReport) {
        let mut table = self.table();
        table.running = table.running.saturating_sub(1);

        if let Some(entry) = table.tasks.get_mut(&id) {
            entry.handle = None;
            if entry.task.status == TaskStatus::Running {
                entry.task.exit_code = report.code;
                if report.success() {
                    entry.finish(TaskStatus::Completed, None);
                    info!("Task {} completed", id);
                } else {
                    let message = match &report.fault {
                        Some(fault) => Error::ProcessFault(fault.clone()).to_string(),
                        None => report.describe(),
                    };
                    warn!("Task {} failed: {}", id, message);
                    entry.finish(TaskStatus::Failed, Some(message));
                }
            } else {
                debug!("Task {} process exited after {}", id, entry.task.status);
            }

            entry.released = true;
            self.inner.pins.unpin(&entry.task.artifacts());
            self.persist(&entry.task);
            entry.notify();
        }

        self.admit(&mut table);
    }

    /// Cancels a queued or running Task. Cancelling a terminal Task returns
    /// its status unchanged.
    pub fn cancel_task(&self, ctx: &CallerContext, id: Uuid) -> Result<TaskStatus> {
        self.cancel_with(ctx, id, "cancelled")
    }

    pub(crate) fn cancel_with(&self, ctx: &CallerContext, id: Uuid, reason: &str) -> Result<TaskStatus> {
        let mut table = self.table();
        let TaskTable { tasks, queue, .. } = &mut *table;
        let entry = visible_mut(tasks, ctx, id)?;

        let status = entry.task.status;
        if status.is_terminal() {
            return Ok(status);
        }

        if status == TaskStatus::Queued {
            queue.retain(|queued| *queued != id);
            entry.launch = None;
            entry.released = true;
            self.inner.pins.unpin(&entry.task.artifacts());
        } else if let Some(handle) = &entry.handle {
            // The slot stays taken until the exit is confirmed
            handle.terminate();
        }

        entry.finish(TaskStatus::Cancelled, Some(reason.to_string()));
        info!("Task {} cancelled ({})", id, reason);
        self.persist(&entry.task);
        entry.notify();
        Ok(TaskStatus::Cancelled)
    }

    pub fn get_task(&self, ctx: &CallerContext, id: Uuid) -> Result<Task> {
        let mut table = self.table();
        visible_mut(&mut table.tasks, ctx, id).map(|entry| entry.task.clone())
    }

    /// Current record of a Task regardless of ownership.
    pub(crate) fn snapshot(&self, id: Uuid) -> Result<Task> {
        self.get_task(&CallerContext::system(), id)
    }

    /// Lists the caller's Tasks, newest first.
    pub fn list_tasks(&self, ctx: &CallerContext, filter: TaskFilter, page: PageRequest) -> Page<Task> {
        let table = self.table();
        let mut entries: Vec<&TaskEntry> = table
            .tasks
            .values()
            .filter(|entry| ctx.can_access(&entry.task.owner) && filter.matches(&entry.task))
            .collect();
        entries.sort_by(|a, b| {
            b.task
                .created_at
                .cmp(&a.task.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        let tasks = entries.into_iter().map(|entry| entry.task.clone()).collect();
        Page::slice(tasks, page)
    }

    /// Deletes a terminal, released Task together with the artifacts it owns.
    pub fn delete_task(&self, ctx: &CallerContext, id: Uuid) -> Result<Task> {
        let mut table = self.table();
        let entry = visible_mut(&mut table.tasks, ctx, id)?;

        if !entry.task.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "task {} is {}; cancel it first",
                id, entry.task.status
            )));
        }
        if !entry.released {
            return Err(Error::InvalidState(format!(
                "task {} is still stopping",
                id
            )));
        }
        let owned = entry.task.owned_artifacts();
        if let Some(file) = owned.iter().find(|file| self.inner.pins.is_pinned(file)) {
            return Err(Error::InvalidState(format!(
                "artifact {} of task {} is in use",
                file, id
            )));
        }

        self.inner.records.remove(&id.to_string())?;
        let removed = table
            .tasks
            .remove(&id)
            .ok_or_else(|| Error::not_found("task", id.to_string()))?;
        drop(table);

        self.inner.owners.release(&owned);
        self.discard(&owned);
        info!("Task {} deleted", id);
        Ok(removed.task)
    }

    pub fn cancel_batch(&self, ctx: &CallerContext, ids: &[String]) -> BatchReport<TaskStatus> {
        ids.iter()
            .map(|raw| {
                let result = Error::parse_id("task", raw).and_then(|id| self.cancel_task(ctx, id));
                (raw.clone(), result)
            })
            .collect()
    }

    pub fn delete_batch(&self, ctx: &CallerContext, ids: &[String]) -> BatchReport<Uuid> {
        ids.iter()
            .map(|raw| {
                let result = Error::parse_id("task", raw)
                    .and_then(|id| self.delete_task(ctx, id).map(|task| task.id));
                (raw.clone(), result)
            })
            .collect()
    }

    /// Watches the lifecycle of a Task. The channel closes when the Task
    /// is deleted.
    pub fn subscribe(&self, id: Uuid) -> Result<watch::Receiver<TaskSignal>> {
        self.table()
            .tasks
            .get(&id)
            .map(|entry| entry.signal.subscribe())
            .ok_or_else(|| Error::not_found("task", id.to_string()))
    }

    /// Resolves once the Task has reached a terminal status.
    pub async fn wait_terminal(&self, id: Uuid) -> Result<Task> {
        self.wait_for(id, |signal| signal.status.is_terminal()).await
    }

    /// Resolves once the Task's process is gone and its slot is free.
    pub async fn wait_released(&self, id: Uuid) -> Result<Task> {
        self.wait_for(id, |signal| signal.released).await
    }

    async fn wait_for(&self, id: Uuid, done: impl FnMut(&TaskSignal) -> bool) -> Result<Task> {
        let mut rx = self.subscribe(id)?;
        rx.wait_for(done)
            .await
            .map(|_| ())
            .map_err(|_| Error::not_found("task", id.to_string()))?;
        self.snapshot(id)
    }

    /// Stores a caller-supplied file for use as a Task input. The file
    /// belongs to the caller until they delete it.
    pub fn upload_artifact(&self, ctx: &CallerContext, name: &str, bytes: &[u8]) -> Result<FileRef> {
        if name.trim().is_empty() {
            return Err(Error::Validation("file name must not be empty".to_string()));
        }
        if bytes.is_empty() {
            return Err(Error::Validation(format!("file '{}' is empty", name)));
        }
        let inner = &self.inner;
        let file = inner.artifacts.put(name, bytes)?;
        let upload = Upload {
            file_ref: file.clone(),
            owner: ctx.caller_id.clone(),
            size: bytes.len(),
            created_at: Utc::now(),
        };
        if let Err(e) = inner.uploads.save(file.as_str(), &upload) {
            self.discard(std::slice::from_ref(&file));
            return Err(e.into());
        }
        inner.owners.record_upload(upload);
        info!("{} uploaded {} ({} bytes)", ctx.caller_id, file, bytes.len());
        Ok(file)
    }

    /// Removes an uploaded file.
    ///
    /// Files of other callers are reported missing. Results, logs and
    /// other files owned by a Task or Execution go away with that record,
    /// and files used by a live Task or Execution stay until it ends.
    pub fn delete_artifact(&self, ctx: &CallerContext, file: &FileRef) -> Result<()> {
        let inner = &self.inner;
        let upload = inner.owners.upload(file);
        let visible = match &upload {
            Some(upload) => ctx.can_access(&upload.owner),
            None => ctx.is_admin() || inner.owners.is_claimed(file),
        };
        if !visible || !inner.artifacts.exists(file) {
            return Err(Error::not_found("artifact", file.to_string()));
        }
        if inner.owners.is_claimed(file) {
            return Err(Error::InvalidState(format!(
                "artifact {} belongs to a task or execution; delete that record instead",
                file
            )));
        }
        if inner.pins.is_pinned(file) {
            return Err(Error::InvalidState(format!(
                "artifact {} is in use by a live task or execution",
                file
            )));
        }

        inner.artifacts.delete(file)?;
        inner.uploads.remove(file.as_str())?;
        inner.owners.forget_upload(file);
        info!("{} deleted {}", ctx.caller_id, file);
        Ok(())
    }

    /// Opens the result or log of a Task for download.
    pub fn open_artifact(&self, ctx: &CallerContext, id: Uuid, which: TaskArtifact) -> Result<(FileRef, File)> {
        let task = self.get_task(ctx, id)?;
        let file = match which {
            TaskArtifact::Result => task.result_file_ref,
            TaskArtifact::Log => task.log_file_ref,
        }
        .ok_or_else(|| Error::not_found("artifact", id.to_string()))?;
        let handle = self.inner.artifacts.open(&file)?;
        Ok((file, handle))
    }

    /// Start times of every running Task.
    pub fn running_since(&self) -> Vec<(Uuid, DateTime<Utc>)> {
        self.table()
            .tasks
            .values()
            .filter(|entry| entry.task.status == TaskStatus::Running)
            .filter_map(|entry| entry.task.started_at.map(|at| (entry.task.id, at)))
            .collect()
    }

    /// Loads persisted Tasks. Tasks that were live when the orchestrator
    /// stopped are marked failed. Returns the number of such Tasks.
    pub fn recover(&self) -> Result<usize> {
        let mut records = self.inner.records.load_all()?;
        records.sort_by_key(|task| task.created_at);

        let total = records.len();
        let mut interrupted = 0;
        let mut table = self.table();
        for mut task in records {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Failed;
                task.error_message = Some(RESTART_MESSAGE.to_string());
                task.ended_at = Some(Utc::now());
                self.persist(&task);
                interrupted += 1;
            }
            self.inner.owners.claim(&task.owned_artifacts());
            let seq = table.next_seq();
            table.tasks.insert(task.id, TaskEntry::new(task, seq, None, true));
        }

        for upload in self.inner.uploads.load_all()? {
            if self.inner.artifacts.exists(&upload.file_ref) {
                self.inner.owners.record_upload(upload);
            } else {
                debug!("Upload {} has no stored file; dropping it", upload.file_ref);
                if let Err(e) = self.inner.uploads.remove(upload.file_ref.as_str()) {
                    warn!("Failed to remove upload record {}: {}", upload.file_ref, e);
                }
            }
        }

        info!("Recovered {} tasks ({} interrupted)", total, interrupted);
        Ok(interrupted)
    }

    /// Cancels every live Task and waits until all processes are gone.
    pub async fn shutdown(&self) {
        let live: Vec<Uuid> = {
            let mut table = self.table();
            table.shutting_down = true;
            table
                .tasks
                .values()
                .filter(|entry| !entry.released)
                .map(|entry| entry.task.id)
                .collect()
        };
        if live.is_empty() {
            return;
        }

        info!("Stopping {} live tasks", live.len());
        let system = CallerContext::system();
        for id in &live {
            if let Err(e) = self.cancel_with(&system, *id, "cancelled by orchestrator shutdown") {
                debug!("Task {} not cancelled: {}", id, e);
            }
        }
        for id in live {
            if let Err(e) = self.wait_released(id).await {
                debug!("Task {} not awaited: {}", id, e);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::artifact::FsArtifactStore;
    use crate::task::testing::{finished, FakeTools, XMAP_LINE};
    use crate::task::ToolKind;
    use serde_json::json;
    use std::time::Duration;

    fn scan(target: &str) -> TaskRequest {
        TaskRequest::new(ToolKind::Scanner, json!({ "targetaddress": target }))
    }

    fn alice() -> CallerContext {
        CallerContext::user("alice")
    }

    async fn released(manager: &TaskManager, id: Uuid) -> Task {
        tokio::time::timeout(Duration::from_secs(10), manager.wait_released(id))
            .await
            .expect("task was not released in time")
            .unwrap()
    }

    #[tokio::test]
    async fn test_task_runs_to_completion() {
        let tools = FakeTools::new(2);
        let manager = tools.manager();

        let task = manager
            .create_task(&alice(), scan("2001:db8::1").with_description("probe"))
            .unwrap();
        assert_eq!(task.owner, "alice");
        assert_eq!(task.description, "probe");
        assert_eq!(task.command[0], "/bin/sh");
        assert!(task.command.contains(&"-o".to_string()));
        assert_eq!(task.command.last().unwrap(), "2001:db8::1");

        let done = finished(&manager, task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert!(done.started_at.is_some());
        assert!(done.ended_at >= done.started_at);

        let (_, mut result) = manager
            .open_artifact(&alice(), task.id, TaskArtifact::Result)
            .unwrap();
        let mut content = String::new();
        std::io::Read::read_to_string(&mut result, &mut content).unwrap();
        assert_eq!(content.trim(), XMAP_LINE);

        let (_, mut log) = manager
            .open_artifact(&alice(), task.id, TaskArtifact::Log)
            .unwrap();
        content.clear();
        std::io::Read::read_to_string(&mut log, &mut content).unwrap();
        assert!(content.contains("scanned 2001:db8::1"));
    }

    #[tokio::test]
    async fn test_failing_tool_marks_task_failed() {
        let tools = FakeTools::new(2);
        tools.fail("2001:db8::2");
        let manager = tools.manager();

        let task = manager.create_task(&alice(), scan("2001:db8::2")).unwrap();
        let done = finished(&manager, task.id).await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.exit_code, Some(2));
        let message = done.error_message.unwrap();
        assert!(message.contains("code 2"), "{}", message);
        assert!(message.contains("scan failed"), "{}", message);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_process_fault() {
        let mut tools = FakeTools::new(2);
        tools.settings.tools.scanner = crate::config::ToolSettings::new("/nonexistent/xmap");
        let manager = tools.manager();

        let task = manager.create_task(&alice(), scan("2001:db8::3")).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().starts_with("process fault:"));

        // Failed at start, so deletable right away
        manager.delete_task(&alice(), task.id).unwrap();
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let tools = FakeTools::new(2);
        let manager = tools.manager();

        let unknown = TaskRequest::new(ToolKind::Scanner, json!({"targetaddress": "2001:db8::1", "evil": 1}));
        assert!(matches!(
            manager.create_task(&alice(), unknown),
            Err(Error::Validation(_))
        ));

        let injected = scan("2001:db8::1; rm -rf /");
        assert!(matches!(
            manager.create_task(&alice(), injected),
            Err(Error::Validation(_))
        ));

        let no_input = TaskRequest::new(ToolKind::Grabber, json!({"module": "http"}));
        assert!(matches!(
            manager.create_task(&alice(), no_input),
            Err(Error::Validation(_))
        ));

        let missing = scan("2001:db8::1").with_input(FileRef::parse("0000-missing.txt").unwrap());
        assert!(matches!(
            manager.create_task(&alice(), missing),
            Err(Error::Validation(_))
        ));

        assert_eq!(manager.list_tasks(&alice(), TaskFilter::default(), PageRequest::default()).pagination.total, 0);
    }

    #[tokio::test]
    async fn test_grabber_with_inline_input() {
        let tools = FakeTools::new(2);
        let manager = tools.manager();

        let request = TaskRequest::new(ToolKind::Grabber, json!({"module": "tls"}))
            .with_inline_input("hosts.txt", "2001:db8::1\n");
        let task = manager.create_task(&alice(), request).unwrap();
        assert_eq!(task.owned_input_refs.len(), 1);
        assert_eq!(task.input_file_refs, task.owned_input_refs);
        assert_eq!(task.command[2], "tls");
        assert!(task.command.contains(&"443".to_string()));

        let done = finished(&manager, task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);

        let input = done.owned_input_refs[0].clone();
        released(&manager, task.id).await;
        manager.delete_task(&alice(), task.id).unwrap();
        assert!(!manager.artifacts().exists(&input));
    }

    #[tokio::test]
    async fn test_cap_of_one_queues_in_order() {
        let tools = FakeTools::new(1);
        tools.hold("2001:db8::10");
        let manager = tools.manager();

        let first = manager.create_task(&alice(), scan("2001:db8::10")).unwrap();
        let second = manager.create_task(&alice(), scan("2001:db8::11")).unwrap();
        assert_eq!(first.status, TaskStatus::Running);
        assert_eq!(second.status, TaskStatus::Queued);

        let mut second_rx = manager.subscribe(second.id).unwrap();
        tools.release("2001:db8::10");

        assert_eq!(finished(&manager, first.id).await.status, TaskStatus::Completed);
        let second_done = finished(&manager, second.id).await;
        assert_eq!(second_done.status, TaskStatus::Completed);
        assert!(second_done.started_at.unwrap() >= first.created_at);
        assert!(second_rx.borrow_and_update().status.is_terminal());
    }

    #[tokio::test]
    async fn test_full_cap_without_queueing() {
        let tools = FakeTools::new(1);
        tools.hold("2001:db8::20");
        let manager = tools.manager();

        let first = manager.create_task(&alice(), scan("2001:db8::20")).unwrap();
        let result = manager.create_task(&alice(), scan("2001:db8::21").queue(false));
        assert!(matches!(result, Err(Error::ResourceExhausted(_))));

        manager.cancel_task(&alice(), first.id).unwrap();
        released(&manager, first.id).await;
        let retry = manager
            .create_task(&alice(), scan("2001:db8::21").queue(false))
            .unwrap();
        assert_eq!(retry.status, TaskStatus::Running);
        finished(&manager, retry.id).await;
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let tools = FakeTools::new(2);
        tools.hold("2001:db8::30");
        let manager = tools.manager();

        let task = manager.create_task(&alice(), scan("2001:db8::30")).unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        assert_eq!(
            manager.cancel_task(&alice(), task.id).unwrap(),
            TaskStatus::Cancelled
        );
        // Terminal at once, but the process may still be exiting
        assert_eq!(
            manager.get_task(&alice(), task.id).unwrap().status,
            TaskStatus::Cancelled
        );

        let done = released(&manager, task.id).await;
        assert_eq!(done.status, TaskStatus::Cancelled);
        assert_eq!(done.error_message.as_deref(), Some("cancelled"));

        // Idempotent
        assert_eq!(
            manager.cancel_task(&alice(), task.id).unwrap(),
            TaskStatus::Cancelled
        );
        manager.delete_task(&alice(), task.id).unwrap();
        assert!(matches!(
            manager.get_task(&alice(), task.id),
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let tools = FakeTools::new(1);
        tools.hold("2001:db8::40");
        let manager = tools.manager();

        let running = manager.create_task(&alice(), scan("2001:db8::40")).unwrap();
        let queued = manager.create_task(&alice(), scan("2001:db8::41")).unwrap();

        manager.cancel_task(&alice(), queued.id).unwrap();
        let signal = *manager.subscribe(queued.id).unwrap().borrow();
        assert_eq!(signal.status, TaskStatus::Cancelled);
        assert!(signal.released);

        let cancelled = manager.get_task(&alice(), queued.id).unwrap();
        assert!(cancelled.started_at.is_none());

        manager.cancel_task(&alice(), running.id).unwrap();
        released(&manager, running.id).await;
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let tools = FakeTools::new(2);
        tools.hold("2001:db8::50");
        let manager = tools.manager();

        let task = manager.create_task(&alice(), scan("2001:db8::50")).unwrap();
        assert!(matches!(
            manager.delete_task(&alice(), task.id),
            Err(Error::InvalidState(_))
        ));

        tools.release("2001:db8::50");
        let done = finished(&manager, task.id).await;
        released(&manager, task.id).await;

        // A pin held elsewhere blocks deletion
        let result = done.result_file_ref.clone().unwrap();
        manager.pins().pin([&result]);
        assert!(matches!(
            manager.delete_task(&alice(), task.id),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            manager.delete_artifact(&alice(), &result),
            Err(Error::InvalidState(_))
        ));
        manager.pins().unpin([&result]);

        manager.delete_task(&alice(), task.id).unwrap();
        assert!(!manager.artifacts().exists(&result));
    }

    #[tokio::test]
    async fn test_ownership_scoping() {
        let tools = FakeTools::new(2);
        let manager = tools.manager();
        let bob = CallerContext::user("bob");

        let task = manager.create_task(&alice(), scan("2001:db8::60")).unwrap();
        assert!(matches!(
            manager.get_task(&bob, task.id),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            manager.cancel_task(&bob, task.id),
            Err(Error::NotFound { .. })
        ));
        assert!(manager
            .list_tasks(&bob, TaskFilter::default(), PageRequest::default())
            .items
            .is_empty());

        let admin = CallerContext::admin("root");
        assert_eq!(manager.get_task(&admin, task.id).unwrap().id, task.id);
        finished(&manager, task.id).await;
    }

    #[tokio::test]
    async fn test_list_order_filter_and_pages() {
        let tools = FakeTools::new(4);
        tools.fail("2001:db8::72");
        let manager = tools.manager();

        let mut ids = Vec::new();
        for n in 0..3 {
            let task = manager
                .create_task(&alice(), scan(&format!("2001:db8::7{}", n)))
                .unwrap();
            ids.push(task.id);
        }
        for id in &ids {
            finished(&manager, *id).await;
        }

        let all = manager.list_tasks(&alice(), TaskFilter::default(), PageRequest::new(1, 2));
        assert_eq!(all.pagination.total, 3);
        assert_eq!(all.pagination.pages, 2);
        assert_eq!(all.items.len(), 2);
        assert_eq!(all.items[0].id, ids[2]);
        assert_eq!(all.items[1].id, ids[1]);

        let failed = manager.list_tasks(
            &alice(),
            TaskFilter {
                status: Some(TaskStatus::Failed),
                tool_kind: None,
            },
            PageRequest::default(),
        );
        assert_eq!(failed.items.len(), 1);
        assert_eq!(failed.items[0].id, ids[2]);
    }

    #[tokio::test]
    async fn test_pages_cover_every_task_once() {
        let tools = FakeTools::new(4);
        let manager = tools.manager();

        let mut created = std::collections::HashSet::new();
        for n in 0..7 {
            let task = manager
                .create_task(&alice(), scan(&format!("2001:db8::a{}", n)))
                .unwrap();
            created.insert(task.id);
        }

        let first = manager.list_tasks(&alice(), TaskFilter::default(), PageRequest::new(1, 3));
        assert_eq!(first.pagination.total, 7);
        assert_eq!(first.pagination.pages, 3);

        let mut seen = Vec::new();
        for page in 1..=first.pagination.pages {
            let listed = manager.list_tasks(&alice(), TaskFilter::default(), PageRequest::new(page, 3));
            assert_eq!(listed.pagination.total, 7);
            seen.extend(listed.items.into_iter().map(|task| task.id));
        }
        assert_eq!(seen.len(), first.pagination.total);
        let distinct: std::collections::HashSet<Uuid> = seen.iter().copied().collect();
        assert_eq!(distinct, created);

        // Past the last page is empty
        let beyond = manager.list_tasks(&alice(), TaskFilter::default(), PageRequest::new(4, 3));
        assert!(beyond.items.is_empty());

        for id in created {
            finished(&manager, id).await;
        }
    }

    #[tokio::test]
    async fn test_batch_operations() {
        let tools = FakeTools::new(2);
        tools.hold("2001:db8::80");
        let manager = tools.manager();

        let task = manager.create_task(&alice(), scan("2001:db8::80")).unwrap();
        let ids = vec![task.id.to_string(), "not-a-uuid".to_string()];

        let report = manager.cancel_batch(&alice(), &ids);
        assert_eq!(report.outcome, crate::batch::BatchOutcome::Partial);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.items[0].value, Some(TaskStatus::Cancelled));
        assert!(!report.items[1].ok);

        released(&manager, task.id).await;
        let report = manager.delete_batch(&alice(), &ids[..1]);
        assert_eq!(report.outcome, crate::batch::BatchOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_upload_and_delete_artifact() {
        let tools = FakeTools::new(2);
        let manager = tools.manager();

        assert!(manager.upload_artifact(&alice(), "empty.txt", b"").is_err());
        let file = manager
            .upload_artifact(&alice(), "targets.txt", b"2001:db8::1\n")
            .unwrap();

        let task = manager
            .create_task(
                &alice(),
                TaskRequest::new(ToolKind::Scanner, json!({})).with_input(file.clone()),
            )
            .unwrap();
        assert!(task.command.contains(&"-w".to_string()));
        finished(&manager, task.id).await;
        released(&manager, task.id).await;

        // Referenced but not owned: survives the Task
        manager.delete_task(&alice(), task.id).unwrap();
        assert!(manager.artifacts().exists(&file));
        manager.delete_artifact(&alice(), &file).unwrap();
        assert!(matches!(
            manager.delete_artifact(&alice(), &file),
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_artifacts_of_others_and_of_records_are_protected() {
        let tools = FakeTools::new(2);
        let manager = tools.manager();
        let bob = CallerContext::user("bob");

        let task = manager.create_task(&alice(), scan("2001:db8::95")).unwrap();
        let done = finished(&manager, task.id).await;
        released(&manager, task.id).await;

        // A retained Task keeps its result and log
        let result = done.result_file_ref.clone().unwrap();
        let log = done.log_file_ref.clone().unwrap();
        for file in [&result, &log] {
            assert!(matches!(
                manager.delete_artifact(&bob, file),
                Err(Error::InvalidState(_))
            ));
            assert!(matches!(
                manager.delete_artifact(&alice(), file),
                Err(Error::InvalidState(_))
            ));
        }
        assert!(manager
            .open_artifact(&alice(), task.id, TaskArtifact::Result)
            .is_ok());

        // Uploads belong to their uploader
        let targets = manager
            .upload_artifact(&alice(), "targets.txt", b"2001:db8::1\n")
            .unwrap();
        assert!(matches!(
            manager.delete_artifact(&bob, &targets),
            Err(Error::NotFound { .. })
        ));
        assert!(manager.artifacts().exists(&targets));
        manager
            .delete_artifact(&CallerContext::admin("root"), &targets)
            .unwrap();
        assert!(!manager.artifacts().exists(&targets));

        // Deleting the Task releases its files along with it
        manager.delete_task(&alice(), task.id).unwrap();
        assert!(!manager.owners().is_claimed(&result));
        assert!(!manager.artifacts().exists(&result));
    }

    #[tokio::test]
    async fn test_recover_marks_interrupted_tasks() {
        let tools = FakeTools::new(2);
        let data = tools.dir.path().join("data");
        let records: RecordStore<Task> = RecordStore::open(&data, "tasks").unwrap();
        let uploads: RecordStore<Upload> = RecordStore::open(&data, "uploads").unwrap();

        let artifacts = FsArtifactStore::new(tools.dir.path().join("artifacts")).unwrap();
        let manager = TaskManager::new(
            &tools.settings,
            Arc::new(Catalog::builtin()),
            Arc::new(artifacts),
            records.clone(),
            uploads.clone(),
        );
        let targets = manager
            .upload_artifact(&alice(), "targets.txt", b"2001:db8::1\n")
            .unwrap();
        let done = manager.create_task(&alice(), scan("2001:db8::90")).unwrap();
        finished(&manager, done.id).await;
        released(&manager, done.id).await;

        // A record left behind by a crash while running
        let mut stale = manager.get_task(&alice(), done.id).unwrap();
        stale.id = Uuid::new_v4();
        stale.status = TaskStatus::Running;
        stale.ended_at = None;
        records.save(&stale.id.to_string(), &stale).unwrap();

        let artifacts = FsArtifactStore::new(tools.dir.path().join("artifacts")).unwrap();
        let restarted = TaskManager::new(
            &tools.settings,
            Arc::new(Catalog::builtin()),
            Arc::new(artifacts),
            records,
            uploads,
        );
        assert_eq!(restarted.recover().unwrap(), 1);

        // Ownership survives the restart
        let bob = CallerContext::user("bob");
        assert_eq!(restarted.owners().upload(&targets).unwrap().owner, "alice");
        assert!(matches!(
            restarted.delete_artifact(&bob, &targets),
            Err(Error::NotFound { .. })
        ));
        let result = done.result_file_ref.clone().unwrap();
        assert!(matches!(
            restarted.delete_artifact(&alice(), &result),
            Err(Error::InvalidState(_))
        ));

        let recovered = restarted.get_task(&alice(), stale.id).unwrap();
        assert_eq!(recovered.status, TaskStatus::Failed);
        assert_eq!(recovered.error_message.as_deref(), Some(RESTART_MESSAGE));
        assert_eq!(
            restarted.get_task(&alice(), done.id).unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let tools = FakeTools::new(1);
        tools.hold("2001:db8::a0");
        let manager = tools.manager();

        let running = manager.create_task(&alice(), scan("2001:db8::a0")).unwrap();
        let queued = manager.create_task(&alice(), scan("2001:db8::a1")).unwrap();

        tokio::time::timeout(Duration::from_secs(10), manager.shutdown())
            .await
            .unwrap();

        for id in [running.id, queued.id] {
            let task = manager.get_task(&alice(), id).unwrap();
            assert_eq!(task.status, TaskStatus::Cancelled);
        }
    }
}
