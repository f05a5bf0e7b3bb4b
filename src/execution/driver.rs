//! Execution Driver
//!
//! One Tokio task per Execution owns its mutable state. It promotes ready
//! nodes, reacts to node-finished events and control requests, applies the
//! failure policy and finishes the Execution. Every change is persisted and
//! published on a watch channel.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use super::engine::Inner;
use super::model::{Execution, ExecutionStatus, NodeStatus};
use super::node::{self, NodeAction, NodeInputs};
use crate::artifact::FileRef;
use crate::batch::BatchReport;
use crate::context::CallerContext;
use crate::error::{Error, Result};
use crate::monitoring::EventType;
use crate::task::{Task, TaskOrigin, TaskStatus};
use crate::workflow::{ExecutionPlanner, Workflow};

/// Error recorded on nodes that were running when their Execution was
/// cancelled, or whose Task ended cancelled.
pub const CANCELLED: &str = "cancelled";

pub(crate) type Reply = oneshot::Sender<Result<Execution>>;

/// Requests from the engine to a running Execution.
pub(crate) enum Control {
    Pause(Reply),
    Resume(Reply),
    Cancel(Reply),
}

/// A node's work finished.
enum NodeEvent {
    Task {
        node_id: String,
        task: Result<Task>,
    },
    Inline {
        node_id: String,
        result: Result<Value>,
    },
}

pub(crate) struct Driver {
    engine: Arc<Inner>,
    workflow: Workflow,
    planner: ExecutionPlanner,
    execution: Execution,
    publisher: watch::Sender<Execution>,
    control: mpsc::UnboundedReceiver<Control>,
    events_tx: mpsc::UnboundedSender<NodeEvent>,
    events: mpsc::UnboundedReceiver<NodeEvent>,
    /// Task watchers and inline jobs that have not reported back yet
    outstanding: usize,
    /// Artifacts this Execution keeps alive until it ends: every file its
    /// configs and params name, then each node output
    pinned: Vec<FileRef>,
}

impl Driver {
    pub fn new(
        engine: Arc<Inner>,
        workflow: Workflow,
        planner: ExecutionPlanner,
        execution: Execution,
        publisher: watch::Sender<Execution>,
        control: mpsc::UnboundedReceiver<Control>,
        pinned: Vec<FileRef>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            engine,
            workflow,
            planner,
            execution,
            publisher,
            control,
            events_tx,
            events,
            outstanding: 0,
            pinned,
        }
    }

    fn id(&self) -> Uuid {
        self.execution.id
    }

    /// Drives the Execution until it is terminal and every node's work
    /// has reported back.
    pub async fn run(mut self) {
        info!(
            "Starting execution {} of workflow '{}' (max running nodes: {}, policy: {:?})",
            self.id(),
            self.workflow.name,
            self.planner.max_running(),
            self.execution.failure_policy
        );

        self.schedule();

        while !self.execution.status.is_terminal() || self.outstanding > 0 {
            tokio::select! {
                Some(command) = self.control.recv() => self.handle_control(command),
                Some(event) = self.events.recv() => {
                    self.outstanding -= 1;
                    self.handle_event(event);
                    self.schedule();
                }
                else => break,
            }
        }

        self.engine.tasks.pins().unpin(&self.pinned);
        self.engine.detach(self.id());

        let durations = self.execution.timeline.durations();
        if let Some((node_id, ms)) = durations.iter().max_by_key(|(_, ms)| **ms) {
            debug!("Execution {}: longest node {} ({} ms)", self.id(), node_id, ms);
        }
        info!(
            "Execution {} finished: {} ({}/{} nodes completed)",
            self.id(),
            self.execution.status,
            self.execution.progress.completed_nodes,
            self.execution.progress.total_nodes
        );
    }

    /// Starts ready nodes while the Execution is running, then finishes it
    /// if nothing is left to do.
    fn schedule(&mut self) {
        while self.execution.status == ExecutionStatus::Running {
            let ready = self.planner.ready_nodes(&self.execution.node_states);
            if ready.is_empty() {
                break;
            }

            let report: BatchReport<NodeStatus> = ready
                .into_iter()
                .map(|node_id| {
                    let result = self.promote(&node_id);
                    (node_id, result)
                })
                .collect();
            debug!(
                "Execution {}: promoted {} nodes, {} failed to start",
                self.id(),
                report.succeeded,
                report.failed
            );
        }

        self.try_finish();
        self.publish();
    }

    /// Starts one node. A node that cannot start is marked failed.
    fn promote(&mut self, node_id: &str) -> Result<NodeStatus> {
        info!("Starting node: {}", node_id);
        self.set_running(node_id);

        match self.start_node(node_id) {
            Ok(status) => Ok(status),
            Err(e) => {
                self.fail_node(node_id, e.to_string());
                Err(e)
            }
        }
    }

    fn start_node(&mut self, node_id: &str) -> Result<NodeStatus> {
        let definition = self
            .workflow
            .node(node_id)
            .cloned()
            .ok_or_else(|| Error::not_found("node", node_id))?;
        let inputs = NodeInputs::gather(&self.workflow, &self.execution, node_id);
        let action = node::prepare(
            &definition,
            &inputs,
            &self.execution.params,
            self.engine.tasks.artifacts(),
        )?;

        match action {
            NodeAction::Complete(output) => {
                self.complete_node(node_id, output);
                Ok(NodeStatus::Completed)
            }
            NodeAction::RunTask(mut request) => {
                request.origin = Some(TaskOrigin {
                    execution_id: self.id(),
                    node_id: node_id.to_string(),
                });
                let owner = CallerContext::user(self.execution.owner.clone());
                let task = self.engine.tasks.create_task(&owner, request)?;
                if let Some(state) = self.execution.node_states.get_mut(node_id) {
                    state.task_id = Some(task.id);
                }
                debug!("Node {} runs as task {}", node_id, task.id);

                if task.status.is_terminal() {
                    // The tool could not be started
                    self.on_task_finished(node_id, Ok(task));
                    return Ok(self.node_status(node_id));
                }

                let tasks = self.engine.tasks.clone();
                let events = self.events_tx.clone();
                let node_id = node_id.to_string();
                self.outstanding += 1;
                tokio::spawn(async move {
                    let task = tasks.wait_terminal(task.id).await;
                    let _ = events.send(NodeEvent::Task { node_id, task });
                });
                Ok(NodeStatus::Running)
            }
            NodeAction::RunInline(job) => {
                let events = self.events_tx.clone();
                let node_id = node_id.to_string();
                self.outstanding += 1;
                tokio::task::spawn_blocking(move || {
                    let result = job.run();
                    let _ = events.send(NodeEvent::Inline { node_id, result });
                });
                Ok(NodeStatus::Running)
            }
        }
    }

    fn node_status(&self, node_id: &str) -> NodeStatus {
        self.execution
            .node(node_id)
            .map_or(NodeStatus::Pending, |state| state.status)
    }

    fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Task { node_id, task } => self.on_task_finished(&node_id, task),
            NodeEvent::Inline { node_id, result } => {
                if self.node_status(&node_id) != NodeStatus::Running {
                    // Cancelled while the transform ran; drop what it wrote
                    if let Ok(output) = result {
                        self.discard_output(&output);
                    }
                    return;
                }
                match result {
                    Ok(output) => {
                        if let Some(file) = file_of(&output) {
                            self.engine.tasks.owners().claim([&file]);
                            self.execution.owned_artifacts.push(file);
                        }
                        self.complete_node(&node_id, output);
                    }
                    Err(e) => self.fail_node(&node_id, e.to_string()),
                }
            }
        }
    }

    fn on_task_finished(&mut self, node_id: &str, task: Result<Task>) {
        if self.node_status(node_id) != NodeStatus::Running {
            debug!("Ignoring late task result for node {}", node_id);
            return;
        }
        match task {
            Ok(task) => match task.status {
                TaskStatus::Completed => self.complete_node(node_id, node::task_output(&task)),
                TaskStatus::Cancelled => self.fail_node(node_id, CANCELLED.to_string()),
                _ => {
                    let message = task
                        .error_message
                        .unwrap_or_else(|| format!("task {} {}", task.id, task.status));
                    self.fail_node(node_id, message)
                }
            },
            Err(e) => self.fail_node(node_id, e.to_string()),
        }
    }

    fn discard_output(&self, output: &Value) {
        if let Some(file) = file_of(output) {
            if let Err(e) = self.engine.tasks.artifacts().delete(&file) {
                warn!("Could not remove {} of cancelled execution {}: {}", file, self.id(), e);
            }
        }
    }

    fn set_running(&mut self, node_id: &str) {
        if let Some(state) = self.execution.node_states.get_mut(node_id) {
            state.status = NodeStatus::Running;
            state.started_at = Some(Utc::now());
        }
        self.execution
            .timeline
            .node_event(node_id, EventType::Started, None);
    }

    fn complete_node(&mut self, node_id: &str, output: Value) {
        if let Some(file) = file_of(&output) {
            self.engine.tasks.pins().pin([&file]);
            self.pinned.push(file);
        }
        if let Some(state) = self.execution.node_states.get_mut(node_id) {
            state.status = NodeStatus::Completed;
            state.output = Some(output);
            state.ended_at = Some(Utc::now());
        }
        self.execution
            .timeline
            .node_event(node_id, EventType::Completed, None);
        info!("Node '{}' completed successfully", node_id);
    }

    /// Marks a node failed and skips the nodes the failure policy rules out.
    fn fail_node(&mut self, node_id: &str, message: String) {
        warn!("Node '{}' failed: {}", node_id, message);
        if let Some(state) = self.execution.node_states.get_mut(node_id) {
            state.status = NodeStatus::Failed;
            state.error = Some(message.clone());
            state.ended_at = Some(Utc::now());
        }
        self.execution
            .timeline
            .node_event(node_id, EventType::Failed, Some(message.clone()));

        if self.execution.status.is_terminal() {
            return;
        }
        if self.execution.error.is_none() {
            self.execution.error = Some(format!("node '{}' failed: {}", node_id, message));
        }

        let skipped = self.planner.nodes_to_skip(
            node_id,
            self.execution.failure_policy,
            &self.execution.node_states,
        );
        let reason = format!("upstream node '{}' failed", node_id);
        for id in skipped {
            self.skip_node(&id, &reason);
        }
    }

    fn skip_node(&mut self, node_id: &str, reason: &str) {
        if let Some(state) = self.execution.node_states.get_mut(node_id) {
            state.status = NodeStatus::Skipped;
            state.error = Some(reason.to_string());
            state.ended_at = Some(Utc::now());
        }
        self.execution
            .timeline
            .node_event(node_id, EventType::Skipped, Some(reason.to_string()));
        debug!("Node {} skipped: {}", node_id, reason);
    }

    /// Ends the Execution once no node is running or can still start.
    fn try_finish(&mut self) {
        if self.execution.status.is_terminal()
            || self.planner.has_work_remaining(&self.execution.node_states)
        {
            return;
        }

        let completed = self
            .execution
            .node_states
            .values()
            .all(|state| state.status == NodeStatus::Completed);
        let (status, event) = if completed {
            (ExecutionStatus::Completed, EventType::Completed)
        } else {
            (ExecutionStatus::Failed, EventType::Failed)
        };
        self.execution.status = status;
        self.execution.timeline.execution_event(event);
        if !completed && self.execution.error.is_none() {
            self.execution.error = Some("one or more nodes did not complete".to_string());
        }
        self.execution.ended_at = Some(Utc::now());
    }

    fn handle_control(&mut self, command: Control) {
        match command {
            Control::Pause(reply) => {
                let result = if self.execution.status == ExecutionStatus::Running {
                    self.execution.status = ExecutionStatus::Paused;
                    self.execution.timeline.execution_event(EventType::Paused);
                    info!("Execution {} paused", self.id());
                    self.publish();
                    Ok(self.execution.clone())
                } else {
                    Err(self.illegal("pause"))
                };
                let _ = reply.send(result);
            }
            Control::Resume(reply) => {
                let result = if self.execution.status == ExecutionStatus::Paused {
                    self.execution.status = ExecutionStatus::Running;
                    self.execution.timeline.execution_event(EventType::Resumed);
                    info!("Execution {} resumed", self.id());
                    self.schedule();
                    Ok(self.execution.clone())
                } else {
                    Err(self.illegal("resume"))
                };
                let _ = reply.send(result);
            }
            Control::Cancel(reply) => {
                if !self.execution.status.is_terminal() {
                    self.cancel();
                }
                let _ = reply.send(Ok(self.execution.clone()));
            }
        }
    }

    fn illegal(&self, action: &str) -> Error {
        Error::InvalidState(format!(
            "cannot {} execution {} while it is {}",
            action,
            self.id(),
            self.execution.status
        ))
    }

    /// Cancels running Tasks, fails running nodes and skips pending ones.
    fn cancel(&mut self) {
        let system = CallerContext::system();
        for node_id in self.execution.nodes_in(NodeStatus::Running) {
            let task_id = self.execution.node(&node_id).and_then(|state| state.task_id);
            if let Some(task_id) = task_id {
                if let Err(e) = self
                    .engine
                    .tasks
                    .cancel_with(&system, task_id, "execution cancelled")
                {
                    error!("Could not cancel task {} of node {}: {}", task_id, node_id, e);
                }
            }
            if let Some(state) = self.execution.node_states.get_mut(&node_id) {
                state.status = NodeStatus::Failed;
                state.error = Some(CANCELLED.to_string());
                state.ended_at = Some(Utc::now());
            }
            self.execution
                .timeline
                .node_event(&node_id, EventType::Failed, Some(CANCELLED.to_string()));
        }
        for node_id in self.execution.nodes_in(NodeStatus::Pending) {
            self.skip_node(&node_id, "execution cancelled");
        }

        self.execution.status = ExecutionStatus::Cancelled;
        self.execution.ended_at = Some(Utc::now());
        self.execution.timeline.execution_event(EventType::Cancelled);
        info!("Execution {} cancelled", self.id());
        self.publish();
    }

    /// Persists the current state and hands it to subscribers.
    fn publish(&mut self) {
        self.execution.refresh_progress();
        if let Err(e) = self
            .engine
            .executions
            .save(&self.id().to_string(), &self.execution)
        {
            error!("Failed to persist execution {}: {}", self.id(), e);
        }
        self.publisher.send_replace(self.execution.clone());
    }
}

fn file_of(output: &Value) -> Option<FileRef> {
    output
        .get("fileRef")
        .and_then(Value::as_str)
        .and_then(|raw| FileRef::parse(raw).ok())
}
