//! Workflow Engine
//!
//! Owns Workflow definitions and their Executions:
//! - definition lifecycle (create, update while draft, status changes)
//! - one driving task per live Execution, controlled over a channel
//! - pause, resume and cancel requests answered by the driving task
//! - restart recovery of persisted Executions
//!
//! Workflow and Execution records are persisted through [`RecordStore`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use super::driver::{Control, Driver, Reply};
use super::model::{Execution, ExecutionFilter, ExecutionStatus, FailurePolicy, NodeStatus};
use super::node;
use crate::config::Settings;
use crate::context::CallerContext;
use crate::error::{Error, Result};
use crate::monitoring::EventType;
use crate::pagination::{Page, PageRequest};
use crate::store::RecordStore;
use crate::task::{TaskManager, RESTART_MESSAGE};
use crate::workflow::{validate_definition, ExecutionPlanner, Workflow, WorkflowDefinition, WorkflowStatus};

/// Creates Workflows and drives their Executions.
///
/// Cloning is cheap; clones share the same state. Starting an Execution
/// must happen from within a Tokio runtime.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) tasks: TaskManager,
    workflows: RecordStore<Workflow>,
    pub(crate) executions: RecordStore<Execution>,
    max_running_nodes: usize,
    failure_policy: FailurePolicy,
    state: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    workflows: HashMap<Uuid, (Workflow, u64)>,
    executions: HashMap<Uuid, ExecutionSlot>,
    next_seq: u64,
}

impl EngineState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

struct ExecutionSlot {
    /// Creation order; breaks ties between equal timestamps.
    seq: u64,
    snapshot: watch::Receiver<Execution>,
    /// `None` once the driving task has finished.
    control: Option<mpsc::UnboundedSender<Control>>,
}

impl ExecutionSlot {
    fn current(&self) -> Execution {
        self.snapshot.borrow().clone()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Called by the driving task when it exits.
    pub(crate) fn detach(&self, id: Uuid) {
        if let Some(slot) = self.state().executions.get_mut(&id) {
            slot.control = None;
        }
    }
}

fn visible_workflow<'a>(
    workflows: &'a mut HashMap<Uuid, (Workflow, u64)>,
    ctx: &CallerContext,
    id: Uuid,
) -> Result<&'a mut Workflow> {
    workflows
        .get_mut(&id)
        .map(|(workflow, _)| workflow)
        .filter(|workflow| ctx.can_access(&workflow.owner))
        .ok_or_else(|| Error::not_found("workflow", id.to_string()))
}

fn visible_execution<'a>(
    executions: &'a HashMap<Uuid, ExecutionSlot>,
    ctx: &CallerContext,
    id: Uuid,
) -> Result<&'a ExecutionSlot> {
    executions
        .get(&id)
        .filter(|slot| ctx.can_access(&slot.snapshot.borrow().owner))
        .ok_or_else(|| Error::not_found("execution", id.to_string()))
}

impl WorkflowEngine {
    pub fn new(
        settings: &Settings,
        tasks: TaskManager,
        workflows: RecordStore<Workflow>,
        executions: RecordStore<Execution>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks,
                workflows,
                executions,
                max_running_nodes: settings.max_running_nodes.max(1),
                failure_policy: settings.failure_policy,
                state: Mutex::new(EngineState::default()),
            }),
        }
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.inner.tasks
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state()
    }

    fn persist_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.inner
            .workflows
            .save(&workflow.id.to_string(), workflow)?;
        Ok(())
    }

    /// Validates a definition and stores it as a draft Workflow.
    pub fn create_workflow(&self, ctx: &CallerContext, definition: WorkflowDefinition) -> Result<Workflow> {
        let definition = validate_definition(self.inner.tasks.catalog(), &definition)?;
        let workflow = Workflow::from_definition(&ctx.caller_id, definition);
        self.persist_workflow(&workflow)?;

        let mut state = self.state();
        let seq = state.next_seq();
        state.workflows.insert(workflow.id, (workflow.clone(), seq));
        info!(
            "Workflow '{}' created by {} ({} nodes, {} edges)",
            workflow.name,
            ctx.caller_id,
            workflow.nodes.len(),
            workflow.edges.len()
        );
        Ok(workflow)
    }

    /// Replaces the definition of a draft Workflow.
    pub fn update_workflow(
        &self,
        ctx: &CallerContext,
        id: Uuid,
        definition: WorkflowDefinition,
    ) -> Result<Workflow> {
        let definition = validate_definition(self.inner.tasks.catalog(), &definition)?;

        let mut state = self.state();
        let workflow = visible_workflow(&mut state.workflows, ctx, id)?;
        if workflow.status != WorkflowStatus::Draft {
            return Err(Error::InvalidState(format!(
                "workflow {} is {:?}; only drafts can be edited",
                id, workflow.status
            )));
        }

        let mut updated = workflow.clone();
        updated.name = definition.name;
        updated.description = definition.description;
        updated.nodes = definition.nodes;
        updated.edges = definition.edges;
        updated.updated_at = Utc::now();
        self.persist_workflow(&updated)?;

        *workflow = updated.clone();
        info!("Workflow {} updated", id);
        Ok(updated)
    }

    /// Moves a Workflow between draft, active and archived. Setting the
    /// current status again is a no-op.
    pub fn set_workflow_status(
        &self,
        ctx: &CallerContext,
        id: Uuid,
        status: WorkflowStatus,
    ) -> Result<Workflow> {
        let mut state = self.state();
        let workflow = visible_workflow(&mut state.workflows, ctx, id)?;
        if workflow.status == status {
            return Ok(workflow.clone());
        }
        if !workflow.status.can_transition_to(status) {
            return Err(Error::InvalidState(format!(
                "workflow {} cannot move from {:?} to {:?}",
                id, workflow.status, status
            )));
        }

        let mut updated = workflow.clone();
        updated.status = status;
        updated.updated_at = Utc::now();
        self.persist_workflow(&updated)?;

        *workflow = updated.clone();
        info!("Workflow {} is now {:?}", id, status);
        Ok(updated)
    }

    pub fn get_workflow(&self, ctx: &CallerContext, id: Uuid) -> Result<Workflow> {
        let mut state = self.state();
        visible_workflow(&mut state.workflows, ctx, id).map(|workflow| workflow.clone())
    }

    /// Lists the caller's Workflows, newest first.
    pub fn list_workflows(
        &self,
        ctx: &CallerContext,
        status: Option<WorkflowStatus>,
        page: PageRequest,
    ) -> Page<Workflow> {
        let state = self.state();
        let mut entries: Vec<&(Workflow, u64)> = state
            .workflows
            .values()
            .filter(|(workflow, _)| ctx.can_access(&workflow.owner))
            .filter(|(workflow, _)| status.map_or(true, |s| s == workflow.status))
            .collect();
        entries.sort_by(|(a, a_seq), (b, b_seq)| {
            b.created_at.cmp(&a.created_at).then(b_seq.cmp(a_seq))
        });
        let workflows = entries.into_iter().map(|(workflow, _)| workflow.clone()).collect();
        Page::slice(workflows, page)
    }

    /// Deletes a Workflow and its finished Executions. Refused while one
    /// of its Executions is still live.
    pub fn delete_workflow(&self, ctx: &CallerContext, id: Uuid) -> Result<Workflow> {
        let executions: Vec<Uuid> = {
            let mut state = self.state();
            visible_workflow(&mut state.workflows, ctx, id)?;

            let mut executions = Vec::new();
            for (execution_id, slot) in &state.executions {
                let execution = slot.snapshot.borrow();
                if execution.workflow_id != id {
                    continue;
                }
                if !execution.status.is_terminal() {
                    return Err(Error::InvalidState(format!(
                        "workflow {} has a {} execution ({})",
                        id, execution.status, execution_id
                    )));
                }
                executions.push(*execution_id);
            }
            executions
        };

        for execution_id in executions {
            self.delete_execution(&CallerContext::system(), execution_id)?;
        }

        // `register` checks the Workflow under this same lock
        let mut state = self.state();
        if let Some(execution_id) = state
            .executions
            .iter()
            .find(|(_, slot)| slot.snapshot.borrow().workflow_id == id)
            .map(|(execution_id, _)| *execution_id)
        {
            return Err(Error::InvalidState(format!(
                "workflow {} gained execution {} while being deleted",
                id, execution_id
            )));
        }
        self.inner.workflows.remove(&id.to_string())?;
        let (workflow, _) = state
            .workflows
            .remove(&id)
            .ok_or_else(|| Error::not_found("workflow", id.to_string()))?;
        drop(state);
        info!("Workflow {} deleted", id);
        Ok(workflow)
    }

    /// Creates a draft Workflow from a catalog template.
    pub fn instantiate_template(
        &self,
        ctx: &CallerContext,
        template_id: &str,
        name: Option<String>,
    ) -> Result<Workflow> {
        let template = self
            .inner
            .tasks
            .catalog()
            .template(template_id)
            .ok_or_else(|| Error::not_found("workflow template", template_id))?;

        let mut definition = template.definition.clone();
        if let Some(name) = name.filter(|name| !name.trim().is_empty()) {
            definition.name = name;
        }
        debug!("Instantiating template {} for {}", template_id, ctx.caller_id);
        self.create_workflow(ctx, definition)
    }

    /// Starts an Execution of an active Workflow.
    ///
    /// `params.maxRunningNodes` and `params.failurePolicy` override the
    /// engine defaults for this Execution; root nodes receive all params
    /// as their input.
    pub fn start_execution(
        &self,
        ctx: &CallerContext,
        workflow_id: Uuid,
        params: Map<String, Value>,
    ) -> Result<Execution> {
        let workflow = self.get_workflow(ctx, workflow_id)?;
        if workflow.status != WorkflowStatus::Active {
            return Err(Error::InvalidState(format!(
                "workflow {} is {:?}; activate it before executing",
                workflow_id, workflow.status
            )));
        }

        let max_running = match params.get("maxRunningNodes") {
            None => self.inner.max_running_nodes,
            Some(value) => value
                .as_u64()
                .filter(|n| *n >= 1)
                .map(|n| n as usize)
                .ok_or_else(|| {
                    Error::Validation("maxRunningNodes must be a positive integer".to_string())
                })?,
        };
        let policy = match params.get("failurePolicy") {
            None => self.inner.failure_policy,
            Some(value) => serde_json::from_value(value.clone()).map_err(|_| {
                Error::Validation(format!(
                    "unknown failure policy {}; expected failFast or continue",
                    value
                ))
            })?,
        };

        let planner = ExecutionPlanner::new(&workflow, max_running)?;
        let referenced = node::referenced_files(&workflow, &params);
        let execution = Execution::start(&workflow, &workflow.owner, params, policy, max_running);
        self.inner
            .executions
            .save(&execution.id.to_string(), &execution)?;

        // Released by the driver when it exits
        let pins = self.inner.tasks.pins();
        pins.pin(&referenced);

        let (publisher, snapshot) = watch::channel(execution.clone());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.register(workflow_id, snapshot, control_tx) {
            pins.unpin(&referenced);
            if let Err(e) = self.inner.executions.remove(&execution.id.to_string()) {
                warn!("Failed to remove execution record {}: {}", execution.id, e);
            }
            return Err(e);
        }

        info!(
            "{} started execution {} of workflow {}",
            ctx.caller_id, execution.id, workflow_id
        );
        let driver = Driver::new(
            self.inner.clone(),
            workflow,
            planner,
            execution.clone(),
            publisher,
            control_rx,
            referenced,
        );
        tokio::spawn(driver.run());
        Ok(execution)
    }

    /// Adds a new Execution's slot, provided its Workflow is still active.
    ///
    /// `delete_workflow` checks for slots under the same lock, so an
    /// Execution never outlives its Workflow.
    fn register(
        &self,
        workflow_id: Uuid,
        snapshot: watch::Receiver<Execution>,
        control: mpsc::UnboundedSender<Control>,
    ) -> Result<()> {
        let mut state = self.state();
        let still_active = state
            .workflows
            .get(&workflow_id)
            .map_or(false, |(workflow, _)| workflow.status == WorkflowStatus::Active);
        if !still_active {
            return Err(Error::InvalidState(format!(
                "workflow {} was deleted or deactivated while starting",
                workflow_id
            )));
        }

        let id = snapshot.borrow().id;
        let seq = state.next_seq();
        state.executions.insert(
            id,
            ExecutionSlot {
                seq,
                snapshot,
                control: Some(control),
            },
        );
        Ok(())
    }

    /// Stops new nodes from starting; running nodes carry on.
    pub async fn pause_execution(&self, ctx: &CallerContext, id: Uuid) -> Result<Execution> {
        self.request(ctx, id, Control::Pause, "pause").await
    }

    pub async fn resume_execution(&self, ctx: &CallerContext, id: Uuid) -> Result<Execution> {
        self.request(ctx, id, Control::Resume, "resume").await
    }

    /// Cancels a live Execution. Cancelling a finished one returns it
    /// unchanged.
    pub async fn cancel_execution(&self, ctx: &CallerContext, id: Uuid) -> Result<Execution> {
        self.request(ctx, id, Control::Cancel, "cancel").await
    }

    async fn request(
        &self,
        ctx: &CallerContext,
        id: Uuid,
        command: fn(Reply) -> Control,
        action: &str,
    ) -> Result<Execution> {
        let control = {
            let state = self.state();
            visible_execution(&state.executions, ctx, id)?.control.clone()
        };

        if let Some(control) = control {
            let (reply, answer) = oneshot::channel();
            if control.send(command(reply)).is_ok() {
                if let Ok(result) = answer.await {
                    return result;
                }
            }
        }

        // The driving task is gone, so the Execution is final
        let execution = self.get_execution(ctx, id)?;
        debug!("Execution {} has no driver; answering {} from its record", id, action);
        if action == "cancel" {
            Ok(execution)
        } else {
            Err(Error::InvalidState(format!(
                "cannot {} execution {} while it is {}",
                action, id, execution.status
            )))
        }
    }

    pub fn get_execution(&self, ctx: &CallerContext, id: Uuid) -> Result<Execution> {
        let state = self.state();
        visible_execution(&state.executions, ctx, id).map(ExecutionSlot::current)
    }

    /// Lists the caller's Executions, newest first.
    pub fn list_executions(
        &self,
        ctx: &CallerContext,
        filter: ExecutionFilter,
        page: PageRequest,
    ) -> Page<Execution> {
        let state = self.state();
        let mut entries: Vec<(Execution, u64)> = state
            .executions
            .values()
            .map(|slot| (slot.current(), slot.seq))
            .filter(|(execution, _)| ctx.can_access(&execution.owner) && filter.matches(execution))
            .collect();
        entries.sort_by(|(a, a_seq), (b, b_seq)| {
            b.created_at.cmp(&a.created_at).then(b_seq.cmp(a_seq))
        });
        let executions = entries.into_iter().map(|(execution, _)| execution).collect();
        Page::slice(executions, page)
    }

    /// Watches an Execution. Every persisted change is published.
    pub fn subscribe_execution(&self, ctx: &CallerContext, id: Uuid) -> Result<watch::Receiver<Execution>> {
        let state = self.state();
        visible_execution(&state.executions, ctx, id).map(|slot| slot.snapshot.clone())
    }

    /// Resolves once the Execution is terminal.
    pub async fn wait_execution(&self, ctx: &CallerContext, id: Uuid) -> Result<Execution> {
        let mut rx = self.subscribe_execution(ctx, id)?;
        let execution = rx
            .wait_for(|execution| execution.status.is_terminal())
            .await
            .map(|execution| execution.clone())
            .map_err(|_| Error::not_found("execution", id.to_string()))?;
        Ok(execution)
    }

    /// Deletes a finished Execution and the files its nodes wrote.
    pub fn delete_execution(&self, ctx: &CallerContext, id: Uuid) -> Result<Execution> {
        let mut state = self.state();
        let slot = visible_execution(&state.executions, ctx, id)?;
        let execution = slot.current();

        if !execution.status.is_terminal() || slot.control.is_some() {
            return Err(Error::InvalidState(format!(
                "execution {} is {}; cancel it first",
                id, execution.status
            )));
        }
        let pins = self.inner.tasks.pins();
        if let Some(file) = execution
            .owned_artifacts
            .iter()
            .find(|file| pins.is_pinned(file))
        {
            return Err(Error::InvalidState(format!(
                "artifact {} of execution {} is in use",
                file, id
            )));
        }

        self.inner.executions.remove(&id.to_string())?;
        state.executions.remove(&id);
        drop(state);

        self.inner.tasks.owners().release(&execution.owned_artifacts);
        let artifacts = self.inner.tasks.artifacts();
        for file in &execution.owned_artifacts {
            if let Err(e) = artifacts.delete(file) {
                warn!("Could not remove {} of execution {}: {}", file, id, e);
            }
        }
        info!("Execution {} deleted", id);
        Ok(execution)
    }

    /// Loads persisted Workflows and Executions. Executions that were live
    /// when the orchestrator stopped are marked failed. Returns the number
    /// of such Executions.
    pub fn recover(&self) -> Result<usize> {
        let mut workflows = self.inner.workflows.load_all()?;
        workflows.sort_by_key(|workflow| workflow.created_at);
        let mut executions = self.inner.executions.load_all()?;
        executions.sort_by_key(|execution| execution.created_at);

        let mut state = self.state();
        let workflow_count = workflows.len();
        for workflow in workflows {
            let seq = state.next_seq();
            state.workflows.insert(workflow.id, (workflow, seq));
        }

        let execution_count = executions.len();
        let mut interrupted = 0;
        for mut execution in executions {
            if !execution.status.is_terminal() {
                interrupt(&mut execution);
                if let Err(e) = self
                    .inner
                    .executions
                    .save(&execution.id.to_string(), &execution)
                {
                    error!("Failed to persist execution {}: {}", execution.id, e);
                }
                interrupted += 1;
            }
            self.inner.tasks.owners().claim(&execution.owned_artifacts);
            let seq = state.next_seq();
            let (_, snapshot) = watch::channel(execution.clone());
            state.executions.insert(
                execution.id,
                ExecutionSlot {
                    seq,
                    snapshot,
                    control: None,
                },
            );
        }

        info!(
            "Recovered {} workflows and {} executions ({} interrupted)",
            workflow_count, execution_count, interrupted
        );
        Ok(interrupted)
    }

    /// Cancels every live Execution, then stops all Tasks.
    pub async fn shutdown(&self) {
        let live: Vec<Uuid> = {
            let state = self.state();
            state
                .executions
                .iter()
                .filter(|(_, slot)| slot.control.is_some())
                .map(|(id, _)| *id)
                .collect()
        };
        if !live.is_empty() {
            info!("Cancelling {} live executions", live.len());
        }
        let system = CallerContext::system();
        for id in live {
            if let Err(e) = self.cancel_execution(&system, id).await {
                debug!("Execution {} not cancelled: {}", id, e);
            }
        }
        self.inner.tasks.shutdown().await;
    }
}

/// Fails an Execution that was live across a restart.
fn interrupt(execution: &mut Execution) {
    let now = Utc::now();
    for state in execution.node_states.values_mut() {
        match state.status {
            NodeStatus::Running => {
                state.status = NodeStatus::Failed;
                state.error = Some(RESTART_MESSAGE.to_string());
                state.ended_at = Some(now);
            }
            NodeStatus::Pending => {
                state.status = NodeStatus::Skipped;
                state.ended_at = Some(now);
            }
            _ => {}
        }
    }
    execution.status = ExecutionStatus::Failed;
    execution.error = Some(RESTART_MESSAGE.to_string());
    execution.ended_at = Some(now);
    execution.timeline.execution_event(EventType::Failed);
    execution.refresh_progress();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::execution::driver::CANCELLED;
    use crate::task::testing::FakeTools;
    use crate::task::{Task, TaskStatus};
    use crate::workflow::{Edge, NodeDefinition};
    use serde_json::json;
    use std::time::Duration;

    fn alice() -> CallerContext {
        CallerContext::user("alice")
    }

    fn engine(tools: &FakeTools) -> WorkflowEngine {
        engine_with(tools, RecordStore::ephemeral(), RecordStore::ephemeral())
    }

    fn engine_with(
        tools: &FakeTools,
        workflows: RecordStore<Workflow>,
        executions: RecordStore<Execution>,
    ) -> WorkflowEngine {
        WorkflowEngine::new(&tools.settings, tools.manager(), workflows, executions)
    }

    fn scan(id: &str, target: &str) -> NodeDefinition {
        NodeDefinition::new(id, "xmap_scan").with_config(json!({ "targetaddress": target }))
    }

    /// xmap scan -> address extraction -> published file
    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new("discovery")
            .node(scan("scan", "2001:db8::10"))
            .node(NodeDefinition::new("extract", "xmap_json_extract"))
            .node(
                NodeDefinition::new("output", "file_output")
                    .with_config(json!({ "fileName": "addresses" })),
            )
            .chain(&["scan", "extract", "output"])
    }

    fn active(engine: &WorkflowEngine, definition: WorkflowDefinition) -> Workflow {
        let workflow = engine.create_workflow(&alice(), definition).unwrap();
        engine
            .set_workflow_status(&alice(), workflow.id, WorkflowStatus::Active)
            .unwrap()
    }

    async fn done(engine: &WorkflowEngine, id: Uuid) -> Execution {
        tokio::time::timeout(Duration::from_secs(10), engine.wait_execution(&alice(), id))
            .await
            .expect("execution did not finish in time")
            .unwrap()
    }

    async fn node_running(engine: &WorkflowEngine, id: Uuid, node_id: &str) -> Execution {
        let mut rx = engine.subscribe_execution(&alice(), id).unwrap();
        let wanted = node_id.to_string();
        tokio::time::timeout(
            Duration::from_secs(10),
            rx.wait_for(|execution| {
                execution
                    .node(&wanted)
                    .map_or(false, |state| state.status == NodeStatus::Running && state.task_id.is_some())
            }),
        )
        .await
        .expect("node did not start in time")
        .map(|execution| execution.clone())
        .unwrap()
    }

    async fn task_of(engine: &WorkflowEngine, execution: &Execution, node_id: &str) -> Task {
        let task_id = execution.node(node_id).unwrap().task_id.unwrap();
        crate::task::testing::finished(engine.tasks(), task_id).await
    }

    #[tokio::test]
    async fn test_linear_chain_completes() {
        let tools = FakeTools::new(2);
        let engine = engine(&tools);
        let workflow = active(&engine, linear());

        let started = engine.start_execution(&alice(), workflow.id, Map::new()).unwrap();
        assert_eq!(started.status, ExecutionStatus::Running);
        assert_eq!(started.owner, "alice");

        let execution = done(&engine, started.id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed, "{:?}", execution.error);
        assert_eq!(execution.progress.completed_nodes, 3);
        assert_eq!(execution.progress.percent(), 100);

        let scan = execution.node("scan").unwrap();
        assert_eq!(scan.output.as_ref().unwrap()["type"], "result_file");
        let task = task_of(&engine, &execution, "scan").await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.origin.unwrap().node_id, "scan");

        let output = execution.node("output").unwrap().output_file().unwrap();
        let mut content = String::new();
        std::io::Read::read_to_string(
            &mut engine.tasks().artifacts().open(&output).unwrap(),
            &mut content,
        )
        .unwrap();
        assert_eq!(content.trim(), "2001:db8::1");

        // Started, completed in node order
        let started_order: Vec<_> = execution
            .timeline
            .events()
            .iter()
            .filter(|event| event.event == EventType::Started)
            .filter_map(|event| event.node_id.clone())
            .collect();
        assert_eq!(started_order, vec!["scan", "extract", "output"]);
        assert_eq!(execution.owned_artifacts.len(), 2);
    }

    #[tokio::test]
    async fn test_fail_fast_skips_pending_nodes() {
        let tools = FakeTools::new(2);
        tools.fail("2001:db8::10");
        let engine = engine(&tools);
        let workflow = active(&engine, linear());

        let started = engine.start_execution(&alice(), workflow.id, Map::new()).unwrap();
        let execution = done(&engine, started.id).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.node("scan").unwrap().status, NodeStatus::Failed);
        assert_eq!(execution.node("extract").unwrap().status, NodeStatus::Skipped);
        assert_eq!(execution.node("output").unwrap().status, NodeStatus::Skipped);
        assert!(execution.error.unwrap().contains("scan"));
    }

    #[tokio::test]
    async fn test_continue_policy_keeps_independent_branches() {
        let tools = FakeTools::new(4);
        tools.fail("2001:db8::20");
        let engine = engine(&tools);
        let definition = WorkflowDefinition::new("two branches")
            .node(scan("bad", "2001:db8::20"))
            .node(NodeDefinition::new("bad_extract", "xmap_json_extract"))
            .node(scan("good", "2001:db8::21"))
            .node(NodeDefinition::new("good_extract", "xmap_json_extract"))
            .edge(Edge::new("bad", "bad_extract"))
            .edge(Edge::new("good", "good_extract"));
        let workflow = active(&engine, definition);

        let mut params = Map::new();
        params.insert("failurePolicy".to_string(), json!("continue"));
        let started = engine.start_execution(&alice(), workflow.id, params).unwrap();
        assert_eq!(started.failure_policy, FailurePolicy::Continue);
        let execution = done(&engine, started.id).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.node("bad").unwrap().status, NodeStatus::Failed);
        assert_eq!(execution.node("bad_extract").unwrap().status, NodeStatus::Skipped);
        assert_eq!(execution.node("good").unwrap().status, NodeStatus::Completed);
        assert_eq!(execution.node("good_extract").unwrap().status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_pause_holds_back_new_nodes() {
        let tools = FakeTools::new(2);
        tools.hold("2001:db8::10");
        let engine = engine(&tools);
        let workflow = active(&engine, linear());
        let started = engine.start_execution(&alice(), workflow.id, Map::new()).unwrap();
        node_running(&engine, started.id, "scan").await;

        let paused = engine.pause_execution(&alice(), started.id).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert!(matches!(
            engine.pause_execution(&alice(), started.id).await,
            Err(Error::InvalidState(_))
        ));

        // The running scan finishes, but nothing new starts
        tools.release("2001:db8::10");
        let task = task_of(&engine, &paused, "scan").await;
        assert_eq!(task.status, TaskStatus::Completed);
        let mut rx = engine.subscribe_execution(&alice(), started.id).unwrap();
        let settled = tokio::time::timeout(
            Duration::from_secs(10),
            rx.wait_for(|e| e.node("scan").unwrap().status == NodeStatus::Completed),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(settled.status, ExecutionStatus::Paused);
        assert_eq!(settled.node("extract").unwrap().status, NodeStatus::Pending);

        let resumed = engine.resume_execution(&alice(), started.id).await.unwrap();
        assert_ne!(resumed.status, ExecutionStatus::Paused);
        let execution = done(&engine, started.id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);

        let events: Vec<_> = execution
            .timeline
            .events()
            .iter()
            .filter(|event| event.node_id.is_none())
            .map(|event| event.event)
            .collect();
        assert_eq!(
            events,
            vec![EventType::Paused, EventType::Resumed, EventType::Completed]
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_running_task() {
        let tools = FakeTools::new(2);
        tools.hold("2001:db8::10");
        let engine = engine(&tools);
        let workflow = active(&engine, linear());
        let started = engine.start_execution(&alice(), workflow.id, Map::new()).unwrap();
        let running = node_running(&engine, started.id, "scan").await;

        let cancelled = engine.cancel_execution(&alice(), started.id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        let scan = cancelled.node("scan").unwrap();
        assert_eq!(scan.status, NodeStatus::Failed);
        assert_eq!(scan.error.as_deref(), Some(CANCELLED));
        assert_eq!(cancelled.node("extract").unwrap().status, NodeStatus::Skipped);

        let task = task_of(&engine, &running, "scan").await;
        assert_eq!(task.status, TaskStatus::Cancelled);

        // Idempotent once terminal
        let again = engine.cancel_execution(&alice(), started.id).await.unwrap();
        assert_eq!(again.status, ExecutionStatus::Cancelled);
        tools.release("2001:db8::10");
    }

    #[tokio::test]
    async fn test_node_cap_limits_parallel_scans() {
        let tools = FakeTools::new(4);
        tools.hold("2001:db8::31");
        tools.hold("2001:db8::32");
        let engine = engine(&tools);
        let definition = WorkflowDefinition::new("parallel")
            .node(scan("one", "2001:db8::31"))
            .node(scan("two", "2001:db8::32"));
        let workflow = active(&engine, definition);

        let mut params = Map::new();
        params.insert("maxRunningNodes".to_string(), json!(1));
        let started = engine.start_execution(&alice(), workflow.id, params).unwrap();
        node_running(&engine, started.id, "one").await;
        let current = engine.get_execution(&alice(), started.id).unwrap();
        assert_eq!(current.node("two").unwrap().status, NodeStatus::Pending);
        assert_eq!(current.progress.running_nodes, 1);

        tools.release("2001:db8::31");
        tools.release("2001:db8::32");
        let execution = done(&engine, started.id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_invalid_start_params() {
        let tools = FakeTools::new(1);
        let engine = engine(&tools);
        let workflow = active(&engine, linear());

        let mut params = Map::new();
        params.insert("failurePolicy".to_string(), json!("sometimes"));
        assert!(matches!(
            engine.start_execution(&alice(), workflow.id, params),
            Err(Error::Validation(_))
        ));
        let mut params = Map::new();
        params.insert("maxRunningNodes".to_string(), json!(0));
        assert!(matches!(
            engine.start_execution(&alice(), workflow.id, params),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_cyclic_workflow_rejected() {
        let tools = FakeTools::new(1);
        let engine = engine(&tools);
        let definition = WorkflowDefinition::new("loop")
            .node(NodeDefinition::new("a", "json_custom_extract"))
            .node(NodeDefinition::new("b", "json_custom_extract"))
            .edge(Edge::new("a", "b"))
            .edge(Edge::new("b", "a"));

        let err = engine.create_workflow(&alice(), definition).unwrap_err();
        assert!(matches!(err, Error::InvalidGraph(_)), "{}", err);
        assert_eq!(engine.list_workflows(&alice(), None, PageRequest::default()).pagination.total, 0);
    }

    #[tokio::test]
    async fn test_workflow_status_rules() {
        let tools = FakeTools::new(1);
        let engine = engine(&tools);
        let draft = engine.create_workflow(&alice(), linear()).unwrap();
        assert_eq!(draft.status, WorkflowStatus::Draft);

        // Drafts cannot run
        assert!(matches!(
            engine.start_execution(&alice(), draft.id, Map::new()),
            Err(Error::InvalidState(_))
        ));

        let renamed = engine
            .update_workflow(&alice(), draft.id, linear().with_description("edited"))
            .unwrap();
        assert_eq!(renamed.description, "edited");

        engine
            .set_workflow_status(&alice(), draft.id, WorkflowStatus::Active)
            .unwrap();
        assert!(matches!(
            engine.update_workflow(&alice(), draft.id, linear()),
            Err(Error::InvalidState(_))
        ));

        let archived = engine
            .set_workflow_status(&alice(), draft.id, WorkflowStatus::Archived)
            .unwrap();
        assert_eq!(archived.status, WorkflowStatus::Archived);
        assert!(matches!(
            engine.set_workflow_status(&alice(), draft.id, WorkflowStatus::Draft),
            Err(Error::InvalidState(_))
        ));

        let archived_only = engine.list_workflows(
            &alice(),
            Some(WorkflowStatus::Archived),
            PageRequest::default(),
        );
        assert_eq!(archived_only.items.len(), 1);
    }

    #[tokio::test]
    async fn test_records_are_scoped_to_owner() {
        let tools = FakeTools::new(1);
        let engine = engine(&tools);
        let workflow = engine.create_workflow(&alice(), linear()).unwrap();
        let bob = CallerContext::user("bob");

        assert!(matches!(
            engine.get_workflow(&bob, workflow.id),
            Err(Error::NotFound { .. })
        ));
        assert!(engine.list_workflows(&bob, None, PageRequest::default()).items.is_empty());
        assert!(engine
            .get_workflow(&CallerContext::admin("root"), workflow.id)
            .is_ok());
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let tools = FakeTools::new(2);
        tools.hold("2001:db8::10");
        let engine = engine(&tools);
        let workflow = active(&engine, linear());
        let started = engine.start_execution(&alice(), workflow.id, Map::new()).unwrap();
        node_running(&engine, started.id, "scan").await;

        assert!(matches!(
            engine.delete_execution(&alice(), started.id),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            engine.delete_workflow(&alice(), workflow.id),
            Err(Error::InvalidState(_))
        ));

        tools.release("2001:db8::10");
        let execution = done(&engine, started.id).await;
        let owned = execution.owned_artifacts.clone();
        assert!(!owned.is_empty());

        // The driver releases its pins on the way out
        tokio::time::timeout(Duration::from_secs(10), async {
            while engine.delete_execution(&alice(), started.id).is_err() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        for file in &owned {
            assert!(!engine.tasks().artifacts().exists(file));
        }

        engine.delete_workflow(&alice(), workflow.id).unwrap();
        assert!(matches!(
            engine.get_workflow(&alice(), workflow.id),
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_referenced_files_are_held_while_live() {
        let tools = FakeTools::new(2);
        tools.hold("2001:db8::10");
        let engine = engine(&tools);
        let targets = engine
            .tasks()
            .upload_artifact(&alice(), "targets.txt", b"2001:db8::20\n")
            .unwrap();

        // The input node waits behind the scan for the single node slot
        let workflow = active(
            &engine,
            WorkflowDefinition::new("two roots")
                .node(scan("scan", "2001:db8::10"))
                .node(
                    NodeDefinition::new("input", "file_input")
                        .with_config(json!({ "fileRef": targets.as_str() })),
                ),
        );
        let params = Map::from_iter([("maxRunningNodes".to_string(), json!(1))]);
        let started = engine.start_execution(&alice(), workflow.id, params).unwrap();
        let live = node_running(&engine, started.id, "scan").await;
        assert_eq!(live.node("input").unwrap().status, NodeStatus::Pending);

        assert!(matches!(
            engine.tasks().delete_artifact(&alice(), &targets),
            Err(Error::InvalidState(_))
        ));

        tools.release("2001:db8::10");
        let execution = done(&engine, started.id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed, "{:?}", execution.error);
        assert_eq!(
            execution.node("input").unwrap().output_file().unwrap(),
            targets
        );

        // Free again once the driver has let go
        tokio::time::timeout(Duration::from_secs(10), async {
            while engine.tasks().delete_artifact(&alice(), &targets).is_err() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_execution_cannot_register_against_deleted_workflow() {
        let tools = FakeTools::new(1);
        let engine = engine(&tools);
        let workflow = active(&engine, linear());
        let execution = Execution::start(&workflow, "alice", Map::new(), FailurePolicy::FailFast, 1);

        engine.delete_workflow(&alice(), workflow.id).unwrap();
        let (_, snapshot) = watch::channel(execution.clone());
        let (control, _) = mpsc::unbounded_channel();
        assert!(matches!(
            engine.register(workflow.id, snapshot, control),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            engine.get_execution(&alice(), execution.id),
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_execution_outputs_belong_to_the_execution() {
        let tools = FakeTools::new(2);
        let engine = engine(&tools);
        let workflow = active(&engine, linear());
        let started = engine.start_execution(&alice(), workflow.id, Map::new()).unwrap();
        let execution = done(&engine, started.id).await;
        let output = execution.node("output").unwrap().output_file().unwrap();

        let admin = CallerContext::admin("root");
        assert!(matches!(
            engine.tasks().delete_artifact(&admin, &output),
            Err(Error::InvalidState(_))
        ));

        tokio::time::timeout(Duration::from_secs(10), async {
            while engine.delete_execution(&alice(), started.id).is_err() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(!engine.tasks().owners().is_claimed(&output));
        assert!(!engine.tasks().artifacts().exists(&output));
    }

    #[tokio::test]
    async fn test_template_instantiation() {
        let tools = FakeTools::new(1);
        let engine = engine(&tools);
        let workflow = engine
            .instantiate_template(&alice(), "xmap_only_scan", Some("my scan".to_string()))
            .unwrap();
        assert_eq!(workflow.name, "my scan");
        assert_eq!(workflow.status, WorkflowStatus::Draft);
        assert!(matches!(
            engine.instantiate_template(&alice(), "nope", None),
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_recover_marks_live_executions_failed() {
        let dir = tempfile::tempdir().unwrap();
        let tools = FakeTools::new(1);
        tools.hold("2001:db8::10");

        let workflows = RecordStore::open(dir.path(), "workflows").unwrap();
        let executions = RecordStore::open(dir.path(), "executions").unwrap();
        let first = engine_with(&tools, workflows.clone(), executions.clone());
        let workflow = active(&first, linear());
        let started = first.start_execution(&alice(), workflow.id, Map::new()).unwrap();
        node_running(&first, started.id, "scan").await;

        // A second engine over the same records plays the restarted process
        let second = engine_with(&tools, workflows, executions);
        assert_eq!(second.recover().unwrap(), 1);

        let recovered = second.get_execution(&alice(), started.id).unwrap();
        assert_eq!(recovered.status, ExecutionStatus::Failed);
        assert_eq!(recovered.error.as_deref(), Some(RESTART_MESSAGE));
        assert_eq!(recovered.node("scan").unwrap().status, NodeStatus::Failed);
        assert_eq!(recovered.node("extract").unwrap().status, NodeStatus::Skipped);
        assert_eq!(
            second.get_workflow(&alice(), workflow.id).unwrap().status,
            WorkflowStatus::Active
        );
        assert!(matches!(
            second.pause_execution(&alice(), started.id).await,
            Err(Error::InvalidState(_))
        ));

        first.shutdown().await;
        tools.release("2001:db8::10");
    }
}
