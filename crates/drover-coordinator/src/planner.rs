//! The planner: instantiates concrete tasks from a job's templated
//! task list at dispatch time.
//!
//! Invoked whenever a job needs to advance. Reads the template at the
//! job's current position, resolves every embedded expression against
//! the job context, and dispatches by kind: leaves go straight to the
//! `pending` queue, composites persist a structural parent plus its
//! children, and sub-jobs materialize a fresh job.
//!
//! Tasks whose `if` gate evaluates false are recorded Skipped and the
//! planner re-enters at the next position. A composite whose children
//! are all skipped (or whose `each` list is empty) completes
//! immediately and the planner keeps advancing.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use drover_broker::Broker;
use drover_core::queue::QUEUE_PENDING;
use drover_core::{Job, JobContext, JobParent, JobState, Task, TaskState};
use drover_datastore::Datastore;

use crate::error::Result;

/// What the planner did for one advance request.
#[derive(Debug)]
pub enum PlanOutcome {
    /// Concrete tasks were persisted and dispatched; the job keeps
    /// running.
    Dispatched(Vec<Task>),
    /// The position pointer is past the last template: the job is
    /// ready to complete.
    Exhausted,
    /// An expression failed to evaluate. The offending task row was
    /// persisted as Failed; the caller fails the job.
    Aborted { error: String },
}

/// Expands job templates into executable task rows.
#[derive(Clone)]
pub struct Planner {
    ds: Arc<dyn Datastore>,
    broker: Arc<dyn Broker>,
}

impl Planner {
    pub fn new(ds: Arc<dyn Datastore>, broker: Arc<dyn Broker>) -> Self {
        Self { ds, broker }
    }

    /// Advance `job_id` from its current position: skip gated-out
    /// templates, dispatch the first live one, or report exhaustion.
    pub async fn schedule_next(&self, job_id: &str) -> Result<PlanOutcome> {
        loop {
            let job = self.ds.get_job(job_id).await?;
            let Some(template) = job.current_template().cloned() else {
                return Ok(PlanOutcome::Exhausted);
            };
            let ctx = job.context.to_eval_context();

            match drover_eval::evaluate_bool(&template.if_expr, &ctx) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = %job.id, task_name = %template.name, "task gated out, skipping");
                    let skipped = self.record_skipped(&job, &template).await?;
                    self.advance_past(&job.id, skipped).await?;
                    continue;
                }
                Err(err) => return self.abort(&job, &template, err.to_string()).await,
            }

            let outcome = if template.parallel.is_some() {
                self.dispatch_parallel(&job, &template, &ctx).await?
            } else if let Some(each) = template.each.clone() {
                self.dispatch_each(&job, &template, &each, &ctx).await?
            } else if template.subjob.is_some() {
                self.dispatch_subjob(&job, &template, &ctx).await?
            } else {
                self.dispatch_leaf(&job, &template, &ctx).await?
            };
            match outcome {
                // A composite with nothing to run completed in place;
                // keep advancing from the next position.
                None => continue,
                Some(outcome) => return Ok(outcome),
            }
        }
    }

    // -- dispatch by kind ---------------------------------------------------

    async fn dispatch_leaf(
        &self,
        job: &Job,
        template: &Task,
        ctx: &Value,
    ) -> Result<Option<PlanOutcome>> {
        let task = match instantiate(job, template, ctx) {
            Ok(task) => task,
            Err(err) => return self.abort(job, template, err).await.map(Some),
        };
        self.ds.create_task(&task).await?;
        self.broker.publish_task(QUEUE_PENDING, &task).await?;
        info!(job_id = %job.id, task_id = %task.id, task_name = %task.name, "task dispatched");
        Ok(Some(PlanOutcome::Dispatched(vec![task])))
    }

    async fn dispatch_parallel(
        &self,
        job: &Job,
        template: &Task,
        ctx: &Value,
    ) -> Result<Option<PlanOutcome>> {
        let templates = template
            .parallel
            .as_ref()
            .map(|p| p.tasks.clone())
            .unwrap_or_default();
        let children: Vec<(Task, Value)> = templates
            .into_iter()
            .map(|t| (t, ctx.clone()))
            .collect();
        self.dispatch_composite(job, template, children).await
    }

    async fn dispatch_each(
        &self,
        job: &Job,
        template: &Task,
        each: &drover_core::EachTask,
        ctx: &Value,
    ) -> Result<Option<PlanOutcome>> {
        let items = match drover_eval::evaluate_list(&each.list, ctx) {
            Ok(items) => items,
            Err(err) => return self.abort(job, template, err.to_string()).await.map(Some),
        };
        let children: Vec<(Task, Value)> = items
            .into_iter()
            .map(|item| {
                let mut child_ctx = ctx.clone();
                if let Some(obj) = child_ctx.as_object_mut() {
                    obj.insert(each.var.clone(), item);
                }
                ((*each.task).clone(), child_ctx)
            })
            .collect();
        self.dispatch_composite(job, template, children).await
    }

    /// Persist the composite parent (Running) and all child rows, then
    /// publish the live children. Rows are fully persisted before any
    /// publish so a fast child completion always sees its siblings.
    async fn dispatch_composite(
        &self,
        job: &Job,
        template: &Task,
        children: Vec<(Task, Value)>,
    ) -> Result<Option<PlanOutcome>> {
        let mut parent = match instantiate(job, template, &job.context.to_eval_context()) {
            Ok(parent) => parent,
            Err(err) => return self.abort(job, template, err).await.map(Some),
        };
        parent.state = TaskState::Running;
        parent.started_at = Some(Utc::now());
        self.ds.create_task(&parent).await?;

        let mut rows = Vec::new();
        for (position, (child_template, child_ctx)) in children.into_iter().enumerate() {
            let mut child = match instantiate(job, &child_template, &child_ctx) {
                Ok(child) => child,
                Err(err) => return self.abort(job, &child_template, err).await.map(Some),
            };
            child.parent_id = Some(parent.id.clone());
            child.position = position as u32;
            match drover_eval::evaluate_bool(&child_template.if_expr, &child_ctx) {
                Ok(true) => {}
                Ok(false) => child.state = TaskState::Skipped,
                Err(err) => return self.abort(job, &child_template, err.to_string()).await.map(Some),
            }
            self.ds.create_task(&child).await?;
            rows.push(child);
        }

        let live: Vec<&Task> = rows
            .iter()
            .filter(|c| c.state == TaskState::Pending)
            .collect();
        if live.is_empty() {
            // Nothing will ever report completion; finish the parent
            // here and keep planning.
            debug!(job_id = %job.id, task_id = %parent.id, "composite has no live children, completing in place");
            let parent_id = parent.id.clone();
            let completed = self
                .ds
                .update_task(
                    &parent_id,
                    Box::new(|t| {
                        t.state = TaskState::Completed;
                        t.completed_at = Some(Utc::now());
                        Ok(())
                    }),
                )
                .await?;
            self.advance_past(&job.id, completed).await?;
            return Ok(None);
        }

        for child in &live {
            self.broker.publish_task(QUEUE_PENDING, child).await?;
        }
        info!(
            job_id = %job.id,
            task_id = %parent.id,
            children = rows.len(),
            "composite dispatched"
        );
        rows.insert(0, parent);
        Ok(Some(PlanOutcome::Dispatched(rows)))
    }

    async fn dispatch_subjob(
        &self,
        job: &Job,
        template: &Task,
        ctx: &Value,
    ) -> Result<Option<PlanOutcome>> {
        let mut parent = match instantiate(job, template, ctx) {
            Ok(parent) => parent,
            Err(err) => return self.abort(job, template, err).await.map(Some),
        };
        parent.state = TaskState::Running;
        parent.started_at = Some(Utc::now());

        let Some(spec) = parent.subjob.as_mut() else {
            return Err(crate::error::CoordinatorError::Internal(
                "dispatch_subjob called on a task without a subjob spec".into(),
            ));
        };
        let mut inputs = spec.inputs.clone();
        for value in inputs.values_mut() {
            match drover_eval::evaluate_to_string(value, ctx) {
                Ok(evaluated) => *value = evaluated,
                Err(err) => return self.abort(job, template, err.to_string()).await.map(Some),
            }
        }

        let sub = Job {
            id: drover_core::new_id(),
            name: if spec.name.is_empty() {
                parent.name.clone()
            } else {
                spec.name.clone()
            },
            description: spec.description.clone(),
            state: JobState::Pending,
            created_at: Some(Utc::now()),
            tasks: spec.tasks.clone(),
            position: 1,
            task_count: spec.tasks.len() as u32,
            inputs: inputs.clone(),
            context: JobContext {
                inputs,
                secrets: spec.secrets.clone(),
                tasks: Default::default(),
            },
            output: spec.output.clone(),
            parent: Some(JobParent {
                task_id: parent.id.clone(),
            }),
            ..Job::default()
        };
        spec.job_id = sub.id.clone();

        self.ds.create_task(&parent).await?;
        self.ds.create_job(&sub).await?;
        self.broker.publish_job(&sub).await?;
        info!(job_id = %job.id, task_id = %parent.id, sub_job_id = %sub.id, "sub-job dispatched");
        Ok(Some(PlanOutcome::Dispatched(vec![parent])))
    }

    // -- bookkeeping --------------------------------------------------------

    async fn record_skipped(&self, job: &Job, template: &Task) -> Result<Task> {
        let mut skipped = Task {
            id: drover_core::new_id(),
            job_id: job.id.clone(),
            name: template.name.clone(),
            state: TaskState::Skipped,
            created_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
            position: job.position,
            if_expr: template.if_expr.clone(),
            ..Task::default()
        };
        skipped.queue = template.queue.clone();
        self.ds.create_task(&skipped).await?;
        Ok(skipped)
    }

    /// Record `task` in the job context and bump the position pointer.
    async fn advance_past(&self, job_id: &str, task: Task) -> Result<()> {
        self.ds
            .update_job(
                job_id,
                Box::new(move |job| {
                    job.context.record(&task);
                    job.position += 1;
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    /// Persist a Failed row for the template whose expression broke
    /// and report the abort; the caller fails the job.
    async fn abort(&self, job: &Job, template: &Task, error: String) -> Result<PlanOutcome> {
        let failed = Task {
            id: drover_core::new_id(),
            job_id: job.id.clone(),
            name: template.name.clone(),
            state: TaskState::Failed,
            created_at: Some(Utc::now()),
            failed_at: Some(Utc::now()),
            position: job.position,
            error: error.clone(),
            ..Task::default()
        };
        self.ds.create_task(&failed).await?;
        Ok(PlanOutcome::Aborted { error })
    }
}

/// Clone a template into a concrete Pending task row, resolving the
/// expressions in its name, image, and env values (pre/post included).
fn instantiate(job: &Job, template: &Task, ctx: &Value) -> std::result::Result<Task, String> {
    let mut task = template.clone();
    task.id = drover_core::new_id();
    task.job_id = job.id.clone();
    task.parent_id = None;
    task.created_at = Some(Utc::now());
    task.state = TaskState::Pending;
    task.position = job.position;
    task.name = eval_field(&template.name, ctx)?;
    task.image = eval_field(&template.image, ctx)?;
    resolve_env(&mut task.env, ctx)?;
    for step in task.pre.iter_mut().chain(task.post.iter_mut()) {
        resolve_env(&mut step.env, ctx)?;
    }
    if let Some(retry) = &mut task.retry {
        // The dispatch about to happen is the first attempt.
        retry.attempts = 1;
    }
    Ok(task)
}

fn resolve_env(
    env: &mut std::collections::HashMap<String, String>,
    ctx: &Value,
) -> std::result::Result<(), String> {
    for value in env.values_mut() {
        *value = eval_field(value, ctx)?;
    }
    Ok(())
}

fn eval_field(field: &str, ctx: &Value) -> std::result::Result<String, String> {
    if field.is_empty() {
        return Ok(String::new());
    }
    drover_eval::evaluate_to_string(field, ctx).map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use drover_broker::InMemoryBroker;
    use drover_datastore::InMemoryDatastore;
    use std::collections::HashMap;

    fn planner() -> (Planner, Arc<InMemoryDatastore>, InMemoryBroker) {
        let ds = Arc::new(InMemoryDatastore::new());
        let broker = InMemoryBroker::new();
        (
            Planner::new(ds.clone(), Arc::new(broker.clone())),
            ds,
            broker,
        )
    }

    async fn seed(ds: &InMemoryDatastore, tasks: Vec<Task>, inputs: HashMap<String, String>) -> Job {
        let job = Job {
            id: drover_core::new_id(),
            name: "plan-test".into(),
            state: JobState::Scheduled,
            created_at: Some(Utc::now()),
            task_count: tasks.len() as u32,
            tasks,
            position: 1,
            inputs: inputs.clone(),
            context: JobContext {
                inputs,
                ..Default::default()
            },
            ..Job::default()
        };
        ds.create_job(&job).await.unwrap();
        job
    }

    fn leaf(name: &str) -> Task {
        Task {
            name: name.into(),
            run: format!("echo {name}"),
            ..Task::default()
        }
    }

    #[tokio::test]
    async fn dispatches_a_leaf_and_resolves_env() {
        let (planner, ds, _broker) = planner();
        let mut task = leaf("greet");
        task.env
            .insert("WHO".into(), "{{ inputs.name }}".into());
        let job = seed(
            &ds,
            vec![task],
            HashMap::from([("name".to_string(), "ada".to_string())]),
        )
        .await;

        let outcome = planner.schedule_next(&job.id).await.unwrap();
        let dispatched = match outcome {
            PlanOutcome::Dispatched(tasks) => tasks,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].state, TaskState::Pending);
        assert_eq!(dispatched[0].env["WHO"], "ada");
        assert_eq!(dispatched[0].retry, None);

        // The row is persisted.
        let rows = ds.get_job_tasks(&job.id).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_when_position_past_end() {
        let (planner, ds, _broker) = planner();
        let mut job = seed(&ds, vec![leaf("only")], HashMap::new()).await;
        job.position = 2;
        ds.update_job(
            &job.id,
            Box::new(|j| {
                j.position = 2;
                Ok(())
            }),
        )
        .await
        .unwrap();

        assert!(matches!(
            planner.schedule_next(&job.id).await.unwrap(),
            PlanOutcome::Exhausted
        ));
    }

    #[tokio::test]
    async fn skips_gated_tasks_and_dispatches_the_next() {
        let (planner, ds, _broker) = planner();
        let mut gated = leaf("gated");
        gated.if_expr = "{{ inputs.enabled }}".into();
        let job = seed(
            &ds,
            vec![gated, leaf("live")],
            HashMap::from([("enabled".to_string(), "false".to_string())]),
        )
        .await;

        let outcome = planner.schedule_next(&job.id).await.unwrap();
        match outcome {
            PlanOutcome::Dispatched(tasks) => assert_eq!(tasks[0].name, "live"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let rows = ds.get_job_tasks(&job.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].state, TaskState::Skipped);
        let reloaded = ds.get_job(&job.id).await.unwrap();
        assert_eq!(reloaded.position, 2);
    }

    #[tokio::test]
    async fn parallel_creates_parent_and_children() {
        let (planner, ds, _broker) = planner();
        let parent = Task {
            name: "fan".into(),
            parallel: Some(drover_core::ParallelTask {
                tasks: vec![leaf("a"), leaf("b"), leaf("c"), leaf("d")],
            }),
            ..Task::default()
        };
        let job = seed(&ds, vec![parent], HashMap::new()).await;

        let outcome = planner.schedule_next(&job.id).await.unwrap();
        let tasks = match outcome {
            PlanOutcome::Dispatched(tasks) => tasks,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(tasks.len(), 5);
        assert_eq!(tasks[0].state, TaskState::Running);
        let parent_id = &tasks[0].id;
        for child in &tasks[1..] {
            assert_eq!(child.parent_id.as_ref(), Some(parent_id));
            assert_eq!(child.state, TaskState::Pending);
        }

        let children = ds.get_children(parent_id).await.unwrap();
        assert_eq!(children.len(), 4);
    }

    #[tokio::test]
    async fn each_binds_the_iterator_variable() {
        let (planner, ds, _broker) = planner();
        let mut child = leaf("worker");
        child
            .env
            .insert("ITEM".into(), "{{ item }}".into());
        let parent = Task {
            name: "iterate".into(),
            each: Some(drover_core::EachTask {
                list: "{{ range(3) }}".into(),
                var: "item".into(),
                task: Box::new(child),
            }),
            ..Task::default()
        };
        let job = seed(&ds, vec![parent], HashMap::new()).await;

        let tasks = match planner.schedule_next(&job.id).await.unwrap() {
            PlanOutcome::Dispatched(tasks) => tasks,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(tasks.len(), 4);
        let envs: Vec<&str> = tasks[1..].iter().map(|t| t.env["ITEM"].as_str()).collect();
        assert_eq!(envs, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn empty_each_list_completes_in_place_and_advances() {
        let (planner, ds, _broker) = planner();
        let parent = Task {
            name: "noop".into(),
            each: Some(drover_core::EachTask {
                list: "{{ [] }}".into(),
                var: "item".into(),
                task: Box::new(leaf("never")),
            }),
            ..Task::default()
        };
        let job = seed(&ds, vec![parent, leaf("after")], HashMap::new()).await;

        let tasks = match planner.schedule_next(&job.id).await.unwrap() {
            PlanOutcome::Dispatched(tasks) => tasks,
            other => panic!("unexpected outcome: {other:?}"),
        };
        // The dispatched task is the one after the empty composite.
        assert_eq!(tasks[0].name, "after");

        let rows = ds.get_job_tasks(&job.id).await.unwrap();
        assert_eq!(rows[0].state, TaskState::Completed);
        assert_eq!(ds.get_job(&job.id).await.unwrap().position, 2);
    }

    #[tokio::test]
    async fn subjob_materializes_a_pending_job() {
        let (planner, ds, _broker) = planner();
        let parent = Task {
            name: "outer".into(),
            subjob: Some(drover_core::SubJobTask {
                name: "inner".into(),
                inputs: HashMap::from([("from".to_string(), "{{ inputs.site }}".to_string())]),
                output: "{{ tasks.last.result }}".into(),
                tasks: vec![leaf("first"), leaf("last")],
                ..Default::default()
            }),
            ..Task::default()
        };
        let job = seed(
            &ds,
            vec![parent],
            HashMap::from([("site".to_string(), "x1".to_string())]),
        )
        .await;

        let tasks = match planner.schedule_next(&job.id).await.unwrap() {
            PlanOutcome::Dispatched(tasks) => tasks,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let sub_id = tasks[0].subjob.as_ref().unwrap().job_id.clone();
        assert!(!sub_id.is_empty());

        let sub = ds.get_job(&sub_id).await.unwrap();
        assert_eq!(sub.state, JobState::Pending);
        assert_eq!(sub.name, "inner");
        assert_eq!(sub.inputs["from"], "x1");
        assert_eq!(sub.parent.as_ref().unwrap().task_id, tasks[0].id);
        assert_eq!(sub.task_count, 2);
    }

    #[tokio::test]
    async fn expression_error_aborts_with_failed_row() {
        let (planner, ds, _broker) = planner();
        let mut bad = leaf("bad");
        bad.env
            .insert("X".into(), "{{ nosuch.path }}".into());
        let job = seed(&ds, vec![bad], HashMap::new()).await;

        let outcome = planner.schedule_next(&job.id).await.unwrap();
        let PlanOutcome::Aborted { error } = outcome else {
            panic!("expected abort");
        };
        assert!(error.contains("nosuch"), "got: {error}");

        let rows = ds.get_job_tasks(&job.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, TaskState::Failed);
        assert!(!rows[0].error.is_empty());
    }
}
