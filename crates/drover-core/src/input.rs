//! Job-template input types and validation.
//!
//! These types mirror the YAML/JSON job file accepted by the API.
//! They are deliberately separate from the persisted [`Job`]/[`Task`]
//! models: input carries only what a submitter may set, and every
//! accepted template converts into a fresh job with
//! [`JobInput::to_job`].
//!
//! Validation combines `validator` field rules with an explicit
//! recursive walk for the structural rules the derive cannot express
//! (composite exclusivity, leaf-field emptiness on composites,
//! leaf-only pre/post). A rejected template always names at least one
//! offending field.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::error::{CoreError, Result};
use crate::job::{AutoDelete, Job, JobContext, JobState, WaitSpec};
use crate::queue;
use crate::scheduled::{ScheduledJob, ScheduledJobState, parse_fixed_offset};
use crate::task::{
    EachTask, Mount, MountType, ParallelTask, SubJobTask, Task, TaskLimits, TaskRetry, TaskState,
};

// ---------------------------------------------------------------------------
// Input types
// ---------------------------------------------------------------------------

/// The body of `POST /jobs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct JobInput {
    #[validate(length(min = 1, message = "job name is required"))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    #[serde(default)]
    #[validate(custom = "validate_expression")]
    pub output: String,
    #[serde(default)]
    pub wait: Option<WaitInput>,
    #[serde(default)]
    pub auto_delete: Option<AutoDeleteInput>,
    #[serde(default)]
    pub tasks: Vec<TaskInput>,
}

/// One task entry in a job template.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct TaskInput {
    #[validate(length(min = 1, message = "task name is required"))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub run: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    #[validate(custom = "validate_queue")]
    pub queue: String,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry: Option<RetryInput>,
    #[serde(default)]
    pub limits: Option<LimitsInput>,
    #[serde(default)]
    pub mounts: Vec<MountInput>,
    #[serde(default, rename = "if")]
    #[validate(custom = "validate_expression")]
    pub if_expr: String,
    #[serde(default)]
    pub pre: Vec<TaskInput>,
    #[serde(default)]
    pub post: Vec<TaskInput>,
    #[serde(default)]
    pub parallel: Option<ParallelInput>,
    #[serde(default)]
    pub each: Option<EachInput>,
    #[serde(default)]
    pub subjob: Option<SubJobInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct WaitInput {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AutoDeleteInput {
    #[serde(with = "humantime_serde")]
    pub after: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RetryInput {
    #[validate(range(min = 1, max = 10, message = "retry limit must be between 1 and 10"))]
    pub limit: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct LimitsInput {
    #[serde(default)]
    pub cpus: String,
    #[serde(default)]
    pub memory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountInput {
    #[serde(rename = "type")]
    pub mount_type: MountType,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelInput {
    pub tasks: Vec<TaskInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EachInput {
    pub list: String,
    #[serde(default)]
    pub var: String,
    pub task: Box<TaskInput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubJobInput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    #[serde(default)]
    pub output: String,
    pub tasks: Vec<TaskInput>,
}

/// The body of `POST /scheduled-jobs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ScheduledJobInput {
    #[validate(length(min = 1, message = "scheduled job name is required"))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[validate(custom = "validate_cron")]
    pub cron: String,
    #[serde(default)]
    #[validate(custom = "validate_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    #[serde(default)]
    #[validate(custom = "validate_expression")]
    pub output: String,
    #[serde(default)]
    pub tasks: Vec<TaskInput>,
}

// ---------------------------------------------------------------------------
// Field validators
// ---------------------------------------------------------------------------

fn field_error(code: &'static str, message: String) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

fn validate_expression(value: &str) -> std::result::Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    drover_eval::validate(value)
        .map_err(|e| field_error("expression", format!("invalid expression: {e}")))
}

fn validate_queue(value: &str) -> std::result::Result<(), ValidationError> {
    if value.is_empty() || queue::is_valid_user_queue(value) {
        Ok(())
    } else {
        Err(field_error(
            "queue",
            format!("queue `{value}` is reserved"),
        ))
    }
}

fn validate_cron(value: &str) -> std::result::Result<(), ValidationError> {
    crate::scheduled::cron_schedule(value)
        .map(|_| ())
        .map_err(|e| field_error("cron", e.to_string()))
}

fn validate_timezone(value: &str) -> std::result::Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    parse_fixed_offset(value)
        .map(|_| ())
        .map_err(|e| field_error("timezone", e.to_string()))
}

// ---------------------------------------------------------------------------
// Structural validation
// ---------------------------------------------------------------------------

/// Accumulates `field: problem` strings with a dotted path prefix.
struct Problems {
    items: Vec<String>,
}

impl Problems {
    fn new() -> Self {
        Self { items: Vec::new() }
    }

    fn push(&mut self, path: &str, problem: impl Into<String>) {
        self.items.push(format!("{path}: {}", problem.into()));
    }

    fn absorb(&mut self, path: &str, errors: &validator::ValidationErrors) {
        for (field, kinds) in errors.errors() {
            if let validator::ValidationErrorsKind::Field(list) = kinds {
                for err in list {
                    let message = err
                        .message
                        .as_deref()
                        .map(str::to_string)
                        .unwrap_or_else(|| err.code.to_string());
                    self.push(&format!("{path}.{field}"), message);
                }
            }
        }
    }

    fn into_result(self) -> Result<()> {
        if self.items.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Validation(self.items.join("; ")))
        }
    }
}

impl JobInput {
    /// Validate the whole template, including nested composites.
    pub fn validate_input(&self) -> Result<()> {
        let mut problems = Problems::new();
        if let Err(errors) = self.validate() {
            problems.absorb("job", &errors);
        }
        if self.tasks.is_empty() {
            problems.push("job.tasks", "a job needs at least one task");
        }
        for (i, task) in self.tasks.iter().enumerate() {
            task.check(&format!("tasks[{i}]"), true, &mut problems);
        }
        problems.into_result()
    }

    /// Materialize a fresh Pending job from this template.
    pub fn to_job(&self) -> Job {
        let tasks: Vec<Task> = self.tasks.iter().map(TaskInput::to_task).collect();
        Job {
            id: Uuid::now_v7().to_string(),
            name: self.name.clone(),
            description: self.description.clone(),
            tags: self.tags.clone(),
            state: JobState::Pending,
            created_at: Some(chrono::Utc::now()),
            task_count: tasks.len() as u32,
            tasks,
            position: 1,
            inputs: self.inputs.clone(),
            context: JobContext {
                inputs: self.inputs.clone(),
                secrets: self.secrets.clone(),
                tasks: HashMap::new(),
            },
            output: self.output.clone(),
            wait: self.wait.as_ref().map(|w| WaitSpec { timeout: w.timeout }),
            auto_delete: self
                .auto_delete
                .as_ref()
                .map(|a| AutoDelete { after: a.after }),
            secrets: self.secrets.clone(),
            ..Job::default()
        }
    }
}

impl TaskInput {
    /// Structural checks for one task. `composites_allowed` is false
    /// inside `pre`/`post` lists and composite children, which must be
    /// leaves.
    fn check(&self, path: &str, composites_allowed: bool, problems: &mut Problems) {
        if let Err(errors) = self.validate() {
            problems.absorb(path, &errors);
        }
        for value in self.env.values() {
            if let Err(e) = drover_eval::validate(value) {
                problems.push(&format!("{path}.env"), format!("invalid expression: {e}"));
            }
        }
        for (i, mount) in self.mounts.iter().enumerate() {
            mount.check(&format!("{path}.mounts[{i}]"), problems);
        }
        if let Some(retry) = &self.retry
            && let Err(errors) = retry.validate()
        {
            problems.absorb(&format!("{path}.retry"), &errors);
        }

        let composite_count = [
            self.parallel.is_some(),
            self.each.is_some(),
            self.subjob.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();

        if composite_count > 1 {
            problems.push(
                path,
                "parallel, each, and subjob are mutually exclusive",
            );
            return;
        }

        if composite_count == 0 {
            // Leaf: must have something to execute.
            if self.image.is_empty() && self.run.is_empty() {
                problems.push(&format!("{path}.image"), "a task needs an image or a run script");
            }
            for (i, pre) in self.pre.iter().enumerate() {
                pre.check(&format!("{path}.pre[{i}]"), false, problems);
            }
            for (i, post) in self.post.iter().enumerate() {
                post.check(&format!("{path}.post[{i}]"), false, problems);
            }
            return;
        }

        if !composites_allowed {
            problems.push(path, "composite tasks are not allowed here");
            return;
        }

        // Composites are purely structural: reject execution fields.
        let leaf_fields: &[(&str, bool)] = &[
            ("image", !self.image.is_empty()),
            ("cmd", !self.cmd.is_empty()),
            ("entrypoint", !self.entrypoint.is_empty()),
            ("run", !self.run.is_empty()),
            ("env", !self.env.is_empty()),
            ("queue", !self.queue.is_empty()),
            ("pre", !self.pre.is_empty()),
            ("post", !self.post.is_empty()),
            ("mounts", !self.mounts.is_empty()),
            ("retry", self.retry.is_some()),
            ("limits", self.limits.is_some()),
            ("timeout", self.timeout.is_some()),
        ];
        for (field, present) in leaf_fields {
            if *present {
                problems.push(
                    &format!("{path}.{field}"),
                    "not allowed on a composite task",
                );
            }
        }

        if let Some(parallel) = &self.parallel {
            if parallel.tasks.is_empty() {
                problems.push(&format!("{path}.parallel.tasks"), "must not be empty");
            }
            for (i, child) in parallel.tasks.iter().enumerate() {
                child.check(&format!("{path}.parallel.tasks[{i}]"), false, problems);
            }
        }
        if let Some(each) = &self.each {
            if each.list.is_empty() {
                problems.push(&format!("{path}.each.list"), "list expression is required");
            } else if let Err(e) = drover_eval::validate(&each.list) {
                problems.push(&format!("{path}.each.list"), format!("invalid expression: {e}"));
            }
            each.task.check(&format!("{path}.each.task"), false, problems);
        }
        if let Some(subjob) = &self.subjob {
            if subjob.tasks.is_empty() {
                problems.push(&format!("{path}.subjob.tasks"), "must not be empty");
            }
            if let Err(e) = drover_eval::validate(&subjob.output) {
                problems.push(&format!("{path}.subjob.output"), format!("invalid expression: {e}"));
            }
            for (i, child) in subjob.tasks.iter().enumerate() {
                child.check(&format!("{path}.subjob.tasks[{i}]"), true, problems);
            }
        }
    }

    /// Convert into a template [`Task`] (no ids, no expression
    /// expansion; the planner does both at dispatch time).
    pub fn to_task(&self) -> Task {
        Task {
            name: self.name.clone(),
            description: self.description.clone(),
            state: TaskState::Pending,
            image: self.image.clone(),
            cmd: self.cmd.clone(),
            entrypoint: self.entrypoint.clone(),
            run: self.run.clone(),
            env: self.env.clone(),
            queue: self.queue.clone(),
            timeout: self.timeout,
            retry: self.retry.as_ref().map(|r| TaskRetry {
                limit: r.limit,
                attempts: 0,
            }),
            limits: self.limits.as_ref().map(|l| TaskLimits {
                cpus: l.cpus.clone(),
                memory: l.memory.clone(),
            }),
            mounts: self
                .mounts
                .iter()
                .map(|m| Mount {
                    mount_type: m.mount_type,
                    source: m.source.clone(),
                    target: m.target.clone(),
                })
                .collect(),
            if_expr: self.if_expr.clone(),
            pre: self.pre.iter().map(TaskInput::to_task).collect(),
            post: self.post.iter().map(TaskInput::to_task).collect(),
            parallel: self.parallel.as_ref().map(|p| ParallelTask {
                tasks: p.tasks.iter().map(TaskInput::to_task).collect(),
            }),
            each: self.each.as_ref().map(|e| EachTask {
                list: e.list.clone(),
                var: if e.var.is_empty() {
                    "item".to_string()
                } else {
                    e.var.clone()
                },
                task: Box::new(e.task.to_task()),
            }),
            subjob: self.subjob.as_ref().map(|s| SubJobTask {
                name: s.name.clone(),
                description: s.description.clone(),
                inputs: s.inputs.clone(),
                secrets: s.secrets.clone(),
                output: s.output.clone(),
                tasks: s.tasks.iter().map(TaskInput::to_task).collect(),
                job_id: String::new(),
            }),
            ..Task::default()
        }
    }
}

impl MountInput {
    fn check(&self, path: &str, problems: &mut Problems) {
        const ALLOWED: &str =
            "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_/.= ";
        let well_formed = |s: &str| s.chars().all(|c| ALLOWED.contains(c));

        match self.mount_type {
            MountType::Volume => {
                if !self.source.is_empty() {
                    problems.push(&format!("{path}.source"), "volume mounts name no source");
                }
                if self.target.is_empty() {
                    problems.push(&format!("{path}.target"), "volume mounts need a target");
                }
            }
            MountType::Bind => {
                if self.source.is_empty() {
                    problems.push(&format!("{path}.source"), "bind mounts need a source");
                }
            }
            MountType::Tmpfs => {
                if self.target.is_empty() {
                    problems.push(&format!("{path}.target"), "tmpfs mounts need a target");
                }
            }
        }
        if !self.source.is_empty() && !well_formed(&self.source) {
            problems.push(&format!("{path}.source"), "contains invalid characters");
        }
        if !self.target.is_empty() && !well_formed(&self.target) {
            problems.push(&format!("{path}.target"), "contains invalid characters");
        }
        if self.target == crate::WORK_DIR {
            problems.push(
                &format!("{path}.target"),
                format!("{} is reserved", crate::WORK_DIR),
            );
        }
    }
}

impl ScheduledJobInput {
    /// Validate the template including its tasks.
    pub fn validate_input(&self) -> Result<()> {
        let mut problems = Problems::new();
        if let Err(errors) = self.validate() {
            problems.absorb("scheduled-job", &errors);
        }
        if self.tasks.is_empty() {
            problems.push("scheduled-job.tasks", "at least one task is required");
        }
        for (i, task) in self.tasks.iter().enumerate() {
            task.check(&format!("tasks[{i}]"), true, &mut problems);
        }
        problems.into_result()
    }

    /// Materialize the persisted scheduled-job row.
    pub fn to_scheduled_job(&self) -> ScheduledJob {
        ScheduledJob {
            id: Uuid::now_v7().to_string(),
            name: self.name.clone(),
            description: self.description.clone(),
            state: ScheduledJobState::Active,
            cron: self.cron.clone(),
            timezone: self.timezone.clone(),
            created_at: chrono::Utc::now(),
            last_run_at: None,
            tasks: self.tasks.iter().map(TaskInput::to_task).collect(),
            inputs: self.inputs.clone(),
            output: self.output.clone(),
            tags: self.tags.clone(),
            secrets: self.secrets.clone(),
            created_by: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_job(tasks_json: &str) -> JobInput {
        serde_json::from_str(&format!(
            r#"{{"name":"test job","tasks":{tasks_json}}}"#
        ))
        .unwrap()
    }

    #[test]
    fn accepts_minimal_job() {
        let job = minimal_job(r#"[{"name":"t1","image":"alpine:3"}]"#);
        job.validate_input().unwrap();
    }

    #[test]
    fn rejects_missing_name() {
        let job: JobInput =
            serde_json::from_str(r#"{"name":"","tasks":[{"name":"t","run":"x"}]}"#).unwrap();
        let err = job.validate_input().unwrap_err().to_string();
        assert!(err.contains("job.name"), "got: {err}");
    }

    #[test]
    fn rejects_empty_task_list() {
        let job = minimal_job("[]");
        let err = job.validate_input().unwrap_err().to_string();
        assert!(err.contains("job.tasks"), "got: {err}");
    }

    #[test]
    fn rejects_parallel_and_each_together() {
        let job = minimal_job(
            r#"[{
                "name":"both",
                "parallel":{"tasks":[{"name":"c","run":"x"}]},
                "each":{"list":"{{ range(2) }}","task":{"name":"c","run":"x"}}
            }]"#,
        );
        let err = job.validate_input().unwrap_err().to_string();
        assert!(err.contains("mutually exclusive"), "got: {err}");
        assert!(err.contains("tasks[0]"), "got: {err}");
    }

    #[test]
    fn rejects_execution_fields_on_composites() {
        let job = minimal_job(
            r#"[{
                "name":"p",
                "image":"alpine:3",
                "parallel":{"tasks":[{"name":"c","run":"x"}]}
            }]"#,
        );
        let err = job.validate_input().unwrap_err().to_string();
        assert!(err.contains("tasks[0].image"), "got: {err}");
    }

    #[test]
    fn rejects_reserved_queue() {
        let job = minimal_job(r#"[{"name":"t","run":"x","queue":"x-abc"}]"#);
        let err = job.validate_input().unwrap_err().to_string();
        assert!(err.contains("queue"), "got: {err}");

        let job = minimal_job(r#"[{"name":"t","run":"x","queue":"completed"}]"#);
        assert!(job.validate_input().is_err());
    }

    #[test]
    fn rejects_bad_expression() {
        let job = minimal_job(r#"[{"name":"t","run":"x","if":"{{ 1 + }}"}]"#);
        let err = job.validate_input().unwrap_err().to_string();
        assert!(err.contains("if"), "got: {err}");
    }

    #[test]
    fn rejects_composite_in_pre() {
        let job = minimal_job(
            r#"[{
                "name":"t","run":"x",
                "pre":[{"name":"p","parallel":{"tasks":[{"name":"c","run":"y"}]}}]
            }]"#,
        );
        let err = job.validate_input().unwrap_err().to_string();
        assert!(err.contains("pre[0]"), "got: {err}");
    }

    #[test]
    fn rejects_unknown_fields() {
        let parsed: std::result::Result<JobInput, _> =
            serde_json::from_str(r#"{"name":"j","tasks":[{"nosuch":"thing"}]}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn rejects_bad_mounts() {
        let job = minimal_job(
            r#"[{"name":"t","run":"x","mounts":[{"type":"volume","source":"/oops","target":"/data"}]}]"#,
        );
        let err = job.validate_input().unwrap_err().to_string();
        assert!(err.contains("mounts[0].source"), "got: {err}");
    }

    #[test]
    fn rejects_retry_limit_out_of_range() {
        let job = minimal_job(r#"[{"name":"t","run":"x","retry":{"limit":99}}]"#);
        let err = job.validate_input().unwrap_err().to_string();
        assert!(err.contains("retry"), "got: {err}");
    }

    #[test]
    fn accepted_template_round_trips(){
        let job = minimal_job(
            r#"[
                {"name":"fetch","image":"alpine:3","run":"echo hi","timeout":"45s"},
                {"name":"fan","each":{"list":"{{ range(3) }}","task":{"name":"c","run":"echo {{ item }}"}}}
            ]"#,
        );
        job.validate_input().unwrap();

        // Round-trip through serialization and re-validate (accepted
        // templates stay accepted).
        let json = serde_json::to_string(&job).unwrap();
        let back: JobInput = serde_json::from_str(&json).unwrap();
        back.validate_input().unwrap();

        let model = back.to_job();
        assert_eq!(model.state, JobState::Pending);
        assert_eq!(model.position, 1);
        assert_eq!(model.task_count, 2);
        assert_eq!(model.tasks[1].each.as_ref().unwrap().var, "item");
        assert!(!model.id.is_empty());
    }

    #[test]
    fn yaml_templates_parse() {
        let yaml = r#"
name: hello world
inputs:
  greeting: hi
tasks:
  - name: say
    image: alpine:3
    run: echo {{ inputs.greeting }}
"#;
        let job: JobInput = serde_yaml::from_str(yaml).unwrap();
        job.validate_input().unwrap();
    }

    #[test]
    fn scheduled_job_cron_validation() {
        let good: ScheduledJobInput = serde_json::from_str(
            r#"{"name":"nightly","cron":"0 3 * * *","tasks":[{"name":"t","run":"x"}]}"#,
        )
        .unwrap();
        good.validate_input().unwrap();

        let bad: ScheduledJobInput = serde_json::from_str(
            r#"{"name":"nightly","cron":"not a cron","tasks":[{"name":"t","run":"x"}]}"#,
        )
        .unwrap();
        let err = bad.validate_input().unwrap_err().to_string();
        assert!(err.contains("cron"), "got: {err}");
    }
}
