//! End-to-end scenarios: coordinator + worker + in-memory broker and
//! datastore, with the shell runtime executing real processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use drover_broker::{Broker, InMemoryBroker};
use drover_coordinator::{Config, Coordinator};
use drover_core::input::JobInput;
use drover_core::{Job, JobState, TaskState};
use drover_datastore::{Datastore, InMemoryDatastore, InMemoryLocker};
use drover_runtime::ShellRuntime;
use drover_worker::{Worker, WorkerConfig, WorkerLimits};

struct Cluster {
    ds: Arc<InMemoryDatastore>,
    broker: InMemoryBroker,
    coordinator: Coordinator,
    worker: Worker,
}

async fn cluster() -> Cluster {
    let ds = Arc::new(InMemoryDatastore::new());
    let broker = InMemoryBroker::new();

    let coordinator = Coordinator::new(Config::new(
        Arc::new(broker.clone()),
        ds.clone(),
        Arc::new(InMemoryLocker::new()),
    ))
    .expect("coordinator");
    coordinator.start().await.expect("coordinator start");

    let worker = Worker::new(WorkerConfig {
        broker: Arc::new(broker.clone()),
        runtime: Arc::new(ShellRuntime::new()),
        queues: HashMap::from([("default".to_string(), 2)]),
        limits: WorkerLimits::default(),
        tempdir: None,
    });
    worker.start().await.expect("worker start");

    Cluster {
        ds,
        broker,
        coordinator,
        worker,
    }
}

async fn submit(cluster: &Cluster, yaml: &str) -> Job {
    let input: JobInput = serde_yaml::from_str(yaml).expect("parse template");
    input.validate_input().expect("validate template");
    let job = input.to_job();
    cluster.ds.create_job(&job).await.expect("create job");
    cluster.broker.publish_job(&job).await.expect("publish job");
    job
}

async fn await_job_state(
    ds: &Arc<InMemoryDatastore>,
    job_id: &str,
    want: JobState,
    budget: Duration,
) -> Job {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let job = ds.get_job(job_id).await.expect("get job");
        if job.state == want {
            return job;
        }
        assert!(
            job.state == JobState::Pending
                || job.state == JobState::Scheduled
                || job.state == JobState::Running
                || job.state == want,
            "job reached unexpected terminal state {}: error={}",
            job.state,
            job.error
        );
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {want}; currently {} (error: {})",
            job.state,
            job.error
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn hello_world_job_completes() {
    let c = cluster().await;
    let job = submit(
        &c,
        r#"
name: hello world
tasks:
  - name: say
    image: alpine:3
    run: echo hello
"#,
    )
    .await;

    let done = await_job_state(&c.ds, &job.id, JobState::Completed, Duration::from_secs(10)).await;
    assert_eq!(done.execution.len(), 1);
    assert_eq!(done.execution[0].state, TaskState::Completed);
    assert_eq!(done.position, 2);
    c.worker.stop();
    c.coordinator.stop();
}

#[tokio::test]
async fn output_expression_carries_task_results() {
    let c = cluster().await;
    let job = submit(
        &c,
        r#"
name: output
inputs:
  greeting: hi
output: "{{ tasks.say.result }}"
tasks:
  - name: say
    run: printf "$GREETING" > "$DROVER_OUTPUT"
    env:
      GREETING: "{{ inputs.greeting }} there"
"#,
    )
    .await;

    let done = await_job_state(&c.ds, &job.id, JobState::Completed, Duration::from_secs(10)).await;
    assert_eq!(done.result, "hi there");
    c.worker.stop();
    c.coordinator.stop();
}

#[tokio::test]
async fn parallel_job_runs_all_children() {
    let c = cluster().await;
    let job = submit(
        &c,
        r#"
name: parallel
tasks:
  - name: fan
    parallel:
      tasks:
        - name: one
          run: "true"
        - name: two
          run: "true"
        - name: three
          run: "true"
        - name: four
          run: "true"
"#,
    )
    .await;

    let done = await_job_state(&c.ds, &job.id, JobState::Completed, Duration::from_secs(15)).await;
    // One parent plus four children.
    assert_eq!(done.execution.len(), 5);
    assert!(
        done.execution
            .iter()
            .all(|t| t.state == TaskState::Completed)
    );
    c.worker.stop();
    c.coordinator.stop();
}

#[tokio::test]
async fn each_of_three_completes_with_four_records() {
    let c = cluster().await;
    let job = submit(
        &c,
        r#"
name: each
tasks:
  - name: iterate
    each:
      list: "{{ [1, 2, 3] }}"
      var: item
      task:
        name: child
        run: echo "$ITEM"
        env:
          ITEM: "{{ item }}"
"#,
    )
    .await;

    let done = await_job_state(&c.ds, &job.id, JobState::Completed, Duration::from_secs(15)).await;
    assert_eq!(done.execution.len(), 4);
    c.worker.stop();
    c.coordinator.stop();
}

#[tokio::test]
async fn subjob_result_flows_into_parent_task() {
    let c = cluster().await;
    let job = submit(
        &c,
        r#"
name: outer
output: "{{ tasks.spawn.result }}"
tasks:
  - name: spawn
    subjob:
      name: inner
      output: "{{ tasks.produce.result }}"
      tasks:
        - name: warm
          run: "true"
        - name: produce
          run: printf inner-42 > "$DROVER_OUTPUT"
"#,
    )
    .await;

    let done = await_job_state(&c.ds, &job.id, JobState::Completed, Duration::from_secs(15)).await;
    assert_eq!(done.execution.len(), 1, "outer job runs one task");
    assert_eq!(done.execution[0].result, "inner-42");
    assert_eq!(done.result, "inner-42");

    // The inner job completed with its two execution records.
    let sub_id = done.execution[0].subjob.as_ref().unwrap().job_id.clone();
    let inner = c.ds.get_job(&sub_id).await.unwrap();
    assert_eq!(inner.state, JobState::Completed);
    assert_eq!(inner.execution.len(), 2);
    c.worker.stop();
    c.coordinator.stop();
}

#[tokio::test]
async fn retry_succeeds_on_second_attempt() {
    let c = cluster().await;
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("attempted");

    let job = submit(
        &c,
        &format!(
            r#"
name: flaky
tasks:
  - name: flaky-step
    retry:
      limit: 1
    run: |
      if [ -f {marker} ]; then exit 0; fi
      touch {marker}
      exit 1
"#,
            marker = marker.display()
        ),
    )
    .await;

    let done = await_job_state(&c.ds, &job.id, JobState::Completed, Duration::from_secs(15)).await;
    let task = &done.execution[0];
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.retry.as_ref().unwrap().attempts, 2);
    c.worker.stop();
    c.coordinator.stop();
}

#[tokio::test]
async fn cancel_while_running_terminates_everything() {
    let c = cluster().await;
    let job = submit(
        &c,
        r#"
name: long
tasks:
  - name: sleepy
    run: sleep 30
"#,
    )
    .await;

    // Wait for the task to actually start.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = c.ds.get_job(&job.id).await.unwrap();
        if current.state == JobState::Running {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never started");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    c.coordinator.flow().cancel_job(&job.id).await.unwrap();

    let done = await_job_state(&c.ds, &job.id, JobState::Cancelled, Duration::from_secs(5)).await;
    assert_eq!(done.execution[0].state, TaskState::Cancelled);

    // Cancellation is idempotent.
    c.coordinator.flow().cancel_job(&job.id).await.unwrap();
    assert_eq!(
        c.ds.get_job(&job.id).await.unwrap().state,
        JobState::Cancelled
    );

    // No further reports resurrect the task.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        c.ds.get_job(&job.id).await.unwrap().execution[0].state,
        TaskState::Cancelled
    );
    c.worker.stop();
    c.coordinator.stop();
}

#[tokio::test]
async fn skipped_tasks_do_not_block_completion() {
    let c = cluster().await;
    let job = submit(
        &c,
        r#"
name: gated
inputs:
  enabled: "false"
tasks:
  - name: gated-out
    if: "{{ inputs.enabled }}"
    run: exit 1
  - name: always
    run: "true"
"#,
    )
    .await;

    let done = await_job_state(&c.ds, &job.id, JobState::Completed, Duration::from_secs(10)).await;
    assert_eq!(done.execution.len(), 2);
    assert_eq!(done.execution[0].state, TaskState::Skipped);
    assert_eq!(done.execution[1].state, TaskState::Completed);
    c.worker.stop();
    c.coordinator.stop();
}

#[tokio::test]
async fn failed_job_restarts_from_its_position() {
    let c = cluster().await;
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("fixed");

    let job = submit(
        &c,
        &format!(
            r#"
name: restartable
tasks:
  - name: first
    run: "true"
  - name: second
    run: |
      if [ -f {marker} ]; then exit 0; fi
      exit 1
  - name: third
    run: "true"
"#,
            marker = marker.display()
        ),
    )
    .await;

    let failed = await_job_state(&c.ds, &job.id, JobState::Failed, Duration::from_secs(15)).await;
    assert_eq!(failed.position, 2, "failure pins the position");

    // Fix the environment, then restart the way the API does.
    std::fs::write(&marker, "").unwrap();
    let mut candidate = failed;
    candidate.state = JobState::Restart;
    c.coordinator.flow().dispatch(&mut candidate).await.unwrap();

    let done = await_job_state(&c.ds, &job.id, JobState::Completed, Duration::from_secs(15)).await;
    assert_eq!(done.position, 4);
    c.worker.stop();
    c.coordinator.stop();
}

#[tokio::test]
async fn terminal_states_are_sticky_under_redelivery() {
    let c = cluster().await;
    let job = submit(
        &c,
        r#"
name: sticky
tasks:
  - name: only
    run: "true"
"#,
    )
    .await;

    let done = await_job_state(&c.ds, &job.id, JobState::Completed, Duration::from_secs(10)).await;
    let task = done.execution[0].clone();

    // Replay the terminal report several times; nothing may change.
    for _ in 0..3 {
        c.broker
            .publish_task(drover_core::queue::QUEUE_COMPLETED, &task)
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let after = c.ds.get_job(&job.id).await.unwrap();
    assert_eq!(after.state, JobState::Completed);
    assert_eq!(after.position, done.position, "position is monotonic");
    assert_eq!(after.execution.len(), done.execution.len());
    c.worker.stop();
    c.coordinator.stop();
}
