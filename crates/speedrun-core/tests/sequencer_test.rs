//! Sequencer behavior with fake stage bodies: ordering, skipping, fail-fast, background joins.

use async_trait::async_trait;
use speedrun_core::background::spawn_with;
use speedrun_core::{
    BootstrapWarning, CommandRunner, CommandSpec, ConfigFile, EnvironmentManager, ExitOutcome, MapEnvSource,
    PipelineStatus, ProcessEnv, ProgressEvent, RecordingProgressSink, RunConfig, Stage, StageSequencer,
    TracingProgressSink,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

/// Records every invocation and exits with a scripted status per program.
#[derive(Default)]
struct FakeRunner {
    invoked: Mutex<Vec<String>>,
    exits: HashMap<String, i32>,
    delays: HashMap<String, Duration>,
}

impl FakeRunner {
    fn with_exit(mut self, program: &str, code: i32) -> Self {
        self.exits.insert(program.to_string(), code);
        self
    }

    fn with_delay(mut self, program: &str, delay: Duration) -> Self {
        self.delays.insert(program.to_string(), delay);
        self
    }

    fn invoked(&self) -> Vec<String> {
        self.invoked.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, command: &CommandSpec, _env: &ProcessEnv) -> ExitOutcome {
        self.invoked.lock().unwrap().push(command.program.clone());
        if let Some(delay) = self.delays.get(&command.program) {
            tokio::time::sleep(*delay).await;
        }
        ExitOutcome::Exited(self.exits.get(&command.program).copied().unwrap_or(0))
    }
}

fn config(pairs: &[(&str, &str)]) -> RunConfig {
    let env = EnvironmentManager::new(
        Box::new(MapEnvSource::from_pairs(pairs.iter().copied())),
        PathBuf::from("."),
    );
    RunConfig::resolve(&env, &ConfigFile::default()).unwrap()
}

fn stage(name: &str) -> Stage {
    Stage::new(name, CommandSpec::new(name, Vec::<String>::new()))
}

fn sequencer(runner: &Arc<FakeRunner>) -> (StageSequencer, Arc<RecordingProgressSink>) {
    let sink = Arc::new(RecordingProgressSink::default());
    (StageSequencer::new(runner.clone(), sink.clone()), sink)
}

#[tokio::test]
async fn test_invocation_order_matches_declaration() {
    let runner = Arc::new(FakeRunner::default());
    let (sequencer, _) = sequencer(&runner);
    let stages = vec![stage("one"), stage("two"), stage("three")];

    let result = sequencer.run(&stages, &config(&[])).await;

    assert!(result.is_completed());
    assert_eq!(runner.invoked(), vec!["one", "two", "three"]);
    assert_eq!(result.invoked(), vec!["one", "two", "three"]);
    assert_eq!(result.exit_code(), 0);
}

#[tokio::test]
async fn test_nothing_runs_after_a_failure() {
    let runner = Arc::new(FakeRunner::default().with_exit("two", 3));
    let (sequencer, sink) = sequencer(&runner);
    let stages = vec![stage("one"), stage("two"), stage("three"), stage("four")];

    let result = sequencer.run(&stages, &config(&[])).await;

    assert_eq!(
        result.status,
        PipelineStatus::Failed { index: 1, stage: "two".to_string(), outcome: ExitOutcome::Exited(3) }
    );
    assert_eq!(result.exit_code(), 3);
    assert_eq!(runner.invoked(), vec!["one", "two"]);
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::StageFailed { stage, .. } if stage == "two")));
}

#[tokio::test]
async fn test_skipped_stage_is_never_invoked() {
    let runner = Arc::new(FakeRunner::default());
    let (sequencer, _) = sequencer(&runner);
    let stages = vec![
        stage("train"),
        stage("eval").skip_when(|c| !c.eval_enabled),
        stage("next"),
    ];

    let result = sequencer.run(&stages, &config(&[("NANOCHAT_RUN_EVAL", "0")])).await;

    assert!(result.is_completed());
    assert_eq!(runner.invoked(), vec!["train", "next"]);
    assert_eq!(result.skipped(), vec!["eval"]);
}

#[tokio::test]
async fn test_skipped_failing_stage_does_not_fail_the_run() {
    let runner = Arc::new(FakeRunner::default().with_exit("broken", 1));
    let (sequencer, _) = sequencer(&runner);
    let stages = vec![stage("broken").skip_when(|_| true), stage("after")];

    let result = sequencer.run(&stages, &config(&[])).await;

    assert!(result.is_completed());
    assert_eq!(runner.invoked(), vec!["after"]);
}

#[tokio::test]
async fn test_empty_pipeline_completes() {
    let runner = Arc::new(FakeRunner::default());
    let (sequencer, _) = sequencer(&runner);

    let result = sequencer.run(&[], &config(&[])).await;

    assert!(result.is_completed());
    assert!(result.records.is_empty());
}

#[tokio::test]
async fn test_background_stage_runs_concurrently_and_is_joined() {
    let runner = Arc::new(FakeRunner::default().with_delay("download", Duration::from_millis(50)));
    let (sequencer, sink) = sequencer(&runner);
    let stages = vec![
        stage("download").in_background(),
        stage("tokenize"),
        stage("pretrain").after_background(),
    ];

    let result = sequencer.run(&stages, &config(&[])).await;

    assert!(result.is_completed());
    assert!(result.warnings.is_empty());
    let events = sink.events();
    let joined = events.iter().position(|e| matches!(e, ProgressEvent::BackgroundJoined { .. })).unwrap();
    let pretrain = events
        .iter()
        .position(|e| matches!(e, ProgressEvent::StageStarted { stage, .. } if stage == "pretrain"))
        .unwrap();
    let tokenize = events
        .iter()
        .position(|e| matches!(e, ProgressEvent::StageStarted { stage, .. } if stage == "tokenize"))
        .unwrap();
    assert!(tokenize < joined, "tokenize must not wait for the download");
    assert!(joined < pretrain, "pretrain must start after the join");
}

#[tokio::test]
async fn test_join_on_finished_unit_does_not_wait() {
    let runner = Arc::new(FakeRunner::default());
    let (sequencer, sink) = sequencer(&runner);
    let handle = spawn_with("dataset", async { ExitOutcome::Exited(0) });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(handle.is_finished());

    let stages = vec![stage("pretrain").after_background()];
    let result = tokio::time::timeout(
        Duration::from_millis(200),
        sequencer.run_with(&stages, &config(&[]), Some(handle)),
    )
    .await
    .unwrap();

    assert!(result.is_completed());
    let events = sink.events();
    assert!(!events.iter().any(|e| matches!(e, ProgressEvent::BackgroundWaiting { .. })));
    assert!(events.iter().any(|e| matches!(e, ProgressEvent::BackgroundJoined { .. })));
}

#[tokio::test]
async fn test_join_without_background_unit_warns_and_continues() {
    let runner = Arc::new(FakeRunner::default());
    let (sequencer, _) = sequencer(&runner);
    let stages = vec![
        stage("download").in_background().skip_when(|_| true),
        stage("pretrain").after_background(),
    ];

    let result = sequencer.run(&stages, &config(&[])).await;

    assert!(result.is_completed());
    assert_eq!(runner.invoked(), vec!["pretrain"]);
    assert_eq!(
        result.warnings,
        vec![BootstrapWarning::BackgroundJoinFailure { stage: "pretrain".to_string() }]
    );
}

#[tokio::test]
async fn test_failed_background_unit_halts_at_the_join_stage() {
    let runner = Arc::new(FakeRunner::default().with_exit("download", 2));
    let (sequencer, sink) = sequencer(&runner);
    let stages = vec![
        stage("download").in_background(),
        stage("tokenize"),
        stage("pretrain").after_background(),
        stage("midtrain"),
    ];

    let result = sequencer.run(&stages, &config(&[])).await;

    assert_eq!(
        result.status,
        PipelineStatus::BackgroundFailed {
            index: 2,
            joined_at: "pretrain".to_string(),
            background: "download".to_string(),
            outcome: ExitOutcome::Exited(2),
        }
    );
    assert_eq!(result.failed_stage(), Some("download"));
    assert_eq!(result.exit_code(), 2);
    assert_eq!(runner.invoked(), vec!["download", "tokenize"]);
    assert_eq!(result.invoked(), vec!["download", "tokenize"]);

    let events = sink.events();
    assert!(!events.iter().any(|e| matches!(e, ProgressEvent::StageFailed { .. })));
    assert!(events.iter().any(
        |e| matches!(e, ProgressEvent::BackgroundFailed { background, joined_at, .. } if background == "download" && joined_at == "pretrain")
    ));
}

/// In-memory log sink for the fmt subscriber.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap()).lines().map(str::to_string).collect()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[tokio::test]
async fn test_stage_events_are_logged_once() {
    let logs = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .without_time()
        .with_max_level(Level::INFO)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let runner = Arc::new(FakeRunner::default().with_exit("boom", 1));
    let sequencer = StageSequencer::new(runner, Arc::new(TracingProgressSink));
    let stages = vec![stage("quiet").skip_when(|_| true), stage("boom")];

    let result = sequencer.run(&stages, &config(&[])).await;
    assert_eq!(result.failed_stage(), Some("boom"));

    let lines = logs.lines();
    assert_eq!(lines.iter().filter(|l| l.contains("stage=quiet")).count(), 1, "{lines:#?}");
    assert_eq!(
        lines.iter().filter(|l| l.contains("ERROR") && l.contains("stage=boom")).count(),
        1,
        "{lines:#?}"
    );
}
