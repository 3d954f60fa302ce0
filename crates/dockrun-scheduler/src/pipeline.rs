//! Build pipeline - runs one job through its stages in order.
//!
//! Stages are gated on the previous one: workspace, archive, image build,
//! container create, then each command. The first failure publishes one
//! error event and skips straight to cleanup. Cleanup always runs and never
//! changes the outcome that was already reported.

use async_trait::async_trait;
use bytes::Bytes;
use dockrun_core::runtime::{BuildOutcome, BuildOutput, ContainerRuntime, ExecOutput};
use dockrun_core::{
    BuildJob, CommandResult, Error, Event, EventContent, EventSink, EventType, Result, RunId,
    Subject,
};
use dockrun_executor::create_archive;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::worker::JobHandler;

/// Build descriptor expected at the root of every project.
pub const DOCKERFILE: &str = "Dockerfile";

const ARCHIVE_NAME: &str = "archive.tar";

/// A step of a build run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Workspace,
    Archive,
    ImageBuild,
    ContainerCreate,
    /// Command at this index of the job's command list.
    Command(usize),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Workspace => write!(f, "workspace"),
            Stage::Archive => write!(f, "archive"),
            Stage::ImageBuild => write!(f, "image build"),
            Stage::ContainerCreate => write!(f, "container create"),
            Stage::Command(index) => write!(f, "command {}", index),
        }
    }
}

/// Terminal state of a build run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed { stage: Stage, reason: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }
}

/// Result of a pipeline run.
#[derive(Debug)]
pub struct PipelineResult {
    pub run_id: RunId,
    pub outcome: RunOutcome,
}

/// Filesystem roots and limits for pipeline runs.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Job folders are resolved under this directory.
    pub projects_root: PathBuf,
    /// Each run gets its own directory under this one.
    pub workspace_root: PathBuf,
    /// Upper bound for a single command, `None` to wait forever.
    pub command_timeout: Option<Duration>,
    /// Remove the built image during cleanup.
    pub remove_images: bool,
}

/// Transient state owned by a single run.
///
/// The image and container ids are set at most once and are only released
/// by cleanup. If the context is dropped before cleanup finished (a panic
/// or the run future being cancelled) the workspace directory is still
/// removed.
#[derive(Debug)]
pub struct BuildContext {
    pub run_id: RunId,
    workspace: PathBuf,
    archive: PathBuf,
    image_id: Option<String>,
    container_id: Option<String>,
    workspace_created: bool,
}

impl BuildContext {
    pub fn new(workspace_root: &Path) -> Self {
        let run_id = RunId::new();
        let workspace = workspace_root.join(run_id.to_string());
        let archive = workspace.join(ARCHIVE_NAME);
        Self {
            run_id,
            workspace,
            archive,
            image_id: None,
            container_id: None,
            workspace_created: false,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive
    }

    pub fn container_name(&self) -> String {
        format!("dockrun-{}", self.run_id)
    }

    pub fn image_id(&self) -> Option<&str> {
        self.image_id.as_deref()
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    fn set_image(&mut self, id: String) {
        self.image_id.get_or_insert(id);
    }

    fn set_container(&mut self, id: String) {
        self.container_id.get_or_insert(id);
    }

    async fn create_workspace(&mut self) -> Result<()> {
        let root = self
            .workspace
            .parent()
            .ok_or_else(|| Error::Workspace("workspace has no parent directory".to_string()))?;
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| Error::Workspace(format!("{}: {}", root.display(), e)))?;

        let mut builder = tokio::fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(0o700);
        builder
            .create(&self.workspace)
            .await
            .map_err(|e| Error::Workspace(format!("{}: {}", self.workspace.display(), e)))?;

        self.workspace_created = true;
        debug!(workspace = %self.workspace.display(), "Workspace created");
        Ok(())
    }

    async fn remove_workspace(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.workspace_created) {
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.workspace).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Workspace(format!(
                "{}: {}",
                self.workspace.display(),
                e
            ))),
        }
    }
}

impl Drop for BuildContext {
    fn drop(&mut self) {
        if !self.workspace_created {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.workspace) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(workspace = %self.workspace.display(), error = %e, "Failed to remove workspace");
            }
        }
    }
}

/// Publishes events for one job. Publish failures are logged only.
struct Reporter<'a> {
    sink: &'a dyn EventSink,
    job: &'a BuildJob,
}

impl Reporter<'_> {
    async fn emit(&self, subject: Subject, kind: EventType, content: impl Into<EventContent>) {
        let event = Event::new(self.job, subject, kind, content);
        debug!(?subject, ?kind, "Publishing event");
        if let Err(e) = self.sink.publish(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }
}

/// Runs build jobs against a container runtime.
pub struct BuildPipeline {
    runtime: Arc<dyn ContainerRuntime>,
    events: Arc<dyn EventSink>,
    settings: PipelineSettings,
}

impl BuildPipeline {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        events: Arc<dyn EventSink>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            runtime,
            events,
            settings,
        }
    }

    /// Run one job to completion, including cleanup.
    pub async fn run(&self, job: &BuildJob) -> PipelineResult {
        let mut ctx = BuildContext::new(&self.settings.workspace_root);
        let run_id = ctx.run_id;
        let span = info_span!(
            "build",
            run_id = %run_id,
            project_id = %job.project_id,
            build_id = %job.build_id
        );

        async {
            info!(commands = job.commands.len(), "Starting build");

            let reporter = Reporter {
                sink: self.events.as_ref(),
                job,
            };
            let outcome = self.run_stages(job, &mut ctx, &reporter).await;

            match &outcome {
                RunOutcome::Succeeded => info!("Build succeeded"),
                RunOutcome::Failed { stage, reason } => {
                    warn!(stage = %stage, reason = %reason, "Build failed")
                }
            }

            self.cleanup(&mut ctx).await;
            PipelineResult { run_id, outcome }
        }
        .instrument(span)
        .await
    }

    async fn run_stages(
        &self,
        job: &BuildJob,
        ctx: &mut BuildContext,
        reporter: &Reporter<'_>,
    ) -> RunOutcome {
        if let Err(e) = ctx.create_workspace().await {
            error!(error = %e, "Failed to create workspace");
            return fail(reporter, Subject::Build, Stage::Workspace, e.to_string()).await;
        }

        if let Err(e) = self.archive(job, ctx).await {
            return fail(reporter, Subject::Build, Stage::Archive, e.to_string()).await;
        }

        let image = match self.build_image(ctx).await {
            Ok(BuildOutput {
                outcome: BuildOutcome::Image(id),
                log,
            }) => {
                info!(image = %id, "Image built");
                reporter.emit(Subject::Build, EventType::Info, log).await;
                id
            }
            Ok(BuildOutput {
                outcome: BuildOutcome::Failed(reason),
                log,
            }) => {
                debug!(log = %log, "Build log");
                return fail(reporter, Subject::Build, Stage::ImageBuild, reason).await;
            }
            Err(e) => {
                return fail(reporter, Subject::Build, Stage::ImageBuild, e.to_string()).await;
            }
        };
        ctx.set_image(image.clone());

        let container = match self
            .runtime
            .create_container(&image, &ctx.container_name())
            .await
        {
            Ok(id) => {
                ctx.set_container(id.clone());
                reporter
                    .emit(
                        Subject::Build,
                        EventType::Info,
                        "Container created successfully.",
                    )
                    .await;
                id
            }
            Err(e) => {
                if let Error::ContainerStart { container_id, .. } = &e {
                    ctx.set_container(container_id.clone());
                }
                return fail(
                    reporter,
                    Subject::Build,
                    Stage::ContainerCreate,
                    e.to_string(),
                )
                .await;
            }
        };

        for (index, argv) in job.commands.iter().enumerate() {
            let stage = Stage::Command(index);
            if argv.is_empty() {
                let e = Error::InvalidInput(format!("command {} is empty", index));
                return fail(reporter, Subject::Command, stage, e.to_string()).await;
            }

            let command = argv.join(" ");
            info!(index, command = %command, "Running command");

            let output = match self.exec_command(&container, argv).await {
                Ok(output) => output,
                Err(e) => {
                    return fail(reporter, Subject::Command, stage, e.to_string()).await;
                }
            };

            let exit_code = output.exit_code;
            let result = CommandResult {
                command,
                exit_code,
                stdout: output.output,
            };

            if exit_code != 0 {
                reporter
                    .emit(Subject::Command, EventType::Error, result)
                    .await;
                return RunOutcome::Failed {
                    stage,
                    reason: format!("command exited with code {}", exit_code),
                };
            }

            reporter
                .emit(Subject::Command, EventType::Success, result)
                .await;
        }

        reporter
            .emit(Subject::Build, EventType::Success, "Build successful")
            .await;
        RunOutcome::Succeeded
    }

    async fn archive(&self, job: &BuildJob, ctx: &BuildContext) -> Result<()> {
        let source = job.source_path(&self.settings.projects_root)?;
        let dest = ctx.archive_path().to_path_buf();

        tokio::task::spawn_blocking(move || create_archive(&source, &dest))
            .await
            .map_err(|e| Error::ArchiveIo(e.to_string()))??;
        Ok(())
    }

    async fn build_image(&self, ctx: &BuildContext) -> Result<BuildOutput> {
        let archive = tokio::fs::read(ctx.archive_path())
            .await
            .map_err(|e| Error::ArchiveIo(format!("{}: {}", ctx.archive_path().display(), e)))?;
        self.runtime
            .build_image(Bytes::from(archive), DOCKERFILE)
            .await
    }

    async fn exec_command(&self, container: &str, argv: &[String]) -> Result<ExecOutput> {
        let exec = self.runtime.exec(container, argv);
        match self.settings.command_timeout {
            Some(limit) => tokio::time::timeout(limit, exec)
                .await
                .map_err(|_| Error::Timeout(format!("command timed out after {:?}", limit)))?,
            None => exec.await,
        }
    }

    async fn cleanup(&self, ctx: &mut BuildContext) {
        if let Some(container) = ctx.container_id() {
            if let Err(e) = self.runtime.remove_container(container).await {
                warn!(container, error = %e, "Failed to remove container");
            }
        }

        if self.settings.remove_images {
            if let Some(image) = ctx.image_id() {
                if let Err(e) = self.runtime.remove_image(image).await {
                    warn!(image, error = %e, "Failed to remove image");
                }
            }
        }

        if let Err(e) = ctx.remove_workspace().await {
            warn!(error = %e, "Failed to remove workspace");
        }
    }
}

async fn fail(
    reporter: &Reporter<'_>,
    subject: Subject,
    stage: Stage,
    reason: String,
) -> RunOutcome {
    reporter
        .emit(subject, EventType::Error, reason.clone())
        .await;
    RunOutcome::Failed { stage, reason }
}

#[async_trait]
impl JobHandler for BuildPipeline {
    async fn handle(&self, job: BuildJob) {
        self.run(&job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockrun_core::runtime::BuildLine;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone, Copy)]
    enum BuildScript {
        Image(&'static str),
        Fail(&'static str),
        Unreachable,
    }

    #[derive(Clone, Copy)]
    enum CreateScript {
        Ok,
        CreateFails,
        StartFails,
    }

    #[derive(Clone, Copy)]
    enum ExecScript {
        Exit(i64, &'static str),
        AttachFails,
        Hang,
    }

    struct MockRuntime {
        build: BuildScript,
        create: CreateScript,
        exec: HashMap<String, ExecScript>,
        remove_fails: bool,
        calls: Mutex<Vec<String>>,
    }

    impl MockRuntime {
        fn new() -> Self {
            Self {
                build: BuildScript::Image("sha256:abcd"),
                create: CreateScript::Ok,
                exec: HashMap::new(),
                remove_fails: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn build(mut self, script: BuildScript) -> Self {
            self.build = script;
            self
        }

        fn create(mut self, script: CreateScript) -> Self {
            self.create = script;
            self
        }

        fn exec(mut self, command: &str, script: ExecScript) -> Self {
            self.exec.insert(command.to_string(), script);
            self
        }

        fn remove_fails(mut self) -> Self {
            self.remove_fails = true;
            self
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn called(&self, prefix: &str) -> bool {
            self.calls().iter().any(|c| c.starts_with(prefix))
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn build_image(&self, archive: Bytes, dockerfile: &str) -> Result<BuildOutput> {
            assert_eq!(dockerfile, DOCKERFILE);
            assert!(!archive.is_empty());
            self.record("build".to_string());
            let progress = BuildLine::Progress("Step 1/1 : FROM alpine\n".to_string());
            match self.build {
                BuildScript::Image(id) => Ok(BuildOutput::from_lines(vec![
                    progress,
                    BuildLine::Image(id.to_string()),
                ])),
                BuildScript::Fail(reason) => Ok(BuildOutput::from_lines(vec![
                    progress,
                    BuildLine::Error(reason.to_string()),
                ])),
                BuildScript::Unreachable => Err(Error::Connect("daemon not running".to_string())),
            }
        }

        async fn create_container(&self, image: &str, name: &str) -> Result<String> {
            self.record(format!("create:{}:{}", image, name));
            match self.create {
                CreateScript::Ok => Ok("container-1".to_string()),
                CreateScript::CreateFails => {
                    Err(Error::ContainerCreate("no such image".to_string()))
                }
                CreateScript::StartFails => Err(Error::ContainerStart {
                    container_id: "container-1".to_string(),
                    message: "port in use".to_string(),
                }),
            }
        }

        async fn exec(&self, container: &str, argv: &[String]) -> Result<ExecOutput> {
            assert_eq!(container, "container-1");
            let command = argv.join(" ");
            self.record(format!("exec:{}", command));
            match self
                .exec
                .get(&command)
                .copied()
                .unwrap_or(ExecScript::Exit(0, "ok\n"))
            {
                ExecScript::Exit(exit_code, output) => Ok(ExecOutput {
                    exit_code,
                    output: output.to_string(),
                }),
                ExecScript::AttachFails => {
                    Err(Error::ExecAttach("connection reset".to_string()))
                }
                ExecScript::Hang => std::future::pending().await,
            }
        }

        async fn remove_container(&self, container: &str) -> Result<()> {
            self.record(format!("remove:{}", container));
            if self.remove_fails {
                return Err(Error::Connect("daemon went away".to_string()));
            }
            Ok(())
        }

        async fn remove_image(&self, image: &str) -> Result<()> {
            self.record(format!("remove_image:{}", image));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&self, event: Event) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct Fixture {
        projects: TempDir,
        workspaces: TempDir,
        runtime: Arc<MockRuntime>,
        sink: Arc<RecordingSink>,
        command_timeout: Option<Duration>,
        remove_images: bool,
    }

    impl Fixture {
        fn new(runtime: MockRuntime) -> Self {
            let projects = TempDir::new().unwrap();
            let app = projects.path().join("app");
            fs::create_dir(&app).unwrap();
            fs::write(app.join(DOCKERFILE), "FROM alpine:latest\n").unwrap();
            fs::write(app.join("main.sh"), "echo hi\n").unwrap();

            Self {
                projects,
                workspaces: TempDir::new().unwrap(),
                runtime: Arc::new(runtime),
                sink: Arc::new(RecordingSink::default()),
                command_timeout: None,
                remove_images: false,
            }
        }

        fn pipeline(&self) -> BuildPipeline {
            self.pipeline_with_workspace_root(self.workspaces.path().to_path_buf())
        }

        fn pipeline_with_workspace_root(&self, workspace_root: PathBuf) -> BuildPipeline {
            BuildPipeline::new(
                self.runtime.clone(),
                self.sink.clone(),
                PipelineSettings {
                    projects_root: self.projects.path().to_path_buf(),
                    workspace_root,
                    command_timeout: self.command_timeout,
                    remove_images: self.remove_images,
                },
            )
        }

        fn workspaces_left(&self) -> usize {
            fs::read_dir(self.workspaces.path()).unwrap().count()
        }
    }

    fn job(folder: &str, commands: &[&[&str]]) -> BuildJob {
        BuildJob {
            project_id: "proj".to_string(),
            build_id: "7".to_string(),
            folder: folder.to_string(),
            commands: commands
                .iter()
                .map(|argv| argv.iter().map(|s| s.to_string()).collect())
                .collect(),
        }
    }

    fn summary(events: &[Event]) -> Vec<(Subject, EventType)> {
        events.iter().map(|e| (e.subject, e.kind)).collect()
    }

    fn text(event: &Event) -> &str {
        match &event.content {
            EventContent::Text(text) => text,
            EventContent::Command(_) => panic!("expected text content"),
        }
    }

    fn command_result(event: &Event) -> &CommandResult {
        match &event.content {
            EventContent::Command(result) => result,
            EventContent::Text(text) => panic!("expected command result, got {}", text),
        }
    }

    /// One terminal error event or one final success, never both.
    fn assert_single_terminal(events: &[Event]) {
        let errors = events.iter().filter(|e| e.kind == EventType::Error).count();
        let build_successes = events
            .iter()
            .filter(|e| e.subject == Subject::Build && e.kind == EventType::Success)
            .count();
        assert!(
            (errors == 1 && build_successes == 0) || (errors == 0 && build_successes == 1),
            "errors={} build_successes={}",
            errors,
            build_successes
        );
        let last = events.last().unwrap();
        assert!(last.kind == EventType::Error || last.subject == Subject::Build);
    }

    #[tokio::test]
    async fn test_empty_command_list_succeeds() {
        let fixture = Fixture::new(MockRuntime::new());

        let result = fixture.pipeline().run(&job("app", &[])).await;

        assert_eq!(result.outcome, RunOutcome::Succeeded);
        let events = fixture.sink.events();
        assert_eq!(
            summary(&events),
            vec![
                (Subject::Build, EventType::Info),
                (Subject::Build, EventType::Info),
                (Subject::Build, EventType::Success),
            ]
        );
        assert!(text(&events[0]).contains("Step 1/1"));
        assert_eq!(text(&events[1]), "Container created successfully.");
        assert_eq!(text(&events[2]), "Build successful");
        assert!(events.iter().all(|e| e.project_id == "proj" && e.build_id == "7"));
        assert_single_terminal(&events);
        assert_eq!(fixture.workspaces_left(), 0);
        assert!(fixture.runtime.called("remove:container-1"));
    }

    #[tokio::test]
    async fn test_commands_run_in_order() {
        let fixture = Fixture::new(MockRuntime::new().exec("echo two", ExecScript::Exit(0, "two\n")));

        let result = fixture
            .pipeline()
            .run(&job("app", &[&["echo", "one"], &["echo", "two"]]))
            .await;

        assert!(result.outcome.is_success());
        let events = fixture.sink.events();
        let commands: Vec<_> = events
            .iter()
            .filter(|e| e.subject == Subject::Command)
            .map(|e| (e.kind, command_result(e).command.clone()))
            .collect();
        assert_eq!(
            commands,
            vec![
                (EventType::Success, "echo one".to_string()),
                (EventType::Success, "echo two".to_string()),
            ]
        );
        assert_eq!(command_result(&events[3]).stdout, "two\n");
        assert_eq!(events.last().unwrap().kind, EventType::Success);
        assert_single_terminal(&events);
    }

    #[tokio::test]
    async fn test_stops_at_first_non_zero_exit() {
        let fixture = Fixture::new(MockRuntime::new().exec("false", ExecScript::Exit(1, "nope\n")));

        let result = fixture
            .pipeline()
            .run(&job("app", &[&["echo", "one"], &["false"], &["echo", "three"]]))
            .await;

        assert_eq!(
            result.outcome,
            RunOutcome::Failed {
                stage: Stage::Command(1),
                reason: "command exited with code 1".to_string(),
            }
        );

        let events = fixture.sink.events();
        let command_events: Vec<_> = events
            .iter()
            .filter(|e| e.subject == Subject::Command)
            .collect();
        assert_eq!(command_events.len(), 2);
        assert_eq!(command_events[0].kind, EventType::Success);
        assert_eq!(command_events[1].kind, EventType::Error);
        assert_eq!(
            command_result(command_events[1]),
            &CommandResult {
                command: "false".to_string(),
                exit_code: 1,
                stdout: "nope\n".to_string(),
            }
        );

        assert!(!fixture.runtime.called("exec:echo three"));
        assert_single_terminal(&events);
        assert!(fixture.runtime.called("remove:container-1"));
        assert_eq!(fixture.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn test_attach_failure_aborts_remaining_commands() {
        let fixture = Fixture::new(MockRuntime::new().exec("make", ExecScript::AttachFails));

        let result = fixture
            .pipeline()
            .run(&job("app", &[&["make"], &["make", "install"]]))
            .await;

        assert!(matches!(
            result.outcome,
            RunOutcome::Failed {
                stage: Stage::Command(0),
                ..
            }
        ));
        let events = fixture.sink.events();
        let last = events.last().unwrap();
        assert_eq!((last.subject, last.kind), (Subject::Command, EventType::Error));
        assert!(text(last).contains("connection reset"));
        assert!(!fixture.runtime.called("exec:make install"));
        assert_single_terminal(&events);
    }

    #[tokio::test]
    async fn test_empty_argv_is_rejected() {
        let fixture = Fixture::new(MockRuntime::new());

        let result = fixture.pipeline().run(&job("app", &[&[], &["ls"]])).await;

        assert!(!result.outcome.is_success());
        assert!(!fixture.runtime.called("exec:"));
        let events = fixture.sink.events();
        assert_eq!(events.last().unwrap().subject, Subject::Command);
        assert_single_terminal(&events);
    }

    #[tokio::test]
    async fn test_command_timeout_aborts_run() {
        let mut fixture = Fixture::new(MockRuntime::new().exec("sleep forever", ExecScript::Hang));
        fixture.command_timeout = Some(Duration::from_millis(50));

        let result = fixture
            .pipeline()
            .run(&job("app", &[&["sleep", "forever"], &["echo", "after"]]))
            .await;

        assert!(matches!(
            result.outcome,
            RunOutcome::Failed {
                stage: Stage::Command(0),
                ..
            }
        ));
        let events = fixture.sink.events();
        assert!(text(events.last().unwrap()).contains("timed out"));
        assert!(!fixture.runtime.called("exec:echo after"));
        assert!(fixture.runtime.called("remove:container-1"));
        assert_eq!(fixture.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn test_build_failure_reports_reason() {
        let fixture = Fixture::new(MockRuntime::new().build(BuildScript::Fail("COPY failed")));

        let result = fixture
            .pipeline()
            .run(&job("app", &[&["echo", "never"]]))
            .await;

        assert_eq!(
            result.outcome,
            RunOutcome::Failed {
                stage: Stage::ImageBuild,
                reason: "COPY failed".to_string(),
            }
        );
        let events = fixture.sink.events();
        assert_eq!(summary(&events), vec![(Subject::Build, EventType::Error)]);
        assert_eq!(text(&events[0]), "COPY failed");
        assert!(!fixture.runtime.called("create:"));
        assert!(!fixture.runtime.called("remove:"));
        assert_eq!(fixture.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_runtime_fails_build() {
        let fixture = Fixture::new(MockRuntime::new().build(BuildScript::Unreachable));

        let result = fixture.pipeline().run(&job("app", &[])).await;

        assert!(matches!(
            result.outcome,
            RunOutcome::Failed {
                stage: Stage::ImageBuild,
                ..
            }
        ));
        let events = fixture.sink.events();
        assert!(text(&events[0]).contains("daemon not running"));
        assert_single_terminal(&events);
    }

    #[tokio::test]
    async fn test_image_id_is_stripped_before_create() {
        let fixture = Fixture::new(MockRuntime::new());

        let result = fixture.pipeline().run(&job("app", &[])).await;

        let name = format!("dockrun-{}", result.run_id);
        assert!(fixture.runtime.called(&format!("create:abcd:{}", name)));
    }

    #[tokio::test]
    async fn test_missing_project_folder_fails_archive() {
        let fixture = Fixture::new(MockRuntime::new());

        let result = fixture.pipeline().run(&job("missing", &[])).await;

        assert!(matches!(
            result.outcome,
            RunOutcome::Failed {
                stage: Stage::Archive,
                ..
            }
        ));
        let events = fixture.sink.events();
        assert_eq!(summary(&events), vec![(Subject::Build, EventType::Error)]);
        assert!(text(&events[0]).contains("does not exist"));
        assert!(fixture.runtime.calls().is_empty());
        assert_eq!(fixture.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn test_folder_outside_projects_root_is_rejected() {
        let fixture = Fixture::new(MockRuntime::new());

        let result = fixture.pipeline().run(&job("../app", &[])).await;

        assert!(matches!(
            result.outcome,
            RunOutcome::Failed {
                stage: Stage::Archive,
                ..
            }
        ));
        assert!(fixture.runtime.calls().is_empty());
        assert_eq!(fixture.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn test_workspace_failure_is_reported() {
        let fixture = Fixture::new(MockRuntime::new());
        let not_a_dir = fixture.workspaces.path().join("file");
        fs::write(&not_a_dir, "").unwrap();

        let result = fixture
            .pipeline_with_workspace_root(not_a_dir)
            .run(&job("app", &[]))
            .await;

        assert!(matches!(
            result.outcome,
            RunOutcome::Failed {
                stage: Stage::Workspace,
                ..
            }
        ));
        let events = fixture.sink.events();
        assert_eq!(summary(&events), vec![(Subject::Build, EventType::Error)]);
        assert!(fixture.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_skips_commands() {
        let fixture = Fixture::new(MockRuntime::new().create(CreateScript::CreateFails));

        let result = fixture.pipeline().run(&job("app", &[&["ls"]])).await;

        assert!(matches!(
            result.outcome,
            RunOutcome::Failed {
                stage: Stage::ContainerCreate,
                ..
            }
        ));
        let events = fixture.sink.events();
        assert_eq!(
            summary(&events),
            vec![
                (Subject::Build, EventType::Info),
                (Subject::Build, EventType::Error),
            ]
        );
        assert!(!fixture.runtime.called("exec:"));
        assert!(!fixture.runtime.called("remove:"));
        assert_eq!(fixture.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_still_removes_container() {
        let fixture = Fixture::new(MockRuntime::new().create(CreateScript::StartFails));

        let result = fixture.pipeline().run(&job("app", &[&["ls"]])).await;

        assert!(!result.outcome.is_success());
        let events = fixture.sink.events();
        assert!(text(events.last().unwrap()).contains("port in use"));
        assert!(!fixture.runtime.called("exec:"));
        assert!(fixture.runtime.called("remove:container-1"));
        assert_single_terminal(&events);
    }

    #[tokio::test]
    async fn test_cleanup_failure_keeps_outcome() {
        let fixture = Fixture::new(MockRuntime::new().remove_fails());

        let result = fixture.pipeline().run(&job("app", &[&["ls"]])).await;

        assert_eq!(result.outcome, RunOutcome::Succeeded);
        let events = fixture.sink.events();
        let last = events.last().unwrap();
        assert_eq!((last.subject, last.kind), (Subject::Build, EventType::Success));
        assert_single_terminal(&events);
        assert_eq!(fixture.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn test_remove_images_after_container() {
        let mut fixture = Fixture::new(MockRuntime::new());
        fixture.remove_images = true;

        fixture.pipeline().run(&job("app", &[])).await;

        let calls = fixture.runtime.calls();
        let container = calls.iter().position(|c| c == "remove:container-1").unwrap();
        let image = calls.iter().position(|c| c == "remove_image:abcd").unwrap();
        assert!(container < image);
    }

    #[test]
    fn test_each_run_gets_a_fresh_workspace() {
        let first = BuildContext::new(Path::new("/tmp/ws"));
        let second = BuildContext::new(Path::new("/tmp/ws"));

        assert_ne!(first.workspace(), second.workspace());
        assert_eq!(first.workspace().parent(), Some(Path::new("/tmp/ws")));
        assert_eq!(first.archive_path(), first.workspace().join(ARCHIVE_NAME));
        assert!(first.image_id().is_none());
        assert!(first.container_id().is_none());
    }

    #[test]
    fn test_context_ids_are_set_once() {
        let mut ctx = BuildContext::new(Path::new("/tmp/ws"));
        ctx.set_image("first".to_string());
        ctx.set_image("second".to_string());
        ctx.set_container("c1".to_string());
        ctx.set_container("c2".to_string());

        assert_eq!(ctx.image_id(), Some("first"));
        assert_eq!(ctx.container_id(), Some("c1"));
    }

    #[tokio::test]
    async fn test_dropped_context_removes_workspace() {
        let root = TempDir::new().unwrap();
        let mut ctx = BuildContext::new(root.path());
        ctx.create_workspace().await.unwrap();
        let workspace = ctx.workspace().to_path_buf();
        assert!(workspace.is_dir());

        drop(ctx);

        assert!(!workspace.exists());
    }
}
