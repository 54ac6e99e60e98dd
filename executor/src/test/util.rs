//! A scripted, in-memory [`ContainerEngine`] for exercising the runner and
//! orchestrator without a Docker daemon.

use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{
    future,
    stream::{self, BoxStream, StreamExt},
};
use tokio_util::sync::CancellationToken;

use crate::{
    err::EngineError,
    orchestrator::{ExecutionLimits, Executor},
    registry::LanguageRegistry,
    runner::{
        model::KILLED_EXIT_CODE, ContainerEngine, ContainerRunner, ContainerSpec,
        ManagedContainer, RunnerOptions,
    },
    workspace::WorkspaceManager,
};

#[derive(Debug, Clone)]
pub enum Outcome {
    Exit(i64),
    /// Runs until killed.
    Hang,
    /// The engine connection drops while waiting.
    FailWait,
}

#[derive(Debug, Clone)]
pub enum Output {
    Fixed(Bytes),
    /// Prints the submitted source back.
    EchoSource,
    /// `count` copies of `byte`, in 64 KiB chunks.
    Repeat(u8, usize),
}

#[derive(Debug, Clone)]
pub struct Script {
    outcome: Outcome,
    output: Output,
    run_for: Duration,
    fail_create: bool,
    fail_start: Option<EngineError>,
    fail_attach: bool,
    fail_logs: bool,
    fail_remove: bool,
}

impl Default for Script {
    fn default() -> Self {
        Script {
            outcome: Outcome::Exit(0),
            output: Output::EchoSource,
            run_for: Duration::ZERO,
            fail_create: false,
            fail_start: None,
            fail_attach: false,
            fail_logs: false,
            fail_remove: false,
        }
    }
}

struct FakeContainer {
    spec: ContainerSpec,
    script: Script,
    killed: CancellationToken,
    attached: bool,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, FakeContainer>,
    next_id: usize,
    specs: Vec<ContainerSpec>,
    create_attempts: usize,
    created: usize,
    removed: usize,
    kills: usize,
    peak_live: usize,
    ensured_images: Vec<String>,
}

/// Containers behave according to the [`Script`] registered for their image,
/// or the default one (exit 0, print the source) otherwise.
#[derive(Default)]
pub struct FakeEngine {
    scripts: HashMap<String, Script>,
    default_script: Script,
    missing_images: HashSet<String>,
    state: Mutex<State>,
}

pub struct ScriptBuilder<'a> {
    engine: &'a mut FakeEngine,
    image: Option<String>,
    script: Script,
}

impl<'a> ScriptBuilder<'a> {
    pub fn returns(&mut self, code: i64) -> &mut Self {
        self.script.outcome = Outcome::Exit(code);
        self
    }

    pub fn hangs(&mut self) -> &mut Self {
        self.script.outcome = Outcome::Hang;
        self
    }

    pub fn fails_to_wait(&mut self) -> &mut Self {
        self.script.outcome = Outcome::FailWait;
        self
    }

    pub fn runs_for(&mut self, d: Duration) -> &mut Self {
        self.script.run_for = d;
        self
    }

    pub fn stdout(&mut self, out: impl Into<Bytes>) -> &mut Self {
        self.script.output = Output::Fixed(out.into());
        self
    }

    pub fn prints_repeated(&mut self, byte: u8, count: usize) -> &mut Self {
        self.script.output = Output::Repeat(byte, count);
        self
    }

    pub fn fails_to_create(&mut self) -> &mut Self {
        self.script.fail_create = true;
        self
    }

    pub fn fails_to_start(&mut self, e: EngineError) -> &mut Self {
        self.script.fail_start = Some(e);
        self
    }

    pub fn fails_to_attach(&mut self) -> &mut Self {
        self.script.fail_attach = true;
        self
    }

    /// The output stream breaks after the first chunk.
    pub fn fails_logs(&mut self) -> &mut Self {
        self.script.fail_logs = true;
        self
    }

    pub fn fails_to_remove(&mut self) -> &mut Self {
        self.script.fail_remove = true;
        self
    }

    pub fn finish(&mut self) {
        let script = std::mem::take(&mut self.script);
        match self.image.take() {
            Some(image) => {
                self.engine.scripts.insert(image, script);
            }
            None => self.engine.default_script = script,
        }
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script containers created from `image`.
    pub fn when(&mut self, image: &str) -> ScriptBuilder<'_> {
        ScriptBuilder {
            engine: self,
            image: Some(image.to_owned()),
            script: Script::default(),
        }
    }

    /// Script every container without an image-specific script.
    pub fn always(&mut self) -> ScriptBuilder<'_> {
        ScriptBuilder {
            engine: self,
            image: None,
            script: Script::default(),
        }
    }

    pub fn missing_image(&mut self, image: &str) {
        self.missing_images.insert(image.to_owned());
    }

    /// Pretend a managed container was left behind at `created_at`.
    pub fn add_leftover(&self, id: &str, created_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(
            id.to_owned(),
            FakeContainer {
                spec: leftover_spec(id),
                script: Script::default(),
                killed: CancellationToken::new(),
                attached: false,
                created_at,
            },
        );
        state.created += 1;
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn create_attempts(&self) -> usize {
        self.state.lock().unwrap().create_attempts
    }

    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn removed(&self) -> usize {
        self.state.lock().unwrap().removed
    }

    pub fn kills(&self) -> usize {
        self.state.lock().unwrap().kills
    }

    pub fn peak_live(&self) -> usize {
        self.state.lock().unwrap().peak_live
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().specs.clone()
    }

    pub fn ensured_images(&self) -> Vec<String> {
        self.state.lock().unwrap().ensured_images.clone()
    }

    fn script_of(&self, image: &str) -> Script {
        self.scripts
            .get(image)
            .unwrap_or(&self.default_script)
            .clone()
    }

    fn with_container<T>(
        &self,
        id: &str,
        f: impl FnOnce(&FakeContainer) -> T,
    ) -> Result<T, EngineError> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(id)
            .map(f)
            .ok_or_else(|| EngineError::NotFound(id.to_owned()))
    }
}

fn leftover_spec(id: &str) -> ContainerSpec {
    ContainerSpec {
        name: id.to_owned(),
        image: "leftover".into(),
        command: vec![],
        working_dir: "/".into(),
        env: vec![],
        mounts: vec![],
        limits: crate::runner::ResourceLimits {
            memory_bytes: 0,
            pids_limit: 0,
            nano_cpus: None,
        },
        user: None,
        labels: HashMap::new(),
    }
}

/// The content of the only file in `dir`.
fn read_source(dir: &Path) -> Bytes {
    let entry = std::fs::read_dir(dir)
        .ok()
        .and_then(|mut d| d.next())
        .and_then(|e| e.ok());
    match entry {
        Some(e) => std::fs::read(e.path()).map(Bytes::from).unwrap_or_default(),
        None => Bytes::new(),
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn name(&self) -> Cow<'static, str> {
        "fake".into()
    }

    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        self.state
            .lock()
            .unwrap()
            .ensured_images
            .push(image.to_owned());
        if self.missing_images.contains(image) {
            return Err(EngineError::NotFound(image.to_owned()));
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let script = self.script_of(&spec.image);
        let mut state = self.state.lock().unwrap();
        state.create_attempts += 1;
        if script.fail_create {
            return Err(EngineError::Rejected {
                status: 500,
                message: "no space left on device".into(),
            });
        }
        // the workspace has to exist before the container
        if let Some(dir) = spec.source_dir() {
            if !dir.is_dir() {
                return Err(EngineError::NotFound(dir.display().to_string()));
            }
        }

        state.next_id += 1;
        let id = format!("fake{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                script,
                killed: CancellationToken::new(),
                attached: false,
                created_at: Utc::now(),
            },
        );
        state.specs.push(spec.clone());
        state.created += 1;
        state.peak_live = state.peak_live.max(state.containers.len());
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        let (fail, attached) =
            self.with_container(id, |c| (c.script.fail_start.clone(), c.attached))?;
        match fail {
            Some(e) => Err(e),
            // output printed before attaching would be lost
            None if !attached => Err(EngineError::Rejected {
                status: 409,
                message: "started before attaching".into(),
            }),
            None => Ok(()),
        }
    }

    async fn wait(&self, id: &str) -> Result<i64, EngineError> {
        let (script, killed) = self.with_container(id, |c| (c.script.clone(), c.killed.clone()))?;
        match script.outcome {
            Outcome::Exit(code) => {
                tokio::select! {
                    _ = killed.cancelled() => Ok(KILLED_EXIT_CODE),
                    _ = tokio::time::sleep(script.run_for) => Ok(code),
                }
            }
            Outcome::Hang => {
                killed.cancelled().await;
                Ok(KILLED_EXIT_CODE)
            }
            Outcome::FailWait => Err(EngineError::Connection("connection reset by peer".into())),
        }
    }

    async fn attach(
        &self,
        id: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, EngineError>>, EngineError> {
        let (script, source_dir, killed) = {
            let mut state = self.state.lock().unwrap();
            let c = state
                .containers
                .get_mut(id)
                .ok_or_else(|| EngineError::NotFound(id.to_owned()))?;
            if c.script.fail_attach {
                return Err(EngineError::Connection("attach was refused".into()));
            }
            c.attached = true;
            (
                c.script.clone(),
                c.spec.source_dir().map(|p| p.to_owned()),
                c.killed.clone(),
            )
        };

        let mut chunks: Vec<Result<Bytes, EngineError>> = match script.output {
            Output::Fixed(b) => vec![Ok(b)],
            Output::EchoSource => vec![Ok(source_dir.map(|d| read_source(&d)).unwrap_or_default())],
            Output::Repeat(byte, count) => {
                let chunk = 64 * 1024;
                (0..count)
                    .step_by(chunk)
                    .map(|start| Ok(Bytes::from(vec![byte; chunk.min(count - start)])))
                    .collect()
            }
        };
        if script.fail_logs {
            chunks.truncate(1);
            chunks.push(Err(EngineError::Connection("log stream broke".into())));
        }

        // like a real attach, the stream stays open until the container stops
        let stopped = async move {
            match script.outcome {
                Outcome::Exit(_) => {
                    tokio::select! {
                        _ = killed.cancelled() => {}
                        _ = tokio::time::sleep(script.run_for) => {}
                    }
                }
                Outcome::Hang => killed.cancelled().await,
                Outcome::FailWait => {}
            }
        };
        Ok(stream::iter(chunks)
            .chain(stream::once(stopped).filter_map(|()| future::ready(None)))
            .boxed())
    }

    async fn kill(&self, id: &str) -> Result<(), EngineError> {
        self.with_container(id, |c| c.killed.cancel())?;
        self.state.lock().unwrap().kills += 1;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), EngineError> {
        let fail = self.with_container(id, |c| c.script.fail_remove)?;
        if fail {
            return Err(EngineError::Rejected {
                status: 500,
                message: "driver failed to remove root filesystem".into(),
            });
        }
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.remove(id) {
            c.killed.cancel();
            state.removed += 1;
        }
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .map(|(id, c)| ManagedContainer {
                id: id.clone(),
                created_at: c.created_at,
            })
            .collect())
    }
}

/// Runner options suited to tests: short grace periods.
pub fn test_options() -> RunnerOptions {
    crate::runner::RunnerOptionsBuilder::default()
        .watchdog_grace(Duration::from_millis(200))
        .log_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

pub fn make_executor(engine: Arc<FakeEngine>, opts: RunnerOptions, root: &Path) -> Executor {
    Executor::new(
        LanguageRegistry::builtin(),
        WorkspaceManager::new(root).unwrap(),
        ContainerRunner::new(engine, opts),
        ExecutionLimits::default(),
    )
}

/// Number of entries under the scratch root.
pub fn workspace_count(root: &Path) -> usize {
    std::fs::read_dir(root).map(|d| d.count()).unwrap_or(0)
}
