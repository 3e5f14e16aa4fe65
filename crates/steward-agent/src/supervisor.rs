//! Top-level owner of the managed server: start/stop, command dispatch and the reconciliation
//! loop that notices when the process is gone.

use std::{
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures_util::FutureExt;
use steward_process::{ChannelId, RunId, ServerState, ServerStatus};
use tokio::sync::{Mutex, watch};

use crate::{
    config::Settings,
    console::{self, ConsoleBridge, ConsoleLog},
    definition::{DefinitionStore, ServerDefinition, ServerLayout},
    download::{self, Downloader},
    error::{EngineError, Result},
    executor::{ExecMode, StepExecutor},
    process::ProcessController,
    sink::Sink,
};

const RESERVED_COMMANDS: [&str; 2] = ["start", "setup"];
const STOP_COMMAND: &str = "stop";

/// Mutable state of the one managed server. Only ever touched under the supervisor's lock.
#[derive(Debug)]
pub(crate) struct RuntimeState {
    pub(crate) phase: ServerState,
    pub(crate) definition: Option<Arc<ServerDefinition>>,
    pub(crate) controller: ProcessController,
    pub(crate) console: watch::Sender<Option<ChannelId>>,
    pub(crate) pumps: Vec<ConsoleBridge>,
    pub(crate) console_log: Option<ConsoleLog>,
    pub(crate) run_id: Option<RunId>,
    pub(crate) message: Option<String>,
}

impl RuntimeState {
    pub(crate) fn new(home: impl Into<PathBuf>, kill_timeout: Duration) -> Self {
        let (console, _) = watch::channel(None);
        Self {
            phase: ServerState::Idle,
            definition: None,
            controller: ProcessController::new(home, kill_timeout),
            console,
            pumps: Vec::new(),
            console_log: None,
            run_id: None,
            message: None,
        }
    }

    fn is_drained(&self) -> bool {
        self.pumps.iter().all(ConsoleBridge::is_drained)
    }

    fn clear(&mut self) {
        self.phase = ServerState::Idle;
        self.definition = None;
        self.console.send_replace(None);
        self.pumps.clear();
        self.run_id = None;
        self.controller.reset_directory();
    }
}

#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// The `start` sequence ran.
    Started(ServerStatus),
    /// Server files were missing and have been fetched; `start` again to launch.
    Provisioned { name: String, path: PathBuf },
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Mutex<RuntimeState>>,
    store: DefinitionStore,
    sink: Arc<dyn Sink>,
    settings: Arc<Settings>,
    downloader: Downloader,
}

impl Supervisor {
    pub fn new(settings: Settings, sink: Arc<dyn Sink>) -> Result<Self> {
        let downloader = Downloader::new(settings.http_timeout)?;
        let state = RuntimeState::new(settings.home_dir(), settings.kill_timeout);
        Ok(Self {
            inner: Arc::new(Mutex::new(state)),
            store: DefinitionStore::new(settings.definitions_dir()),
            sink,
            settings: Arc::new(settings),
            downloader,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn list_available(&self) -> Result<Vec<String>> {
        self.store.list_available().await
    }

    pub fn definition_path(&self, name: &str) -> Result<PathBuf> {
        self.store.definition_path(name)
    }

    pub async fn replace_definition(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        self.store.replace_definition(name, bytes).await
    }

    /// Starts `name`, or provisions it first when its server directory does not exist yet.
    pub async fn start(&self, name: &str) -> Result<StartOutcome> {
        let mut rt = self.inner.lock().await;
        self.reconcile_locked(&mut rt);
        if rt.phase != ServerState::Idle || rt.definition.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let definition = Arc::new(self.store.load(name).await?);
        let layout = ServerLayout::new(&self.settings.servers_dir(), &definition);

        if !tokio::fs::try_exists(layout.main_dir()).await? {
            rt.phase = ServerState::Downloading;
            rt.message = Some("downloading server files".to_string());
            drop(rt);

            tracing::info!(server = name, dir = %layout.main_dir().display(), "server directory missing; provisioning");
            let result = self.provision(Arc::clone(&definition), &layout).await;

            let mut rt = self.inner.lock().await;
            rt.phase = ServerState::Idle;
            return match result {
                Ok(()) => {
                    rt.message = Some("download finished, start again to launch".to_string());
                    Ok(StartOutcome::Provisioned {
                        name: name.to_string(),
                        path: layout.main_dir().to_path_buf(),
                    })
                }
                Err(err) => {
                    // A half-provisioned directory would be mistaken for an installed server.
                    if let Err(cleanup) = tokio::fs::remove_dir_all(layout.main_dir()).await {
                        tracing::warn!(dir = %layout.main_dir().display(), %cleanup, "cannot remove partial server directory");
                    }
                    rt.message = Some(format!("provisioning failed: {err}"));
                    Err(err)
                }
            };
        }

        rt.controller.reset_directory();
        rt.controller.change_directory(layout.main_dir()).await?;
        rt.definition = Some(Arc::clone(&definition));
        rt.phase = ServerState::Running;
        let run_id = RunId::new();
        rt.run_id = Some(run_id.clone());
        rt.message = None;
        rt.console.send_replace(None);
        rt.console_log = Some(ConsoleLog::with_file(
            self.settings.console_max_lines,
            self.settings.logs_dir().join(name).join("console.log"),
            run_id,
            self.settings.console_log_max_bytes,
            self.settings.console_log_max_files,
        ));

        tracing::info!(server = name, run_id = ?rt.run_id, "starting server");
        let result = StepExecutor::new(
            Arc::clone(&definition),
            &layout,
            &mut rt,
            Arc::clone(&self.sink),
            ExecMode::Normal,
        )
        .execute("start")
        .await;

        if let Err(err) = result {
            tracing::warn!(server = name, error = %err, "start sequence failed");
            if !rt.controller.is_live() {
                rt.clear();
                rt.message = Some(format!("start failed: {err}"));
            }
            return Err(err);
        }
        Ok(StartOutcome::Started(status_of(&rt)))
    }

    /// Downloads the payload and runs `setup`, without spawning anything.
    async fn provision(&self, definition: Arc<ServerDefinition>, layout: &ServerLayout) -> Result<()> {
        let main = layout.main_dir();
        tokio::fs::create_dir_all(main).await?;

        // Scratch state: nothing here may leak into the live runtime.
        let mut scratch = RuntimeState::new(main, self.settings.kill_timeout);
        let archive = match &definition.download {
            Some(dl) => {
                let dest = scratch.controller.resolve_path(&dl.file);
                self.downloader.fetch(&dl.link, &dest).await?;
                Some(dest)
            }
            None => None,
        };

        if definition.has_command("setup") {
            StepExecutor::new(
                Arc::clone(&definition),
                layout,
                &mut scratch,
                Arc::clone(&self.sink),
                ExecMode::Provisioning,
            )
            .execute("setup")
            .await?;
        } else if let Some(archive) = archive.filter(|p| is_zip(p)) {
            download::unpack(&archive, main).await?;
        }

        tracing::info!(server = %definition.name, dir = %main.display(), "provisioning finished");
        Ok(())
    }

    /// Runs the `stop` sequence, or kills the process when the definition has none.
    pub async fn stop(&self) -> Result<()> {
        let mut rt = self.inner.lock().await;
        let Some(definition) = rt.definition.clone() else {
            return Err(EngineError::NoActiveServer);
        };
        rt.phase = ServerState::Stopping;
        tracing::info!(server = %definition.name, "stopping server");

        if definition.has_command(STOP_COMMAND) {
            let layout = ServerLayout::new(&self.settings.servers_dir(), &definition);
            StepExecutor::new(
                definition,
                &layout,
                &mut rt,
                Arc::clone(&self.sink),
                ExecMode::Normal,
            )
            .execute(STOP_COMMAND)
            .await
        } else {
            rt.controller.kill().await
        }
    }

    /// Runs a user-invocable command of the active definition.
    pub async fn run_command(&self, command: &str) -> Result<()> {
        if RESERVED_COMMANDS.contains(&command) {
            return Err(EngineError::ReservedCommand(command.to_string()));
        }
        let mut rt = self.inner.lock().await;
        self.reconcile_locked(&mut rt);
        let Some(definition) = rt.definition.clone() else {
            return Err(EngineError::NoActiveServer);
        };
        if !definition.has_command(command) {
            return Err(EngineError::UnknownCommand(command.to_string()));
        }

        let layout = ServerLayout::new(&self.settings.servers_dir(), &definition);
        StepExecutor::new(
            definition,
            &layout,
            &mut rt,
            Arc::clone(&self.sink),
            ExecMode::Normal,
        )
        .execute(command)
        .await
    }

    /// Queues a line for the managed process. Dropped (and logged) when nothing is running.
    pub async fn write_console(&self, text: &str) -> bool {
        let rt = self.inner.lock().await;
        console::write_console(&rt.controller, text)
    }

    pub async fn status(&self) -> ServerStatus {
        let rt = self.inner.lock().await;
        status_of(&rt)
    }

    /// Console lines after `cursor` (0 = latest) of the current or most recent run.
    pub async fn tail_console(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        let log = self.inner.lock().await.console_log.clone();
        match log {
            Some(log) => log.tail_after(cursor, limit).await,
            None => (Vec::new(), cursor),
        }
    }

    /// One reconciliation pass. Returns true when the server state was reset.
    pub async fn reconcile_once(&self) -> bool {
        let mut rt = self.inner.lock().await;
        self.reconcile_locked(&mut rt)
    }

    fn reconcile_locked(&self, rt: &mut RuntimeState) -> bool {
        let Some(definition) = rt.definition.clone() else {
            return false;
        };
        if !rt.controller.poll_exited() || !rt.is_drained() {
            return false;
        }

        let exit_code = rt.controller.last_exit_code();
        rt.clear();
        rt.message = Some(match exit_code {
            Some(code) => format!("exited with code {code}"),
            None => "terminated".to_string(),
        });
        self.sink.set_status(None);
        tracing::info!(
            server = %definition.name,
            exit_code = ?exit_code,
            "managed server terminated; state reset"
        );
        true
    }

    /// Runs [`Supervisor::reconcile_once`] every `interval` until the task is aborted.
    ///
    /// A panicking pass is logged and the loop keeps going.
    pub fn spawn_reconciler(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(panic) = AssertUnwindSafe(this.reconcile_once()).catch_unwind().await {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(panic = %msg, "reconciliation pass panicked");
                }
            }
        })
    }
}

fn status_of(rt: &RuntimeState) -> ServerStatus {
    ServerStatus {
        name: rt.definition.as_ref().map(|d| d.name.clone()),
        state: rt.phase,
        run_id: rt.run_id.clone(),
        pid: rt.controller.pid(),
        exit_code: rt.controller.last_exit_code(),
        console_channel: rt.console.borrow().clone(),
        message: rt.message.clone(),
    }
}

fn is_zip(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
}
