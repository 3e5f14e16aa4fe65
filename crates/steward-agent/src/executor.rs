//! Runs named command sequences of a server definition.

use std::sync::Arc;

use futures_util::{FutureExt, future::BoxFuture};
use steward_process::Presence;

use crate::{
    console::{self, ConsoleBridge, ConsoleLog},
    definition::{ChannelRole, ProcessAction, ServerDefinition, ServerLayout, Step},
    download,
    error::{EngineError, Result},
    sink::Sink,
    supervisor::RuntimeState,
};

// Ring size for pumps started without a per-server console log.
const FALLBACK_CONSOLE_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Normal,
    /// Fetching and preparing server files; spawning processes is refused.
    Provisioning,
}

/// Interprets the steps of one definition against the runtime state, in document order.
pub struct StepExecutor<'a> {
    definition: Arc<ServerDefinition>,
    layout: &'a ServerLayout,
    runtime: &'a mut RuntimeState,
    sink: Arc<dyn Sink>,
    mode: ExecMode,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        definition: Arc<ServerDefinition>,
        layout: &'a ServerLayout,
        runtime: &'a mut RuntimeState,
        sink: Arc<dyn Sink>,
        mode: ExecMode,
    ) -> Self {
        Self {
            definition,
            layout,
            runtime,
            sink,
            mode,
        }
    }

    pub async fn execute(&mut self, command: &str) -> Result<()> {
        let mut stack = Vec::new();
        self.run_sequence(command, &mut stack).await
    }

    fn run_sequence<'s>(
        &'s mut self,
        command: &'s str,
        stack: &'s mut Vec<String>,
    ) -> BoxFuture<'s, Result<()>> {
        async move {
            if stack.iter().any(|c| c == command) {
                let mut path = stack.clone();
                path.push(command.to_string());
                return Err(EngineError::CommandCycle(path));
            }

            let definition = Arc::clone(&self.definition);
            let steps = definition
                .sequence(command)
                .ok_or_else(|| EngineError::UnknownCommand(command.to_string()))?;

            tracing::info!(
                server = %definition.name,
                command,
                steps = steps.len(),
                depth = stack.len(),
                "running command"
            );

            stack.push(command.to_string());
            for (index, step) in steps.iter().enumerate() {
                tracing::debug!(command, step = index + 1, of = steps.len(), ?step, "step");
                if let Step::CommandRef { name } = step {
                    self.run_sequence(name, stack).await?;
                } else {
                    self.apply(command, index, step).await?;
                }
            }
            stack.pop();
            Ok(())
        }
        .boxed()
    }

    async fn apply(&mut self, command: &str, index: usize, step: &Step) -> Result<()> {
        match step {
            Step::FileCreate {
                target_dir,
                name,
                content,
            } => {
                let path = self.layout.resolve(target_dir)?.join(name);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, content.as_bytes()).await?;
                tracing::debug!(path = %path.display(), bytes = content.len(), "file written");
            }
            Step::FileExtract {
                archive,
                target_dir,
            } => {
                let archive = self.runtime.controller.resolve_path(archive);
                let dest = self.layout.resolve(target_dir)?;
                download::unpack(&archive, &dest).await?;
            }
            Step::Presence { status, kind } => match kind {
                Some(kind) => self.sink.set_status(Some(&Presence {
                    status: status.clone(),
                    kind: *kind,
                })),
                None => self.sink.set_status(None),
            },
            Step::Shell { argv } => {
                if self.mode == ExecMode::Provisioning {
                    return Err(EngineError::MalformedStep {
                        command: command.to_string(),
                        index,
                        reason: "shell steps cannot run while the server is being provisioned"
                            .to_string(),
                    });
                }
                let out = self.runtime.controller.spawn(argv)?;
                let log = self
                    .runtime
                    .console_log
                    .clone()
                    .unwrap_or_else(|| ConsoleLog::in_memory(FALLBACK_CONSOLE_LINES));
                self.runtime.pumps.retain(|p| !p.is_drained());
                self.runtime.pumps.push(ConsoleBridge::attach(
                    out.pid,
                    out.stdout,
                    out.stderr,
                    self.runtime.console.subscribe(),
                    Arc::clone(&self.sink),
                    log,
                ));
            }
            Step::ChannelBind { channel, role } => match role {
                ChannelRole::Console => {
                    tracing::info!(channel = %channel, "console channel bound");
                    self.runtime.console.send_replace(Some(channel.clone()));
                }
            },
            Step::ConsoleWrite { text } => {
                console::write_console(&self.runtime.controller, text);
            }
            Step::CommandRef { name } => {
                // Handled by run_sequence so the call stack is tracked.
                return Err(EngineError::MalformedStep {
                    command: command.to_string(),
                    index,
                    reason: format!("nested command {name:?} outside a sequence"),
                });
            }
            Step::ChangeDirectory { target } => {
                let dir = self.layout.resolve(target)?;
                self.runtime.controller.change_directory(&dir).await?;
            }
            Step::ProcessControl(ProcessAction::Kill) => {
                self.runtime.controller.kill().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::parse_definition;
    use crate::sink::testing::RecordingSink;
    use serde_json::json;
    use std::{path::Path, time::Duration};
    use steward_process::{ChannelId, PresenceKind};

    struct Fixture {
        _tmp: tempfile::TempDir,
        servers: std::path::PathBuf,
        runtime: RuntimeState,
        sink: Arc<RecordingSink>,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let servers = tmp.path().join("servers");
        let runtime = RuntimeState::new(tmp.path(), Duration::from_secs(5));
        Fixture {
            _tmp: tmp,
            servers,
            runtime,
            sink: Arc::new(RecordingSink::default()),
        }
    }

    async fn run(fx: &mut Fixture, doc: serde_json::Value, command: &str, mode: ExecMode) -> Result<()> {
        let def = Arc::new(parse_definition("test", doc.to_string().as_bytes()).unwrap());
        let layout = ServerLayout::new(&fx.servers, &def);
        tokio::fs::create_dir_all(layout.main_dir()).await.unwrap();
        let sink: Arc<dyn Sink> = fx.sink.clone();
        StepExecutor::new(def, &layout, &mut fx.runtime, sink, mode)
            .execute(command)
            .await
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn file_steps_and_directories_follow_the_layout() {
        let mut fx = fixture();
        let doc = json!({
            "meta": {"directories": {"main": "srv", "world": "world"}},
            "commands": {"init": [
                {"file": {"create": {"name": "eula.txt", "data": "eula=true"}}, "dir": "main"},
                {"file": {"create": {"name": "nested/motd.txt", "data": "hello"}}, "dir": "world"},
                {"directory": "world"}
            ]}
        });
        run(&mut fx, doc, "init", ExecMode::Normal).await.unwrap();

        let main = fx.servers.join("srv");
        assert_eq!(read(&main.join("eula.txt")), "eula=true");
        assert_eq!(read(&main.join("world/nested/motd.txt")), "hello");
        assert_eq!(fx.runtime.controller.working_directory(), main.join("world"));
    }

    #[tokio::test]
    async fn unknown_directory_fails() {
        let mut fx = fixture();
        let doc = json!({"commands": {"go": [{"directory": "nether"}]}});
        assert!(matches!(
            run(&mut fx, doc, "go", ExecMode::Normal).await,
            Err(EngineError::DirectoryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn presence_updates_and_clears_status() {
        let mut fx = fixture();
        let doc = json!({"commands": {"p": [
            {"presence": {"status": "Terraria", "type": "playing"}},
            {"presence": {"status": "", "type": null}}
        ]}});
        run(&mut fx, doc, "p", ExecMode::Normal).await.unwrap();
        let statuses = fx.sink.statuses.lock().unwrap().clone();
        assert_eq!(
            statuses,
            vec![
                Some(Presence {
                    status: "Terraria".into(),
                    kind: PresenceKind::Playing
                }),
                None
            ]
        );
    }

    #[tokio::test]
    async fn command_cycle_stops_before_revisiting() {
        let mut fx = fixture();
        let doc = json!({"commands": {
            "a": [
                {"file": {"create": {"name": "a.txt", "data": "a"}}},
                {"command": "b"}
            ],
            "b": [
                {"file": {"create": {"name": "b.txt", "data": "b"}}},
                {"command": "a"}
            ]
        }});
        let err = run(&mut fx, doc, "a", ExecMode::Normal).await.unwrap_err();
        let EngineError::CommandCycle(path) = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(path, vec!["a", "b", "a"]);
        // a.txt was written once, by the first visit only.
        let main = fx.servers.join("test");
        assert_eq!(read(&main.join("a.txt")), "a");
        assert_eq!(read(&main.join("b.txt")), "b");
    }

    #[tokio::test]
    async fn shared_subcommands_are_not_cycles() {
        let mut fx = fixture();
        let doc = json!({"commands": {
            "all": [{"command": "left"}, {"command": "right"}],
            "left": [{"command": "leaf"}],
            "right": [{"command": "leaf"}],
            "leaf": [{"presence": {"status": "x", "type": "watching"}}]
        }});
        run(&mut fx, doc, "all", ExecMode::Normal).await.unwrap();
        assert_eq!(fx.sink.statuses.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_command_reference_fails() {
        let mut fx = fixture();
        let doc = json!({"commands": {"a": [{"command": "ghost"}]}});
        assert!(matches!(
            run(&mut fx, doc, "a", ExecMode::Normal).await,
            Err(EngineError::UnknownCommand(c)) if c == "ghost"
        ));
    }

    #[tokio::test]
    async fn shell_channel_console_and_kill() {
        let mut fx = fixture();
        let doc = json!({"commands": {
            "start": [
                {"shell": ["sh", "-c", "echo ready; while read l; do echo \"echo $l\"; done"]},
                {"channel": {"id": 99, "type": "console"}},
                {"console": "ping"}
            ],
            "stop": [{"process": "kill"}]
        }});
        run(&mut fx, doc.clone(), "start", ExecMode::Normal).await.unwrap();
        assert!(fx.runtime.controller.is_live());
        assert_eq!(*fx.runtime.console.borrow(), Some(ChannelId("99".into())));

        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.sink.texts().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(fx.sink.texts(), vec!["ready", "echo ping"]);

        run(&mut fx, doc, "stop", ExecMode::Normal).await.unwrap();
        assert!(!fx.runtime.controller.is_live());
        for pump in fx.runtime.pumps.iter_mut() {
            tokio::time::timeout(Duration::from_secs(5), pump.wait_drained())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn provisioning_refuses_to_spawn() {
        let mut fx = fixture();
        let doc = json!({"commands": {"setup": [{"shell": "echo nope"}]}});
        assert!(matches!(
            run(&mut fx, doc, "setup", ExecMode::Provisioning).await,
            Err(EngineError::MalformedStep { index: 0, .. })
        ));
        assert!(!fx.runtime.controller.is_live());
    }

    #[tokio::test]
    async fn extract_resolves_archive_against_working_directory() {
        let mut fx = fixture();
        let main = fx.servers.join("test");
        std::fs::create_dir_all(&main).unwrap();
        std::fs::write(
            main.join("pack.zip"),
            download::tests::zip_bytes(&[("mods/a.jar", "jar")]),
        )
        .unwrap();
        fx.runtime.controller.change_directory(&main).await.unwrap();

        let doc = json!({"commands": {"setup": [
            {"file": {"extract": {"name": "pack.zip", "folder": "main"}}}
        ]}});
        run(&mut fx, doc, "setup", ExecMode::Provisioning).await.unwrap();
        assert_eq!(read(&main.join("mods/a.jar")), "jar");
    }
}
