use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use tokio::{
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::mpsc,
};

use crate::{
    console,
    error::{EngineError, Result},
};

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // The managed server must not outlive the agent.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// SIGKILLs every process left in the group led by `pid`.
fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        let pgid = pid as i32;
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[derive(Debug)]
struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    program: String,
    started_at: Instant,
    input: Option<mpsc::Sender<String>>,
}

/// Output ends of a freshly spawned process, for the console pumps.
#[derive(Debug)]
pub struct SpawnedOutput {
    pub pid: Option<u32>,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
}

/// Owns the single managed child process and the working directory it runs in.
#[derive(Debug)]
pub struct ProcessController {
    home: PathBuf,
    cwd: PathBuf,
    kill_timeout: Duration,
    active: Option<ProcessHandle>,
    last_exit_code: Option<i32>,
}

impl ProcessController {
    pub fn new(home: impl Into<PathBuf>, kill_timeout: Duration) -> Self {
        let home = home.into();
        Self {
            cwd: home.clone(),
            home,
            kill_timeout,
            active: None,
            last_exit_code: None,
        }
    }

    pub fn working_directory(&self) -> &Path {
        &self.cwd
    }

    pub async fn change_directory(&mut self, path: &Path) -> Result<()> {
        match tokio::fs::metadata(path).await {
            Ok(m) if m.is_dir() => {
                tracing::debug!(from = %self.cwd.display(), to = %path.display(), "working directory changed");
                self.cwd = path.to_path_buf();
                Ok(())
            }
            _ => Err(EngineError::DirectoryNotFound(path.to_path_buf())),
        }
    }

    pub fn reset_directory(&mut self) {
        self.cwd = self.home.clone();
    }

    /// Resolves a possibly relative path against the working directory.
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    /// Starts `argv` in the working directory with piped stdio.
    pub fn spawn(&mut self, argv: &[String]) -> Result<SpawnedOutput> {
        if self.is_live() {
            return Err(EngineError::AlreadyRunning);
        }
        let Some((program, args)) = argv.split_first() else {
            return Err(EngineError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line"),
            });
        };

        // `./run.sh` style programs are relative to the server directory, not to the agent.
        let exe = if program.contains('/') {
            self.resolve_path(program)
        } else {
            PathBuf::from(program)
        };

        let mut cmd = Command::new(&exe);
        cmd.args(args)
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session so the whole process tree can be signalled at once.
                    #[cfg(target_os = "linux")]
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
            program: program.clone(),
            source,
        })?;

        let pid = child.id();
        let stdout = child.stdout.take().ok_or_else(|| EngineError::Spawn {
            program: program.clone(),
            source: std::io::Error::other("stdout was not captured"),
        })?;
        let stderr = child.stderr.take();
        let input = child
            .stdin
            .take()
            .map(|stdin| console::spawn_input_writer(pid, stdin));

        tracing::info!(
            program = %program,
            pid = ?pid,
            cwd = %self.cwd.display(),
            "process spawned"
        );

        self.last_exit_code = None;
        self.active = Some(ProcessHandle {
            child,
            pid,
            program: program.clone(),
            started_at: Instant::now(),
            input,
        });
        Ok(SpawnedOutput { pid, stdout, stderr })
    }

    /// Forcefully terminates the live process and waits for it, bounded by the kill timeout.
    ///
    /// Without a live process this is a no-op.
    pub async fn kill(&mut self) -> Result<()> {
        let Some(mut handle) = self.active.take() else {
            tracing::debug!("kill requested without a live process");
            return Ok(());
        };

        kill_group(handle.pid);
        if let Ok(Some(status)) = handle.child.try_wait() {
            self.last_exit_code = status.code();
            return Ok(());
        }

        if let Err(err) = handle.child.start_kill() {
            tracing::debug!(pid = ?handle.pid, %err, "start_kill failed");
        }

        match tokio::time::timeout(self.kill_timeout, handle.child.wait()).await {
            Ok(Ok(status)) => {
                self.last_exit_code = status.code();
                tracing::info!(
                    program = %handle.program,
                    pid = ?handle.pid,
                    exit_code = ?status.code(),
                    uptime_ms = handle.started_at.elapsed().as_millis() as u64,
                    "process killed"
                );
                Ok(())
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                tracing::warn!(pid = ?handle.pid, "process still alive after kill timeout");
                self.active = Some(handle);
                Err(EngineError::Kill(self.kill_timeout))
            }
        }
    }

    /// Non-blocking exit check. True when no process is live anymore.
    ///
    /// Once the leader is gone, whatever it left behind in its process group is killed so
    /// nothing keeps the console pipes open.
    pub fn poll_exited(&mut self) -> bool {
        let Some(handle) = self.active.as_mut() else {
            return true;
        };
        match handle.child.try_wait() {
            Ok(Some(status)) => {
                tracing::info!(
                    program = %handle.program,
                    pid = ?handle.pid,
                    exit_code = ?status.code(),
                    uptime_ms = handle.started_at.elapsed().as_millis() as u64,
                    "process exited"
                );
                kill_group(handle.pid);
                self.last_exit_code = status.code();
                self.active = None;
                true
            }
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(pid = ?handle.pid, %err, "cannot query process status; treating as exited");
                kill_group(handle.pid);
                self.active = None;
                true
            }
        }
    }

    pub fn is_live(&self) -> bool {
        self.active.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.active.as_ref().and_then(|h| h.pid)
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.last_exit_code
    }

    /// Queue feeding the live process' stdin, if it has one.
    pub fn input(&self) -> Option<&mpsc::Sender<String>> {
        self.active.as_ref().and_then(|h| h.input.as_ref())
    }
}
