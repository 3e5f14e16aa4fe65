//! Console plumbing between the managed process and the outside world.
//!
//! Every stdout line is recorded in the [`ConsoleLog`] and then handed to the sink for the
//! bound console channel. Lines read before any channel is bound are held back, in order,
//! until one is. Once stdout reaches end-of-stream the bridge reports itself drained.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use steward_process::{ChannelId, RunId};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStderr, ChildStdin, ChildStdout},
    sync::{Mutex, mpsc, watch},
};

use crate::{process::ProcessController, sink::Sink};

/// Lines waiting in the stdin queue before further writes are refused.
const INPUT_QUEUE_LINES: usize = 256;

#[derive(Debug)]
struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    fn push_line(&mut self, line: String) {
        self.lines.push_back((self.next_seq, line));
        self.next_seq = self.next_seq.saturating_add(1);
        if self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Up to `limit` lines after `cursor`; cursor 0 asks for the most recent ones.
    fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        let picked: Vec<&(u64, String)> = if cursor == 0 {
            let skip = self.lines.len().saturating_sub(limit);
            self.lines.iter().skip(skip).collect()
        } else {
            self.lines
                .iter()
                .filter(|(seq, _)| *seq > cursor)
                .take(limit)
                .collect()
        };
        let next = picked.last().map(|(seq, _)| *seq).unwrap_or(cursor);
        (picked.into_iter().map(|(_, l)| l.clone()).collect(), next)
    }
}

/// On-disk copy of a server's console, shared by every run of that server.
///
/// Each run opens the file with a banner naming its run id, so one file can be split back
/// into runs. When the file would grow past `max_bytes` it becomes `console.log.1` (older
/// copies shift up to `max_files`) and the fresh file starts with a continuation banner.
struct RunConsoleFile {
    path: PathBuf,
    run: RunId,
    max_bytes: u64,
    max_files: usize,
    written: u64,
    file: tokio::fs::File,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

impl RunConsoleFile {
    async fn open(
        path: PathBuf,
        run: RunId,
        max_bytes: u64,
        max_files: usize,
    ) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = open_append(&path).await?;
        let written = file.metadata().await?.len();

        let mut this = Self {
            path,
            run,
            max_bytes,
            max_files: max_files.max(1),
            written,
            file,
        };
        this.banner("started").await?;
        Ok(this)
    }

    async fn banner(&mut self, event: &str) -> std::io::Result<()> {
        let text = format!("=== run {} {event} at {} ===\n", self.run.0, unix_now());
        self.file.write_all(text.as_bytes()).await?;
        self.written = self.written.saturating_add(text.len() as u64);
        Ok(())
    }

    fn backup(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    async fn roll_over(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        for n in (1..self.max_files).rev() {
            match tokio::fs::rename(self.backup(n), self.backup(n + 1)).await {
                Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err),
                _ => {}
            }
        }
        tokio::fs::rename(&self.path, self.backup(1)).await?;

        self.file = open_append(&self.path).await?;
        self.written = 0;
        self.banner("continued").await
    }

    async fn append(&mut self, line: &str) -> std::io::Result<()> {
        let len = line.len() as u64 + 1;
        let over = self.written.saturating_add(len) > self.max_bytes;
        if self.max_bytes > 0 && self.written > 0 && over {
            if let Err(err) = self.roll_over().await {
                tracing::warn!(path = %self.path.display(), %err, "console log rotation failed");
            }
        }

        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.file.write_all(&bytes).await?;
        self.written = self.written.saturating_add(len);
        Ok(())
    }
}

/// Recent console output of one server, kept in memory and mirrored to a rotating file.
#[derive(Debug, Clone)]
pub struct ConsoleLog {
    buffer: Arc<Mutex<LogBuffer>>,
    capacity: usize,
    file_tx: Option<mpsc::UnboundedSender<String>>,
}

impl ConsoleLog {
    pub fn in_memory(max_lines: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(LogBuffer::new(max_lines))),
            capacity: max_lines.max(1),
            file_tx: None,
        }
    }

    /// Starts a background writer appending `run`'s output to `path`. Must be called inside
    /// a tokio runtime.
    pub fn with_file(
        max_lines: usize,
        path: PathBuf,
        run: RunId,
        max_bytes: u64,
        max_files: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut file = match RunConsoleFile::open(path.clone(), run, max_bytes, max_files).await
            {
                Ok(f) => f,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "console log file unavailable");
                    return;
                }
            };
            while let Some(line) = rx.recv().await {
                if let Err(err) = file.append(&line).await {
                    tracing::warn!(path = %path.display(), %err, "console log write failed");
                }
            }
            let _ = file.file.flush().await;
        });
        let mut log = Self::in_memory(max_lines);
        log.file_tx = Some(tx);
        log
    }

    /// Number of lines kept in memory.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        self.buffer.lock().await.push_line(line.clone());
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(line);
        }
    }

    /// Lines after `cursor` (0 = most recent) and the cursor to resume from.
    pub async fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.buffer.lock().await.tail_after(cursor, limit)
    }
}

/// Reads the next console line. Invalid UTF-8 is replaced rather than rejected and
/// trailing whitespace (a `\r` before the newline included) is dropped.
///
/// Bytes of a read interrupted mid-line stay in `buf` and are picked up by the next call.
async fn read_console_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let n = reader.read_until(b'\n', buf).await?;
    if n == 0 && buf.is_empty() {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&buf[..]).trim_end().to_string();
    buf.clear();
    Ok(Some(line))
}

/// Output pumps of one spawned process.
#[derive(Debug)]
pub struct ConsoleBridge {
    pid: Option<u32>,
    drained: watch::Receiver<bool>,
}

impl ConsoleBridge {
    /// Starts pumping `stdout` (and `stderr`, log only) in background tasks.
    ///
    /// `channel` carries the currently bound console channel; binding or rebinding it takes
    /// effect for the next delivery. At most `log.capacity()` lines wait for a binding.
    pub fn attach(
        pid: Option<u32>,
        stdout: ChildStdout,
        stderr: Option<ChildStderr>,
        channel: watch::Receiver<Option<ChannelId>>,
        sink: Arc<dyn Sink>,
        log: ConsoleLog,
    ) -> Self {
        let (done_tx, done_rx) = watch::channel(false);

        if let Some(err) = stderr {
            let log = log.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(err);
                let mut buf = Vec::new();
                loop {
                    match read_console_line(&mut reader, &mut buf).await {
                        Ok(Some(line)) => {
                            tracing::debug!(pid = ?pid, "stderr: {line}");
                            log.emit(format!("[stderr] {line}")).await;
                        }
                        Ok(None) => break,
                        Err(err) => {
                            tracing::debug!(pid = ?pid, %err, "stderr read failed");
                            break;
                        }
                    }
                }
            });
        }

        tokio::spawn(pump_stdout(pid, stdout, channel, sink, log, done_tx));

        Self {
            pid,
            drained: done_rx,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True once stdout hit end-of-stream and every line read was handed off.
    pub fn is_drained(&self) -> bool {
        *self.drained.borrow()
    }

    pub async fn wait_drained(&mut self) {
        let _ = self.drained.wait_for(|d| *d).await;
    }
}

fn flush_pending(
    pending: &mut VecDeque<String>,
    channel: &mut watch::Receiver<Option<ChannelId>>,
    sink: &dyn Sink,
) {
    if pending.is_empty() {
        return;
    }
    let bound = channel.borrow_and_update().clone();
    if let Some(ch) = bound {
        while let Some(line) = pending.pop_front() {
            sink.notify(&ch, &line);
        }
    }
}

async fn pump_stdout(
    pid: Option<u32>,
    stdout: ChildStdout,
    mut channel: watch::Receiver<Option<ChannelId>>,
    sink: Arc<dyn Sink>,
    log: ConsoleLog,
    done: watch::Sender<bool>,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let max_pending = log.capacity();
    let mut pending = VecDeque::<String>::new();
    let mut dropped = 0usize;
    let mut channel_open = true;

    loop {
        tokio::select! {
            biased;
            next = read_console_line(&mut reader, &mut buf) => match next {
                Ok(Some(line)) => {
                    log.emit(line.clone()).await;
                    pending.push_back(line);
                    if pending.len() > max_pending {
                        pending.pop_front();
                        if dropped == 0 {
                            tracing::warn!(
                                pid = ?pid,
                                max_pending,
                                "no console channel bound; dropping oldest unsent lines"
                            );
                        }
                        dropped += 1;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(pid = ?pid, %err, "console read failed; treating as end of stream");
                    break;
                }
            },
            changed = channel.changed(), if channel_open => {
                if changed.is_err() {
                    channel_open = false;
                }
            }
        }
        flush_pending(&mut pending, &mut channel, sink.as_ref());
    }

    flush_pending(&mut pending, &mut channel, sink.as_ref());
    if !pending.is_empty() {
        tracing::debug!(
            pid = ?pid,
            lines = pending.len(),
            "no console channel bound; output kept in console log only"
        );
    }
    tracing::debug!(pid = ?pid, dropped, "console output drained");
    let _ = done.send(true);
}

/// Writes one line to the process' stdin, appending the newline terminator.
pub async fn write_line(stdin: &mut ChildStdin, text: &str) -> std::io::Result<()> {
    let mut data = String::with_capacity(text.len() + 1);
    data.push_str(text);
    data.push('\n');
    stdin.write_all(data.as_bytes()).await?;
    stdin.flush().await
}

/// Moves `stdin` into a task that writes queued lines in order.
///
/// The task ends when the queue is dropped or a write fails (the process closed its stdin or
/// died), so a process that stops reading only ever stalls this task.
pub(crate) fn spawn_input_writer(
    pid: Option<u32>,
    mut stdin: ChildStdin,
) -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(INPUT_QUEUE_LINES);
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(err) = write_line(&mut stdin, &text).await {
                tracing::warn!(pid = ?pid, %err, "console input closed");
                break;
            }
            tracing::debug!(pid = ?pid, "console write: {text}");
        }
    });
    tx
}

/// Queues `text` for the managed process' stdin. Returns whether it was accepted.
///
/// Never waits on the process. A missing process, a closed stdin or a full queue only gets
/// logged: a write racing the process' exit is expected.
pub fn write_console(controller: &ProcessController, text: &str) -> bool {
    let pid = controller.pid();
    let Some(input) = controller.input() else {
        tracing::warn!("console write dropped: no live process");
        return false;
    };
    match input.try_send(text.to_string()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(pid = ?pid, "console write dropped: process is not reading its input");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::warn!(pid = ?pid, "console write dropped: stdin closed");
            false
        }
    }
}
