use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, ExitStatus, MasterPty, PtySize};

use crate::error::{GridError, Result};

/// Everything needed to start one process on a fresh pseudo-terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

/// How a launched process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Non-zero exit code or death by signal.
    pub fn is_abnormal(&self) -> bool {
        self.signal.is_some() || self.code.is_some_and(|c| c != 0)
    }
}

/// Write/resize/kill side of a live process.
pub trait PtyControl: Send {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
    fn resize(&self, cols: u16, rows: u16) -> Result<()>;
    /// Returns once the process is dead or about to be.
    fn kill(&mut self) -> Result<()>;
}

/// Blocks until the process has exited. Called once, after output reached EOF.
pub trait ExitWaiter: Send {
    fn wait(self: Box<Self>) -> ExitInfo;
}

pub struct Launched {
    pub control: Box<dyn PtyControl>,
    pub output: Box<dyn Read + Send>,
    pub exit: Box<dyn ExitWaiter>,
}

pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Launched>;
}

/// Launcher backed by the platform pseudo-terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtyLauncher;

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

const EXIT_POLL: Duration = Duration::from_millis(20);

struct NativeControl {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: SharedChild,
}

impl PtyControl for NativeControl {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| GridError::Launch(format!("resize failed: {e}")))
    }

    fn kill(&mut self) -> Result<()> {
        let mut child = self.child.lock();
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }
        // SIGHUP, then SIGKILL if the child is still around after a short grace period.
        child.kill().map_err(GridError::Io)
    }
}

/// Map a portable-pty status onto [`ExitInfo`]. Death by signal only shows up
/// in the status text, as "Terminated by <signal>".
fn exit_info(status: &ExitStatus) -> ExitInfo {
    if status.success() {
        return ExitInfo::code(0);
    }
    match status.to_string().strip_prefix("Terminated by ") {
        Some(signal) => ExitInfo {
            code: None,
            signal: Some(signal.to_string()),
        },
        None => ExitInfo::code(status.exit_code() as i32),
    }
}

struct NativeExit {
    child: SharedChild,
}

impl ExitWaiter for NativeExit {
    // Polled rather than a blocking `wait` so `kill` can take the child lock.
    fn wait(self: Box<Self>) -> ExitInfo {
        loop {
            let polled = self.child.lock().try_wait();
            match polled {
                Ok(Some(status)) => return exit_info(&status),
                Ok(None) => thread::sleep(EXIT_POLL),
                Err(e) => {
                    tracing::warn!(error = %e, "waiting for child failed");
                    return ExitInfo::default();
                }
            }
        }
    }
}

impl Launcher for PtyLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Launched> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| GridError::Launch(format!("openpty failed: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| GridError::Launch(format!("spawn failed: {e}")))?;
        // The reader only sees EOF once every slave handle is gone.
        drop(pair.slave);

        let output = pair
            .master
            .try_clone_reader()
            .map_err(|e| GridError::Launch(format!("clone reader failed: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| GridError::Launch(format!("take writer failed: {e}")))?;

        tracing::debug!(program = %spec.program, pid = ?child.process_id(), "spawned pty child");
        let child: SharedChild = Arc::new(Mutex::new(child));

        Ok(Launched {
            control: Box::new(NativeControl {
                master: pair.master,
                writer,
                child: child.clone(),
            }),
            output,
            exit: Box::new(NativeExit { child }),
        })
    }
}

/// Decode `chunk` as UTF-8, holding back a trailing partial character in `carry`
/// for the next call. Invalid bytes become U+FFFD.
pub fn decode_utf8_stream(carry: &mut Vec<u8>, chunk: &[u8]) -> String {
    if chunk.is_empty() {
        return String::new();
    }
    carry.extend_from_slice(chunk);

    let mut out = String::new();
    let mut idx = 0usize;
    while idx < carry.len() {
        match std::str::from_utf8(&carry[idx..]) {
            Ok(s) => {
                out.push_str(s);
                idx = carry.len();
            }
            Err(e) => {
                let end = idx + e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&carry[idx..end]));
                idx = end;
                match e.error_len() {
                    None => break,
                    Some(len) => {
                        out.push('\u{fffd}');
                        idx = (idx + len).min(carry.len());
                    }
                }
            }
        }
    }

    carry.drain(..idx);
    out
}
