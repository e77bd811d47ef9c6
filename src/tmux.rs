//! Bridge to a tmux server that keeps shells alive behind detached sessions.
//!
//! Each logical session maps to one tmux session on a private socket label.
//! The supervisor attaches a thin `tmux attach-session` client on a pty to
//! stream I/O; killing that client does not kill the shell behind it.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::MultiplexerConfig;
use crate::error::{GridError, Result};
use crate::launcher::LaunchSpec;

const SESSION_PREFIX: &str = "agents-grid-";

/// Request for a new detached multiplexer session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub name: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
    /// Program and arguments run inside the session.
    pub command: Vec<String>,
}

pub trait Multiplexer: Send + Sync {
    fn new_session(&self, req: &NewSession) -> Result<()>;
    fn has_session(&self, name: &str) -> bool;
    /// `Ok(true)` when the server reported the session killed.
    fn kill_session(&self, name: &str) -> Result<bool>;
    fn resize_window(&self, name: &str, cols: u16, rows: u16) -> Result<()>;
    /// Launch spec for a client attached to `name`.
    fn attach_spec(&self, name: &str, cwd: &Path, cols: u16, rows: u16) -> Result<LaunchSpec>;
}

/// Deterministic, shell-safe multiplexer session name for a session id.
pub fn session_name(session_id: &str) -> String {
    let safe: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let safe = safe.trim_matches('_');
    let safe = if safe.is_empty() { "session" } else { safe };
    format!("{SESSION_PREFIX}{safe}")
}

fn default_search_dirs() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = [
        "/opt/homebrew/bin",
        "/usr/local/bin",
        "/usr/bin",
        "/bin",
        "/home/linuxbrew/.linuxbrew/bin",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(".local/bin"));
    }
    dirs
}

pub struct TmuxBridge {
    configured: Option<PathBuf>,
    binary: Mutex<Option<PathBuf>>,
    socket_label: String,
    timeout: Duration,
    search_dirs: Vec<PathBuf>,
}

impl TmuxBridge {
    pub fn new(config: &MultiplexerConfig, timeout: Duration) -> Self {
        let mut search_dirs = config.search_dirs.clone();
        search_dirs.extend(default_search_dirs());
        Self {
            configured: config.binary.clone(),
            binary: Mutex::new(None),
            socket_label: config.socket_label.clone(),
            timeout,
            search_dirs,
        }
    }

    pub fn socket_label(&self) -> &str {
        &self.socket_label
    }

    fn resolve(&self) -> Option<PathBuf> {
        if let Some(path) = &self.configured {
            if path.is_file() {
                return Some(path.clone());
            }
        }
        if let Ok(path) = which::which("tmux") {
            return Some(path);
        }
        self.search_dirs
            .iter()
            .map(|dir| dir.join("tmux"))
            .find(|candidate| candidate.is_file())
    }

    fn binary(&self, refresh: bool) -> Result<PathBuf> {
        let mut cached = self.binary.lock();
        if refresh {
            *cached = None;
        }
        if let Some(path) = cached.as_ref() {
            return Ok(path.clone());
        }
        let path = self
            .resolve()
            .ok_or_else(|| GridError::Multiplexer("tmux binary not found".to_string()))?;
        tracing::debug!(path = %path.display(), "resolved tmux binary");
        *cached = Some(path.clone());
        Ok(path)
    }

    pub fn is_available(&self) -> bool {
        self.binary(false).is_ok()
    }

    /// Run `tmux -L <label> <args>` with the configured timeout. A missing
    /// binary is re-resolved once before giving up.
    fn run(&self, args: &[String]) -> Result<Output> {
        let binary = self.binary(false)?;
        match run_with_timeout(self.command(&binary, args), self.timeout) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %binary.display(), "tmux vanished, re-resolving");
                let binary = self.binary(true)?;
                run_with_timeout(self.command(&binary, args), self.timeout)
                    .map_err(|e| GridError::Multiplexer(format!("tmux failed: {e}")))
            }
            other => other.map_err(|e| GridError::Multiplexer(format!("tmux failed: {e}"))),
        }
    }

    fn command(&self, binary: &Path, args: &[String]) -> Command {
        let mut command = Command::new(binary);
        command.arg("-L").arg(&self.socket_label).args(args);
        command
    }

    fn run_checked(&self, args: &[String]) -> Result<Output> {
        let out = self.run(args)?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(GridError::Multiplexer(format!(
                "tmux {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                stderr.trim()
            )));
        }
        Ok(out)
    }

    /// Names of sessions on our socket that we created.
    pub fn list_sessions(&self) -> Result<Vec<String>> {
        let out = self.run(&strings(&["list-sessions", "-F", "#{session_name}"]))?;
        // No server running means no sessions.
        if !out.status.success() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(SESSION_PREFIX))
            .map(str::to_string)
            .collect())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn run_with_timeout(mut command: Command, timeout: Duration) -> io::Result<Output> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(mut out) = child.stdout.take() {
                out.read_to_end(&mut stdout)?;
            }
            if let Some(mut err) = child.stderr.take() {
                err.read_to_end(&mut stderr)?;
            }
            return Ok(Output {
                status,
                stdout,
                stderr,
            });
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{:?} timed out after {timeout:?}", command.get_program()),
            ));
        }
        thread::sleep(Duration::from_millis(10));
    }
}

impl Multiplexer for TmuxBridge {
    fn new_session(&self, req: &NewSession) -> Result<()> {
        let mut args = strings(&["new-session", "-d", "-s"]);
        args.push(req.name.clone());
        args.push("-x".into());
        args.push(req.cols.to_string());
        args.push("-y".into());
        args.push(req.rows.to_string());
        args.push("-c".into());
        args.push(req.cwd.to_string_lossy().to_string());
        for (key, value) in &req.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.extend(req.command.iter().cloned());
        self.run_checked(&args)?;

        let status_off = vec![
            "set-option".to_string(),
            "-t".to_string(),
            req.name.clone(),
            "status".to_string(),
            "off".to_string(),
        ];
        if let Err(e) = self.run_checked(&status_off) {
            tracing::debug!(session = %req.name, error = %e, "could not hide tmux status line");
        }
        tracing::info!(session = %req.name, "created tmux session");
        Ok(())
    }

    fn has_session(&self, name: &str) -> bool {
        match self.run(&["has-session".to_string(), "-t".to_string(), format!("={name}")]) {
            Ok(out) => out.status.success(),
            Err(e) => {
                tracing::debug!(session = %name, error = %e, "has-session failed");
                false
            }
        }
    }

    fn kill_session(&self, name: &str) -> Result<bool> {
        let out = self.run(&["kill-session".to_string(), "-t".to_string(), format!("={name}")])?;
        Ok(out.status.success())
    }

    fn resize_window(&self, name: &str, cols: u16, rows: u16) -> Result<()> {
        self.run_checked(&[
            "resize-window".to_string(),
            "-t".to_string(),
            format!("={name}"),
            "-x".to_string(),
            cols.to_string(),
            "-y".to_string(),
            rows.to_string(),
        ])
        .map(|_| ())
    }

    fn attach_spec(&self, name: &str, cwd: &Path, cols: u16, rows: u16) -> Result<LaunchSpec> {
        let binary = self.binary(false)?;
        Ok(LaunchSpec {
            program: binary.to_string_lossy().to_string(),
            args: vec![
                "-L".to_string(),
                self.socket_label.clone(),
                "attach-session".to_string(),
                "-t".to_string(),
                format!("={name}"),
            ],
            cwd: cwd.to_path_buf(),
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            cols,
            rows,
        })
    }
}
