use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::policy::Approval;

pub const MAX_COMMAND_LEN: usize = 4096;
pub const MAX_ENV_KEY_LEN: usize = 128;
pub const MAX_ENV_VALUE_LEN: usize = 8192;
pub const MAX_ID_LEN: usize = 64;
pub const MIN_COLS: u16 = 2;
pub const MIN_ROWS: u16 = 1;
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Variables that could hijack how the shell or dynamic loader starts up.
const ENV_DENYLIST: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "DYLD_FALLBACK_LIBRARY_PATH",
    "BASH_ENV",
    "ENV",
    "ZDOTDIR",
    "PROMPT_COMMAND",
    "SHELLOPTS",
    "BASHOPTS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Errored,
    Recovering,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Creating => "creating",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Errored => "errored",
            SessionStatus::Recovering => "recovering",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Errored)
    }

    /// Edges of the lifecycle graph. Terminal states only leave by a fresh create.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Creating, Running)
                | (Creating, Errored)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Running, Recovering)
                | (Running, Errored)
                | (Stopping, Stopped)
                | (Stopping, Errored)
                | (Recovering, Running)
                | (Recovering, Errored)
                | (Recovering, Stopped)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sanitized view of a session. Never carries env values, tokens or handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub cwd: PathBuf,
    pub shell_path: String,
    pub command: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub status: SessionStatus,
    pub last_active_ms: u64,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub error: Option<String>,
    pub restart_count: u32,
    pub auto_restart: bool,
    pub persistent: bool,
    pub multiplexer_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateOptions {
    pub id: Option<String>,
    pub cwd: Option<PathBuf>,
    pub shell: Option<String>,
    pub command: Option<String>,
    pub env: HashMap<String, String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub persistent: bool,
    pub auto_restart: bool,
    pub approval: Approval,
}

impl CreateOptions {
    /// Options to bring a persisted session back with the same identity.
    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Self {
        Self {
            id: Some(snapshot.id.clone()),
            cwd: Some(snapshot.cwd.clone()),
            shell: Some(snapshot.shell_path.clone()),
            command: snapshot.command.clone(),
            env: HashMap::new(),
            cols: Some(snapshot.cols),
            rows: Some(snapshot.rows),
            persistent: snapshot.persistent,
            auto_restart: snapshot.auto_restart,
            approval: Approval::default(),
        }
    }
}

/// Options after validation; what the supervisor keeps to relaunch a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    pub id: String,
    pub cwd: PathBuf,
    pub shell: String,
    pub command: Option<String>,
    /// Sorted by key.
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
    pub persistent: bool,
    pub auto_restart: bool,
}

pub fn valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    if !(first == '_' || first.is_ascii_alphabetic()) {
        return false;
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

pub fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn clamp_size(cols: u16, rows: u16) -> (u16, u16) {
    (cols.max(MIN_COLS), rows.max(MIN_ROWS))
}

fn resolve_cwd(requested: Option<&Path>) -> Result<PathBuf> {
    match requested {
        Some(path) => {
            if path.is_dir() {
                Ok(path.to_path_buf())
            } else {
                Err(GridError::Invalid(format!(
                    "cwd {} is not an existing directory",
                    path.display()
                )))
            }
        }
        None => dirs::home_dir()
            .filter(|home| home.is_dir())
            .or_else(|| std::env::current_dir().ok())
            .ok_or_else(|| GridError::Invalid("no usable default cwd".to_string())),
    }
}

fn validate_env(env: &HashMap<String, String>) -> Result<Vec<(String, String)>> {
    let mut out = Vec::with_capacity(env.len());
    for (key, value) in env {
        if key.len() > MAX_ENV_KEY_LEN || !valid_env_key(key) {
            return Err(GridError::Invalid(format!("invalid env key {key:?}")));
        }
        if ENV_DENYLIST.contains(&key.as_str()) {
            return Err(GridError::Invalid(format!("env key {key} is not allowed")));
        }
        if value.len() > MAX_ENV_VALUE_LEN || value.contains('\0') {
            return Err(GridError::Invalid(format!("invalid value for env key {key}")));
        }
        out.push((key.clone(), value.clone()));
    }
    out.sort();
    Ok(out)
}

/// Check `opts` and fill in defaults. No side effects.
pub fn validate(opts: &CreateOptions, default_shell: &str) -> Result<SessionSpec> {
    let id = match opts.id.as_deref().map(str::trim) {
        Some(id) if valid_session_id(id) => id.to_string(),
        Some(id) => return Err(GridError::Invalid(format!("invalid session id {id:?}"))),
        None => uuid::Uuid::new_v4().to_string(),
    };

    let command = opts
        .command
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    if let Some(cmd) = &command {
        if cmd.len() > MAX_COMMAND_LEN {
            return Err(GridError::Invalid(format!(
                "command exceeds {MAX_COMMAND_LEN} bytes"
            )));
        }
        if cmd.contains('\0') {
            return Err(GridError::Invalid("command contains NUL".to_string()));
        }
    }

    let shell = opts
        .shell
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default_shell)
        .to_string();

    let (cols, rows) = clamp_size(
        opts.cols.unwrap_or(DEFAULT_COLS),
        opts.rows.unwrap_or(DEFAULT_ROWS),
    );

    Ok(SessionSpec {
        id,
        cwd: resolve_cwd(opts.cwd.as_deref())?,
        shell,
        command,
        env: validate_env(&opts.env)?,
        cols,
        rows,
        persistent: opts.persistent,
        auto_restart: opts.auto_restart,
    })
}
