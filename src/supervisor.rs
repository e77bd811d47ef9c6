use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use crate::capability::{CapabilityAuthority, Grant};
use crate::config::GridConfig;
use crate::error::{GridError, Result};
use crate::launcher::{decode_utf8_stream, ExitInfo, ExitWaiter, LaunchSpec, Launched, Launcher, PtyControl};
use crate::osc::CwdTracker;
use crate::policy::CommandPolicy;
use crate::session::{
    self, clamp_size, CreateOptions, SessionSnapshot, SessionSpec, SessionStatus,
};
use crate::shell::{self, ShellFlavor};
use crate::tmux::{session_name, Multiplexer, NewSession};

type SharedControl = Arc<Mutex<Box<dyn PtyControl>>>;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    Data { session_id: String, chunk: String },
    #[serde(rename_all = "camelCase")]
    Exit {
        session_id: String,
        exit_code: Option<i32>,
        signal: Option<String>,
        status: SessionStatus,
    },
    Status { session: SessionSnapshot },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Data { session_id, .. } | SessionEvent::Exit { session_id, .. } => session_id,
            SessionEvent::Status { session } => &session.id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Created {
    pub session: SessionSnapshot,
    pub capability_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteOutcome {
    Written,
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KillStatus {
    Killed,
    AlreadyStopping,
    AlreadyStopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillOutcome {
    pub killed: bool,
    pub reason: String,
    pub status: KillStatus,
}

impl KillOutcome {
    fn new(status: KillStatus, reason: &str) -> Self {
        Self {
            killed: status == KillStatus::Killed,
            reason: reason.to_string(),
            status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub default_shell: String,
    pub shell_integration: bool,
    pub restart_delay: Duration,
    pub retention_capacity: usize,
    pub kill_on_shutdown: bool,
    pub policy: CommandPolicy,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&GridConfig::default())
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &GridConfig) -> Self {
        Self {
            default_shell: config
                .default_shell
                .clone()
                .unwrap_or_else(shell::default_user_shell),
            shell_integration: config.shell_integration,
            restart_delay: config.restart_delay(),
            retention_capacity: config.retention_capacity.max(1),
            kill_on_shutdown: config.multiplexer.kill_on_shutdown,
            policy: CommandPolicy::from_config(&config.policy),
        }
    }
}

struct RestartTimer {
    id: u64,
    // Dropping the sender wakes the timer thread with `Disconnected`.
    _cancel: Sender<()>,
}

struct SessionState {
    record: SessionSnapshot,
    spec: SessionSpec,
    control: Option<SharedControl>,
    /// Unique across the supervisor; replaced on every launch and detach so
    /// events from an older process are dropped.
    generation: u64,
    cwd: CwdTracker,
    manual_stop: bool,
    reattached: bool,
    restart: Option<RestartTimer>,
    last_exit: Option<ExitInfo>,
}

impl SessionState {
    fn new(spec: SessionSpec, status: SessionStatus, now_ms: u64, restart_count: u32) -> Self {
        let record = SessionSnapshot {
            id: spec.id.clone(),
            cwd: spec.cwd.clone(),
            shell_path: spec.shell.clone(),
            command: spec.command.clone(),
            cols: spec.cols,
            rows: spec.rows,
            status,
            last_active_ms: now_ms,
            exit_code: None,
            signal: None,
            error: None,
            restart_count,
            auto_restart: spec.auto_restart,
            persistent: spec.persistent,
            multiplexer_name: spec.persistent.then(|| session_name(&spec.id)),
        };
        Self {
            record,
            spec,
            control: None,
            generation: 0,
            cwd: CwdTracker::new(),
            manual_stop: false,
            reattached: false,
            restart: None,
            last_exit: None,
        }
    }
}

/// Per-session serialization point. `op_lock` is held for a whole mutating
/// operation; `state` only for short reads and writes of the record.
struct SessionCell {
    op_lock: Mutex<()>,
    state: Mutex<SessionState>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StartMode {
    Fresh,
    Recover,
}

enum AfterExit {
    Ignore,
    Reattach(SessionSpec),
    Restart,
    Finish(SessionStatus, Option<String>),
}

struct SupervisorInner {
    me: Weak<SupervisorInner>,
    launcher: Arc<dyn Launcher>,
    multiplexer: Option<Arc<dyn Multiplexer>>,
    authority: CapabilityAuthority,
    settings: SupervisorSettings,
    sessions: Mutex<HashMap<String, Arc<SessionCell>>>,
    retained: Mutex<VecDeque<String>>,
    subscribers: Mutex<Vec<Sender<SessionEvent>>>,
    next_timer: AtomicU64,
    next_generation: AtomicU64,
    started: Instant,
    shut_down: AtomicBool,
}

/// Owner of every session. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        launcher: Arc<dyn Launcher>,
        multiplexer: Option<Arc<dyn Multiplexer>>,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| SupervisorInner {
            me: me.clone(),
            launcher,
            multiplexer,
            authority: CapabilityAuthority::new(),
            settings,
            sessions: Mutex::new(HashMap::new()),
            retained: Mutex::new(VecDeque::new()),
            subscribers: Mutex::new(Vec::new()),
            next_timer: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            started: Instant::now(),
            shut_down: AtomicBool::new(false),
        });
        Self { inner }
    }

    /// Receive every data, exit and status event from now on.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    pub fn create(&self, opts: CreateOptions) -> Result<Created> {
        let spec = session::validate(&opts, &self.inner.settings.default_shell)?;
        self.inner.settings.policy.check(spec.command.as_deref(), &opts.approval)?;
        self.inner.start(spec, StartMode::Fresh, 0)
    }

    /// Reattach to a persisted session whose multiplexer backend survived.
    pub fn recover(&self, snapshot: &SessionSnapshot) -> Result<Created> {
        let inner = &self.inner;
        if !snapshot.persistent {
            return Err(GridError::NotFound(format!("{} has no surviving backend", snapshot.id)));
        }
        let mux = inner
            .multiplexer
            .as_ref()
            .ok_or_else(|| GridError::NotFound(format!("{} has no surviving backend", snapshot.id)))?;
        if !mux.has_session(&session_name(&snapshot.id)) {
            return Err(GridError::NotFound(format!("{} has no surviving backend", snapshot.id)));
        }
        let spec = session::validate(&CreateOptions::from_snapshot(snapshot), &inner.settings.default_shell)?;
        inner.start(spec, StartMode::Recover, snapshot.restart_count)
    }

    pub fn write(&self, id: &str, token: Option<&str>, data: &[u8]) -> Result<WriteOutcome> {
        let inner = &self.inner;
        inner.authorized(id, token, |cell, grant| match grant {
            Grant::Retired => Ok(WriteOutcome::NotRunning),
            Grant::Live => Ok(inner.write_locked(cell, id, data)),
        })
    }

    pub fn resize(&self, id: &str, token: Option<&str>, cols: u16, rows: u16) -> Result<SessionSnapshot> {
        let inner = &self.inner;
        inner.authorized(id, token, |cell, grant| {
            require_live(id, grant)?;
            inner.resize_locked(cell, id, cols, rows)
        })
    }

    pub fn kill(&self, id: &str, token: Option<&str>, reason: &str) -> Result<KillOutcome> {
        let inner = &self.inner;
        inner.authorized(id, token, |cell, grant| {
            Ok(match grant {
                Grant::Retired => KillOutcome::new(KillStatus::AlreadyStopped, reason),
                Grant::Live => inner.kill_locked(cell, reason),
            })
        })
    }

    /// Type a directory change into the shell and record the new cwd.
    pub fn change_directory(&self, id: &str, token: Option<&str>, cwd: &Path) -> Result<SessionSnapshot> {
        let inner = &self.inner;
        inner.authorized(id, token, |cell, grant| {
            require_live(id, grant)?;
            inner.change_directory_locked(cell, id, cwd)
        })
    }

    /// Turning auto-restart off cancels a pending restart; the session then stops.
    pub fn set_auto_restart(&self, id: &str, token: Option<&str>, enabled: bool) -> Result<SessionSnapshot> {
        let inner = &self.inner;
        inner.authorized(id, token, |cell, grant| {
            require_live(id, grant)?;
            Ok(inner.set_auto_restart_locked(cell, id, enabled))
        })
    }

    pub fn snapshot(&self, id: &str) -> Option<SessionSnapshot> {
        self.inner.cell(id).map(|cell| cell.state.lock().record.clone())
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let cells: Vec<Arc<SessionCell>> = self.inner.sessions.lock().values().cloned().collect();
        let mut out: Vec<SessionSnapshot> = cells.iter().map(|c| c.state.lock().record.clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Stop every live session once. Later calls do nothing.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub(crate) fn is_live(&self, id: &str) -> bool {
        self.snapshot(id).is_some_and(|s| !s.status.is_terminal())
    }

    /// Fresh token for a live session, replacing the previous one.
    pub(crate) fn reissue_token(&self, id: &str) -> Option<String> {
        self.is_live(id).then(|| self.inner.authority.issue(id))
    }

    pub(crate) fn kill_unchecked(&self, id: &str, reason: &str) -> Option<KillOutcome> {
        let cell = self.inner.cell(id)?;
        let _op = cell.op_lock.lock();
        Some(self.inner.kill_locked(&cell, reason))
    }

    /// Drop the local handle without ending a persistent backend, and forget
    /// the session. Non-persistent processes die with their pty.
    pub(crate) fn detach(&self, id: &str) {
        let Some(cell) = self.inner.sessions.lock().remove(id) else {
            return;
        };
        let _op = cell.op_lock.lock();
        let mut st = cell.state.lock();
        st.generation = self.inner.next_generation();
        st.restart = None;
        st.manual_stop = true;
        if let Some(control) = st.control.take() {
            if let Err(e) = control.lock().kill() {
                tracing::debug!(session_id = %id, error = %e, "detach kill failed");
            }
        }
        self.inner.authority.revoke(id);
        tracing::info!(session_id = %id, persistent = st.spec.persistent, "session detached");
    }
}

impl SupervisorInner {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: SessionEvent) {
        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn cell(&self, id: &str) -> Option<Arc<SessionCell>> {
        self.sessions.lock().get(id).cloned()
    }

    /// Run `op` holding the session's op lock, with the token checked under
    /// that lock so a concurrent replace or reissue cannot slip in between.
    fn authorized<T>(
        &self,
        id: &str,
        token: Option<&str>,
        op: impl FnOnce(&Arc<SessionCell>, Grant) -> Result<T>,
    ) -> Result<T> {
        let cell = self.cell(id).ok_or(GridError::Forbidden)?;
        let _op = cell.op_lock.lock();
        // Evicted and re-created while we waited.
        if !self.cell(id).is_some_and(|current| Arc::ptr_eq(&current, &cell)) {
            return Err(GridError::Forbidden);
        }
        let grant = self.authority.check(id, token)?;
        op(&cell, grant)
    }

    fn write_locked(&self, cell: &SessionCell, id: &str, data: &[u8]) -> WriteOutcome {
        let control = {
            let mut st = cell.state.lock();
            let Some(control) = st.control.clone().filter(|_| st.record.status == SessionStatus::Running) else {
                return WriteOutcome::NotRunning;
            };
            st.record.last_active_ms = self.now_ms();
            control
        };
        let result = control.lock().write(data);
        match result {
            Ok(()) => WriteOutcome::Written,
            Err(e) => {
                tracing::debug!(session_id = %id, error = %e, "write to exiting session");
                WriteOutcome::NotRunning
            }
        }
    }

    fn resize_locked(&self, cell: &SessionCell, id: &str, cols: u16, rows: u16) -> Result<SessionSnapshot> {
        let (cols, rows) = clamp_size(cols, rows);
        let (control, persistent) = {
            let st = cell.state.lock();
            if (st.record.cols, st.record.rows) == (cols, rows) {
                return Ok(st.record.clone());
            }
            (st.control.clone(), st.spec.persistent)
        };

        if let Some(control) = control {
            control.lock().resize(cols, rows)?;
        }
        if persistent {
            if let Some(mux) = &self.multiplexer {
                if let Err(e) = mux.resize_window(&session_name(id), cols, rows) {
                    tracing::warn!(session_id = %id, error = %e, "multiplexer resize failed");
                }
            }
        }

        let mut st = cell.state.lock();
        st.record.cols = cols;
        st.record.rows = rows;
        st.spec.cols = cols;
        st.spec.rows = rows;
        Ok(st.record.clone())
    }

    fn change_directory_locked(&self, cell: &SessionCell, id: &str, cwd: &Path) -> Result<SessionSnapshot> {
        if !cwd.is_dir() {
            return Err(GridError::Invalid(format!("{} is not a directory", cwd.display())));
        }
        let path = cwd
            .to_str()
            .ok_or_else(|| GridError::Invalid("cwd is not valid UTF-8".to_string()))?;

        let (control, flavor) = {
            let st = cell.state.lock();
            match st.control.clone() {
                Some(control) if st.record.status == SessionStatus::Running => {
                    (control, ShellFlavor::detect(&st.spec.shell))
                }
                _ => return Err(GridError::NotRunning(id.to_string())),
            }
        };
        let line = shell::change_directory_command(flavor, path);
        control.lock().write(line.as_bytes())?;

        let mut st = cell.state.lock();
        st.record.cwd = cwd.to_path_buf();
        st.record.last_active_ms = self.now_ms();
        self.emit(SessionEvent::Status {
            session: st.record.clone(),
        });
        Ok(st.record.clone())
    }

    fn set_auto_restart_locked(&self, cell: &SessionCell, id: &str, enabled: bool) -> SessionSnapshot {
        let mut st = cell.state.lock();
        st.spec.auto_restart = enabled;
        st.record.auto_restart = enabled;
        if !enabled && st.restart.take().is_some() {
            tracing::info!(session_id = %id, "pending restart cancelled");
            let exit = st.last_exit.clone();
            self.finish(&mut st, SessionStatus::Stopped, None, exit.as_ref());
            let snapshot = st.record.clone();
            drop(st);
            self.retain(id);
            return snapshot;
        }
        self.emit(SessionEvent::Status {
            session: st.record.clone(),
        });
        st.record.clone()
    }

    fn transition(&self, st: &mut SessionState, next: SessionStatus) {
        let from = st.record.status;
        if !from.can_transition_to(next) {
            tracing::warn!(session_id = %st.record.id, %from, to = %next, "unexpected status transition");
        }
        st.record.status = next;
        st.record.last_active_ms = self.now_ms();
        tracing::info!(session_id = %st.record.id, %from, to = %next, "session status");
        self.emit(SessionEvent::Status {
            session: st.record.clone(),
        });
    }

    /// Move to a terminal state. The caller runs `retain` once its locks are released.
    fn finish(&self, st: &mut SessionState, next: SessionStatus, error: Option<String>, exit: Option<&ExitInfo>) {
        st.control = None;
        st.restart = None;
        if let Some(exit) = exit {
            st.record.exit_code = exit.code;
            st.record.signal = exit.signal.clone();
        }
        st.record.error = error;
        self.authority.retire(&st.record.id);
        self.transition(st, next);
    }

    fn emit_exit(&self, st: &SessionState, exit: &ExitInfo) {
        self.emit(SessionEvent::Exit {
            session_id: st.record.id.clone(),
            exit_code: exit.code,
            signal: exit.signal.clone(),
            status: st.record.status,
        });
    }

    fn start(&self, spec: SessionSpec, mode: StartMode, restart_count: u32) -> Result<Created> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(GridError::Launch("supervisor is shut down".to_string()));
        }
        let id = spec.id.clone();
        let initial = match mode {
            StartMode::Fresh => SessionStatus::Creating,
            StartMode::Recover => SessionStatus::Recovering,
        };
        let cell = {
            let mut sessions = self.sessions.lock();
            sessions
                .entry(id.clone())
                .or_insert_with(|| {
                    Arc::new(SessionCell {
                        op_lock: Mutex::new(()),
                        state: Mutex::new(SessionState::new(spec.clone(), initial, self.now_ms(), restart_count)),
                    })
                })
                .clone()
        };

        let op = cell.op_lock.lock();
        {
            let mut st = cell.state.lock();
            if let Some(control) = st.control.take() {
                tracing::info!(session_id = %id, "replacing live session");
                st.manual_stop = true;
                st.restart = None;
                if let Err(e) = control.lock().kill() {
                    tracing::warn!(session_id = %id, error = %e, "killing replaced session failed");
                }
            }
            *st = SessionState::new(spec.clone(), initial, self.now_ms(), restart_count);
            st.generation = self.next_generation();
            self.emit(SessionEvent::Status {
                session: st.record.clone(),
            });
        }

        let launched = self.launch(&spec, mode == StartMode::Recover);
        let mut st = cell.state.lock();
        match launched.and_then(|l| self.install(&mut st, l)) {
            Ok(()) => {
                self.transition(&mut st, SessionStatus::Running);
                let token = self.authority.issue(&id);
                Ok(Created {
                    session: st.record.clone(),
                    capability_token: token,
                })
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "session launch failed");
                self.finish(&mut st, SessionStatus::Errored, Some(e.to_string()), None);
                drop(st);
                drop(op);
                self.retain(&id);
                Err(e)
            }
        }
    }

    fn launch_env(&self, spec: &SessionSpec) -> Vec<(String, String)> {
        let mut env = vec![
            ("TERM".to_string(), "xterm-256color".to_string()),
            ("COLORTERM".to_string(), "truecolor".to_string()),
            ("AGENTS_GRID_SESSION_ID".to_string(), spec.id.clone()),
        ];
        if ShellFlavor::detect(&spec.shell) == ShellFlavor::Posix {
            env.push(("SHELL".to_string(), spec.shell.clone()));
            env.push(("PATH".to_string(), shell::fallback_path()));
        }
        if self.settings.shell_integration && shell::shell_name(&spec.shell) == "bash" {
            if let Ok(orig) = std::env::var("PROMPT_COMMAND") {
                env.push(("AGENTS_GRID_ORIG_PROMPT_COMMAND".to_string(), orig));
            }
            env.push(("PROMPT_COMMAND".to_string(), shell::BASH_CWD_PROMPT_COMMAND.to_string()));
        }
        for (key, value) in &spec.env {
            env.retain(|(k, _)| k != key);
            env.push((key.clone(), value.clone()));
        }
        env
    }

    /// Start the process for `spec`. Persistent sessions get a fresh tmux
    /// backend unless `attach_only`, then a client attached to it.
    fn launch(&self, spec: &SessionSpec, attach_only: bool) -> Result<Launched> {
        let flavor = ShellFlavor::detect(&spec.shell);
        let mut args = shell::startup_args(flavor, spec.command.as_deref(), !spec.env.is_empty());
        let env = self.launch_env(spec);

        if !spec.persistent {
            return self.launcher.launch(&LaunchSpec {
                program: spec.shell.clone(),
                args,
                cwd: spec.cwd.clone(),
                env,
                cols: spec.cols,
                rows: spec.rows,
            });
        }

        let mux = self
            .multiplexer
            .as_ref()
            .ok_or_else(|| GridError::Multiplexer("persistent sessions need tmux, which is disabled".to_string()))?;
        let name = session_name(&spec.id);
        if !attach_only {
            if mux.has_session(&name) {
                mux.kill_session(&name)?;
            }
            let mut command = vec![spec.shell.clone()];
            command.append(&mut args);
            mux.new_session(&NewSession {
                name: name.clone(),
                cwd: spec.cwd.clone(),
                cols: spec.cols,
                rows: spec.rows,
                env,
                command,
            })?;
        }

        let attach = mux.attach_spec(&name, &spec.cwd, spec.cols, spec.rows)?;
        match self.launcher.launch(&attach) {
            Ok(launched) => Ok(launched),
            Err(e) => {
                if !attach_only {
                    if let Err(kill_err) = mux.kill_session(&name) {
                        tracing::warn!(session = %name, error = %kill_err, "cleanup after failed attach");
                    }
                }
                Err(e)
            }
        }
    }

    /// Wire a launched process into the session and start its reader thread.
    fn install(&self, st: &mut SessionState, launched: Launched) -> Result<()> {
        let Launched { control, output, exit } = launched;
        let control: SharedControl = Arc::new(Mutex::new(control));
        let generation = self.next_generation();
        st.generation = generation;
        let id = st.record.id.clone();
        let me = self.me.clone();
        let spawned = thread::Builder::new()
            .name(format!("grid-reader-{id}"))
            .spawn(move || reader_loop(me, id, generation, output, exit));
        match spawned {
            Ok(_) => {
                st.control = Some(control);
                Ok(())
            }
            Err(e) => {
                if let Err(kill_err) = control.lock().kill() {
                    tracing::warn!(error = %kill_err, "kill after reader spawn failure");
                }
                Err(GridError::Launch(format!("reader thread: {e}")))
            }
        }
    }

    fn on_output(&self, id: &str, generation: u64, text: String) {
        let Some(cell) = self.cell(id) else {
            return;
        };
        let mut st = cell.state.lock();
        if st.generation != generation {
            tracing::debug!(session_id = %id, "dropping output from stale process");
            return;
        }
        st.record.last_active_ms = self.now_ms();
        let cwd = st.cwd.feed(&text);
        self.emit(SessionEvent::Data {
            session_id: id.to_string(),
            chunk: text,
        });
        if let Some(path) = cwd.map(PathBuf::from) {
            if path != st.record.cwd {
                st.record.cwd = path;
                self.emit(SessionEvent::Status {
                    session: st.record.clone(),
                });
            }
        }
    }

    fn on_exit(&self, id: &str, generation: u64, exit: ExitInfo) {
        let Some(cell) = self.cell(id) else {
            return;
        };
        let op = cell.op_lock.lock();
        let mut st = cell.state.lock();
        if st.generation != generation {
            tracing::debug!(session_id = %id, "ignoring exit of stale process");
            return;
        }
        st.control = None;
        st.last_exit = Some(exit.clone());
        tracing::info!(session_id = %id, code = ?exit.code, signal = ?exit.signal, "process exited");

        let decision = match st.record.status {
            SessionStatus::Stopping => AfterExit::Finish(SessionStatus::Stopped, None),
            SessionStatus::Stopped | SessionStatus::Errored => AfterExit::Ignore,
            _ => self.decide_after_exit(&mut st, &exit),
        };

        match decision {
            AfterExit::Ignore => self.emit_exit(&st, &exit),
            AfterExit::Finish(status, error) => {
                self.finish(&mut st, status, error, Some(&exit));
                self.emit_exit(&st, &exit);
                drop(st);
                drop(op);
                self.retain(id);
            }
            AfterExit::Restart => {
                self.schedule_restart(&mut st);
                self.emit_exit(&st, &exit);
            }
            AfterExit::Reattach(spec) => {
                self.transition(&mut st, SessionStatus::Recovering);
                drop(st);
                let result = self.launch(&spec, true);
                let mut st = cell.state.lock();
                match result.and_then(|l| self.install(&mut st, l)) {
                    Ok(()) => {
                        tracing::info!(session_id = %id, "reattached to multiplexer session");
                        self.transition(&mut st, SessionStatus::Running);
                    }
                    Err(e) => {
                        self.finish(&mut st, SessionStatus::Errored, Some(format!("reattach failed: {e}")), Some(&exit));
                        self.emit_exit(&st, &exit);
                        drop(st);
                        drop(op);
                        self.retain(id);
                    }
                }
            }
        }
    }

    fn decide_after_exit(&self, st: &mut SessionState, exit: &ExitInfo) -> AfterExit {
        if st.manual_stop {
            return AfterExit::Finish(SessionStatus::Stopped, None);
        }
        if st.spec.persistent {
            if let Some(mux) = &self.multiplexer {
                if mux.has_session(&session_name(&st.record.id)) {
                    if st.reattached {
                        return AfterExit::Finish(
                            SessionStatus::Errored,
                            Some("multiplexer client exited again after reattach".to_string()),
                        );
                    }
                    st.reattached = true;
                    return AfterExit::Reattach(st.spec.clone());
                }
            }
        }
        if st.spec.auto_restart && exit.is_abnormal() {
            return AfterExit::Restart;
        }
        AfterExit::Finish(SessionStatus::Stopped, None)
    }

    fn schedule_restart(&self, st: &mut SessionState) {
        let timer_id = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
        let id = st.record.id.clone();
        let me = self.me.clone();
        let delay = self.settings.restart_delay;

        let spawned = thread::Builder::new()
            .name(format!("grid-restart-{id}"))
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(delay) {
                    if let Some(inner) = me.upgrade() {
                        inner.fire_restart(&id, timer_id);
                    }
                }
            });
        match spawned {
            Ok(_) => {
                st.record.restart_count += 1;
                st.restart = Some(RestartTimer {
                    id: timer_id,
                    _cancel: cancel_tx,
                });
                tracing::info!(session_id = %st.record.id, delay_ms = delay.as_millis() as u64, "restart scheduled");
                self.transition(st, SessionStatus::Recovering);
            }
            Err(e) => {
                let exit = st.last_exit.clone();
                self.finish(st, SessionStatus::Errored, Some(format!("could not schedule restart: {e}")), exit.as_ref());
            }
        }
    }

    fn fire_restart(&self, id: &str, timer_id: u64) {
        let Some(cell) = self.cell(id) else {
            return;
        };
        let _op = cell.op_lock.lock();
        let spec = {
            let mut st = cell.state.lock();
            if st.restart.as_ref().map(|t| t.id) != Some(timer_id) {
                return;
            }
            st.restart = None;
            if st.manual_stop || !st.spec.auto_restart || st.record.status != SessionStatus::Recovering {
                return;
            }
            st.spec.clone()
        };

        let result = self.launch(&spec, false);
        let mut st = cell.state.lock();
        match result.and_then(|l| self.install(&mut st, l)) {
            Ok(()) => {
                st.reattached = false;
                st.cwd = CwdTracker::new();
                self.transition(&mut st, SessionStatus::Running);
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "auto-restart failed");
                self.emit(SessionEvent::Data {
                    session_id: id.to_string(),
                    chunk: format!("\r\n[agents-grid] restart failed: {e}\r\n"),
                });
                let exit = st.last_exit.clone();
                self.finish(&mut st, SessionStatus::Errored, Some(format!("restart failed: {e}")), exit.as_ref());
                drop(st);
                self.retain(id);
            }
        }
    }

    fn kill_locked(&self, cell: &SessionCell, reason: &str) -> KillOutcome {
        let mut st = cell.state.lock();
        let id = st.record.id.clone();
        match st.record.status {
            SessionStatus::Stopping => return KillOutcome::new(KillStatus::AlreadyStopping, reason),
            SessionStatus::Stopped | SessionStatus::Errored => {
                return KillOutcome::new(KillStatus::AlreadyStopped, reason)
            }
            _ => {}
        }
        tracing::info!(session_id = %id, reason, "kill requested");
        st.manual_stop = true;
        st.restart = None;

        let Some(control) = st.control.clone() else {
            // Pending restart: nothing is attached.
            let exit = st.last_exit.clone();
            self.finish(&mut st, SessionStatus::Stopped, None, exit.as_ref());
            drop(st);
            self.retain(&id);
            return KillOutcome::new(KillStatus::Killed, reason);
        };
        self.transition(&mut st, SessionStatus::Stopping);
        let persistent = st.spec.persistent;
        drop(st);

        let failure = if persistent {
            self.kill_persistent(&id, &control)
        } else {
            control.lock().kill().err().map(|e| format!("kill failed: {e}"))
        };

        match failure {
            None => KillOutcome::new(KillStatus::Killed, reason),
            Some(message) => {
                tracing::warn!(session_id = %id, %message, "kill did not complete");
                let mut st = cell.state.lock();
                if st.record.status == SessionStatus::Stopping {
                    self.finish(&mut st, SessionStatus::Errored, Some(message), None);
                }
                drop(st);
                self.retain(&id);
                KillOutcome::new(KillStatus::Failed, reason)
            }
        }
    }

    /// Kill the tmux session and the attached client independently. Returns
    /// a message when the backend is still reachable or nothing could be killed.
    fn kill_persistent(&self, id: &str, control: &SharedControl) -> Option<String> {
        let client_killed = match control.lock().kill() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "client kill failed");
                false
            }
        };
        let Some(mux) = &self.multiplexer else {
            return (!client_killed).then(|| "kill failed".to_string());
        };
        let name = session_name(id);
        let backend_killed = match mux.kill_session(&name) {
            Ok(killed) => killed,
            Err(e) => {
                tracing::warn!(session = %name, error = %e, "kill-session failed");
                false
            }
        };
        if mux.has_session(&name) {
            return Some("multiplexer session still alive after kill".to_string());
        }
        if !(backend_killed || client_killed) {
            return Some("neither multiplexer session nor client could be killed".to_string());
        }
        None
    }

    /// Remember a terminal session for inspection, forgetting the oldest past capacity.
    fn retain(&self, id: &str) {
        let evicted: Vec<String> = {
            let mut retained = self.retained.lock();
            if !retained.iter().any(|r| r == id) {
                retained.push_back(id.to_string());
            }
            let mut out = Vec::new();
            while retained.len() > self.settings.retention_capacity {
                if let Some(old) = retained.pop_front() {
                    out.push(old);
                }
            }
            out
        };
        for old in evicted {
            let mut sessions = self.sessions.lock();
            let Some(cell) = sessions.get(&old).cloned() else {
                continue;
            };
            // A cell with an operation in flight may be about to relaunch.
            let Some(_op) = cell.op_lock.try_lock() else {
                self.retained.lock().push_front(old);
                continue;
            };
            if cell.state.lock().record.status.is_terminal() {
                sessions.remove(&old);
                self.authority.revoke(&old);
                tracing::debug!(session_id = %old, "forgot retained session");
            }
        }
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let cells: Vec<Arc<SessionCell>> = self.sessions.lock().drain().map(|(_, cell)| cell).collect();
        let mut stopped = 0usize;
        for cell in cells {
            let _op = cell.op_lock.lock();
            let mut st = cell.state.lock();
            st.generation = self.next_generation();
            st.restart = None;
            st.manual_stop = true;
            let Some(control) = st.control.take() else {
                continue;
            };
            if st.spec.persistent && self.settings.kill_on_shutdown {
                if let Some(mux) = &self.multiplexer {
                    if let Err(e) = mux.kill_session(&session_name(&st.record.id)) {
                        tracing::warn!(session_id = %st.record.id, error = %e, "kill-session on shutdown failed");
                    }
                }
            }
            if let Err(e) = control.lock().kill() {
                tracing::warn!(session_id = %st.record.id, error = %e, "kill on shutdown failed");
            }
            stopped += 1;
        }
        self.authority.revoke_all();
        tracing::info!(stopped, "supervisor shut down");
    }
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A retired token means the session is over.
fn require_live(id: &str, grant: Grant) -> Result<()> {
    match grant {
        Grant::Live => Ok(()),
        Grant::Retired => Err(GridError::NotRunning(id.to_string())),
    }
}

fn reader_loop(
    me: Weak<SupervisorInner>,
    id: String,
    generation: u64,
    mut output: Box<dyn Read + Send>,
    exit: Box<dyn ExitWaiter>,
) {
    let mut buf = [0u8; 8192];
    let mut carry: Vec<u8> = Vec::new();
    loop {
        match output.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let text = decode_utf8_stream(&mut carry, &buf[..n]);
                if text.is_empty() {
                    continue;
                }
                match me.upgrade() {
                    Some(inner) => inner.on_output(&id, generation, text),
                    None => return,
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // EIO is how Linux reports a closed pty.
            Err(_) => break,
        }
    }

    if !carry.is_empty() {
        let text = String::from_utf8_lossy(&carry).into_owned();
        if let Some(inner) = me.upgrade() {
            inner.on_output(&id, generation, text);
        }
    }

    let info = exit.wait();
    if let Some(inner) = me.upgrade() {
        inner.on_exit(&id, generation, info);
    }
}
