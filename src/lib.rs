//! Terminal session supervisor and pane-grid orchestrator.
//!
//! [`Supervisor`] owns pty-backed shell sessions (optionally kept alive in a
//! private tmux server) and [`LayoutOrchestrator`] maps them onto a fixed pool
//! of grid panes. [`Grid`] wires both up from a [`GridConfig`].

pub mod capability;
pub mod config;
pub mod error;
pub mod launcher;
pub mod layout;
pub mod logging;
pub mod osc;
pub mod persist;
pub mod policy;
pub mod session;
pub mod shell;
pub mod supervisor;
pub mod tmux;

use std::path::PathBuf;
use std::sync::Arc;

pub use config::GridConfig;
pub use error::{ErrorKind, GridError, Result};
pub use layout::{LayoutOrchestrator, LayoutSnapshot, LayoutView, Pane, PaneState, Preset, RestoreOutcome};
pub use session::{CreateOptions, SessionSnapshot, SessionStatus};
pub use supervisor::{Created, KillOutcome, SessionEvent, Supervisor, SupervisorSettings, WriteOutcome};

use launcher::{Launcher, PtyLauncher};
use tmux::{Multiplexer, TmuxBridge};

pub struct Grid {
    pub supervisor: Supervisor,
    pub layout: LayoutOrchestrator,
    state_path: Option<PathBuf>,
}

impl Grid {
    /// Real pty launcher, plus tmux when enabled and found on this machine.
    pub fn from_config(config: &GridConfig) -> Result<Self> {
        let multiplexer: Option<Arc<dyn Multiplexer>> = if config.multiplexer.enabled {
            let bridge = TmuxBridge::new(&config.multiplexer, config.subprocess_timeout());
            if bridge.is_available() {
                tracing::info!(socket = bridge.socket_label(), "tmux available for persistent sessions");
                Some(Arc::new(bridge) as Arc<dyn Multiplexer>)
            } else {
                tracing::warn!("tmux not found; persistent sessions are unavailable");
                None
            }
        } else {
            None
        };
        Self::with_backends(config, Arc::new(PtyLauncher), multiplexer)
    }

    pub fn with_backends(
        config: &GridConfig,
        launcher: Arc<dyn Launcher>,
        multiplexer: Option<Arc<dyn Multiplexer>>,
    ) -> Result<Self> {
        config.validate()?;
        let supervisor = Supervisor::new(SupervisorSettings::from_config(config), launcher, multiplexer);
        let layout = LayoutOrchestrator::new(supervisor.clone(), config.panes.clone(), &config.default_preset)?;
        Ok(Self {
            supervisor,
            layout,
            state_path: config.resolved_state_path(),
        })
    }

    /// Restore the saved layout if there is one, else fill the default preset.
    pub fn restore_or_start(&self) -> Result<LayoutView> {
        let saved = match &self.state_path {
            Some(path) => persist::load_layout(path).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable layout state");
                None
            }),
            None => None,
        };
        match saved {
            Some(doc) => {
                let outcome = self.layout.restore_layout(&doc)?;
                Ok(LayoutView {
                    layout: outcome.layout,
                    grants: outcome.grants,
                })
            }
            None => self.layout.start(),
        }
    }

    pub fn save(&self) -> Result<()> {
        match &self.state_path {
            Some(path) => persist::save_layout(path, &self.layout.persisted()),
            None => Ok(()),
        }
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.save() {
            tracing::warn!(error = %e, "saving layout on shutdown failed");
        }
        self.supervisor.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory launcher and multiplexer for driving the supervisor in tests.

    use std::collections::HashSet;
    use std::io::{self, Read};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crossbeam_channel::{Receiver, Sender};
    use parking_lot::Mutex;

    use crate::error::{GridError, Result};
    use crate::launcher::{ExitInfo, ExitWaiter, LaunchSpec, Launched, Launcher, PtyControl};
    use crate::policy::CommandPolicy;
    use crate::supervisor::{SessionEvent, Supervisor, SupervisorSettings};
    use crate::tmux::{Multiplexer, NewSession};

    struct Shared {
        spec: LaunchSpec,
        output: Mutex<Option<Sender<Vec<u8>>>>,
        exit: Mutex<Option<Sender<ExitInfo>>>,
        written: Mutex<Vec<u8>>,
        sizes: Mutex<Vec<(u16, u16)>>,
        killed: AtomicBool,
    }

    /// Test-side handle to one launched fake process.
    #[derive(Clone)]
    pub struct FakeProcess {
        shared: Arc<Shared>,
    }

    impl FakeProcess {
        pub fn emit(&self, text: &str) {
            if let Some(tx) = self.shared.output.lock().as_ref() {
                let _ = tx.send(text.as_bytes().to_vec());
            }
        }

        /// End the process. Output already emitted is still delivered first.
        pub fn exit(&self, info: ExitInfo) {
            if let Some(tx) = self.shared.exit.lock().take() {
                let _ = tx.send(info);
            }
            self.shared.output.lock().take();
        }

        pub fn written(&self) -> String {
            String::from_utf8_lossy(&self.shared.written.lock()).into_owned()
        }

        pub fn sizes(&self) -> Vec<(u16, u16)> {
            self.shared.sizes.lock().clone()
        }

        pub fn killed(&self) -> bool {
            self.shared.killed.load(Ordering::SeqCst)
        }

        pub fn spec(&self) -> LaunchSpec {
            self.shared.spec.clone()
        }
    }

    struct FakeControl(FakeProcess);

    impl PtyControl for FakeControl {
        fn write(&mut self, data: &[u8]) -> io::Result<()> {
            if self.0.shared.output.lock().is_none() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "process exited"));
            }
            self.0.shared.written.lock().extend_from_slice(data);
            Ok(())
        }

        fn resize(&self, cols: u16, rows: u16) -> Result<()> {
            self.0.shared.sizes.lock().push((cols, rows));
            Ok(())
        }

        fn kill(&mut self) -> Result<()> {
            if !self.0.shared.killed.swap(true, Ordering::SeqCst) {
                self.0.exit(ExitInfo {
                    code: None,
                    signal: Some("SIGKILL".to_string()),
                });
            }
            Ok(())
        }
    }

    struct FakeOutput {
        rx: Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Read for FakeOutput {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.rx.recv() {
                    Ok(chunk) => self.pending = chunk,
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    struct FakeExit(Receiver<ExitInfo>);

    impl ExitWaiter for FakeExit {
        fn wait(self: Box<Self>) -> ExitInfo {
            self.0.recv().unwrap_or_default()
        }
    }

    #[derive(Default)]
    pub struct FakeLauncher {
        processes: Mutex<Vec<FakeProcess>>,
        failures: Mutex<usize>,
        delay: Mutex<Duration>,
    }

    impl FakeLauncher {
        pub fn spawn_count(&self) -> usize {
            self.processes.lock().len()
        }

        pub fn process(&self, index: usize) -> FakeProcess {
            self.processes.lock()[index].clone()
        }

        pub fn last(&self) -> FakeProcess {
            let processes = self.processes.lock();
            processes[processes.len() - 1].clone()
        }

        /// Make the next `n` launches fail.
        pub fn fail_next(&self, n: usize) {
            *self.failures.lock() = n;
        }

        /// Hold every later launch for `delay` before it returns.
        pub fn set_launch_delay(&self, delay: Duration) {
            *self.delay.lock() = delay;
        }
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, spec: &LaunchSpec) -> Result<Launched> {
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(GridError::Launch("injected launch failure".to_string()));
                }
            }
            let (out_tx, out_rx) = crossbeam_channel::unbounded();
            let (exit_tx, exit_rx) = crossbeam_channel::bounded(1);
            let process = FakeProcess {
                shared: Arc::new(Shared {
                    spec: spec.clone(),
                    output: Mutex::new(Some(out_tx)),
                    exit: Mutex::new(Some(exit_tx)),
                    written: Mutex::new(Vec::new()),
                    sizes: Mutex::new(Vec::new()),
                    killed: AtomicBool::new(false),
                }),
            };
            self.processes.lock().push(process.clone());
            Ok(Launched {
                control: Box::new(FakeControl(process)),
                output: Box::new(FakeOutput {
                    rx: out_rx,
                    pending: Vec::new(),
                }),
                exit: Box::new(FakeExit(exit_rx)),
            })
        }
    }

    #[derive(Default)]
    pub struct FakeMultiplexer {
        alive: Mutex<HashSet<String>>,
        created: Mutex<Vec<String>>,
        resizes: Mutex<Vec<(String, u16, u16)>>,
        /// When set, kill-session reports success but the session stays up.
        pub kill_leaves_alive: AtomicBool,
    }

    impl FakeMultiplexer {
        pub fn mark_alive(&self, name: &str) {
            self.alive.lock().insert(name.to_string());
        }

        pub fn is_alive(&self, name: &str) -> bool {
            self.alive.lock().contains(name)
        }

        pub fn created(&self) -> Vec<String> {
            self.created.lock().clone()
        }

        pub fn resizes(&self) -> Vec<(String, u16, u16)> {
            self.resizes.lock().clone()
        }
    }

    impl Multiplexer for FakeMultiplexer {
        fn new_session(&self, req: &NewSession) -> Result<()> {
            self.alive.lock().insert(req.name.clone());
            self.created.lock().push(req.name.clone());
            Ok(())
        }

        fn has_session(&self, name: &str) -> bool {
            self.is_alive(name)
        }

        fn kill_session(&self, name: &str) -> Result<bool> {
            if self.kill_leaves_alive.load(Ordering::SeqCst) {
                return Ok(true);
            }
            Ok(self.alive.lock().remove(name))
        }

        fn resize_window(&self, name: &str, cols: u16, rows: u16) -> Result<()> {
            self.resizes.lock().push((name.to_string(), cols, rows));
            Ok(())
        }

        fn attach_spec(&self, name: &str, cwd: &Path, cols: u16, rows: u16) -> Result<LaunchSpec> {
            Ok(LaunchSpec {
                program: "tmux".to_string(),
                args: vec!["attach-session".to_string(), "-t".to_string(), format!("={name}")],
                cwd: cwd.to_path_buf(),
                env: Vec::new(),
                cols,
                rows,
            })
        }
    }

    pub fn fake_supervisor(
        launcher: Arc<FakeLauncher>,
        multiplexer: Option<Arc<FakeMultiplexer>>,
        restart_delay: Duration,
    ) -> Supervisor {
        let settings = SupervisorSettings {
            default_shell: "/bin/sh".to_string(),
            shell_integration: false,
            restart_delay,
            retention_capacity: 128,
            kill_on_shutdown: false,
            policy: CommandPolicy::default(),
        };
        Supervisor::new(
            settings,
            launcher,
            multiplexer.map(|m| m as Arc<dyn Multiplexer>),
        )
    }

    /// Next event matching `pred`, skipping others. Panics after five seconds.
    pub fn next_event(rx: &Receiver<SessionEvent>, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(left) {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(_) => panic!("timed out waiting for event"),
            }
        }
    }

    /// Poll `cond` until it holds. Panics after five seconds.
    pub fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
