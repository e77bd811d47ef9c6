//! Runs against a real tmux server on a private socket. Skipped when tmux is
//! not installed.
#![cfg(unix)]

use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agents_grid::config::MultiplexerConfig;
use agents_grid::launcher::PtyLauncher;
use agents_grid::policy::CommandPolicy;
use agents_grid::tmux::{session_name, Multiplexer, NewSession, TmuxBridge};
use agents_grid::{CreateOptions, SessionStatus, Supervisor, SupervisorSettings};

struct Server {
    bridge: Arc<TmuxBridge>,
    label: String,
}

impl Server {
    fn start(test: &str) -> Option<Self> {
        which::which("tmux").ok()?;
        let label = format!("agents-grid-test-{test}-{}", std::process::id());
        let config = MultiplexerConfig {
            socket_label: label.clone(),
            ..MultiplexerConfig::default()
        };
        let bridge = TmuxBridge::new(&config, Duration::from_secs(5));
        bridge.is_available().then(|| Self {
            bridge: Arc::new(bridge),
            label,
        })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = Command::new("tmux").args(["-L", &self.label, "kill-server"]).output();
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn session_lifecycle_on_private_socket() {
    let Some(server) = Server::start("lifecycle") else {
        return;
    };
    let bridge = &server.bridge;
    let dir = tempfile::tempdir().unwrap();
    let name = session_name("lifecycle");

    assert!(!bridge.has_session(&name));
    bridge
        .new_session(&NewSession {
            name: name.clone(),
            cwd: dir.path().to_path_buf(),
            cols: 100,
            rows: 30,
            env: vec![("AGENTS_GRID_TEST".to_string(), "1".to_string())],
            command: vec!["/bin/sh".to_string()],
        })
        .unwrap();
    assert!(bridge.has_session(&name));
    assert!(bridge.list_sessions().unwrap().contains(&name));
    bridge.resize_window(&name, 120, 40).unwrap();

    let attach = bridge.attach_spec(&name, dir.path(), 120, 40).unwrap();
    assert!(attach.args.contains(&server.label));

    assert!(bridge.kill_session(&name).unwrap());
    assert!(!bridge.has_session(&name));
    assert!(!bridge.kill_session(&name).unwrap());
}

#[test]
fn persistent_session_survives_detach_and_recovers() {
    let Some(server) = Server::start("persist") else {
        return;
    };
    let settings = SupervisorSettings {
        default_shell: "/bin/sh".to_string(),
        shell_integration: false,
        restart_delay: Duration::from_secs(60),
        retention_capacity: 16,
        kill_on_shutdown: false,
        policy: CommandPolicy::default(),
    };
    let sup = Supervisor::new(settings, Arc::new(PtyLauncher), Some(server.bridge.clone()));
    let dir = tempfile::tempdir().unwrap();
    let created = sup
        .create(CreateOptions {
            id: Some("persist-1".to_string()),
            cwd: Some(dir.path().to_path_buf()),
            persistent: true,
            ..CreateOptions::default()
        })
        .unwrap();
    let name = session_name("persist-1");
    assert!(server.bridge.has_session(&name));

    // A second supervisor stands in for a restarted host process.
    let snapshot = created.session.clone();
    drop(sup);
    assert!(server.bridge.has_session(&name));

    let settings = SupervisorSettings {
        default_shell: "/bin/sh".to_string(),
        shell_integration: false,
        restart_delay: Duration::from_secs(60),
        retention_capacity: 16,
        kill_on_shutdown: false,
        policy: CommandPolicy::default(),
    };
    let sup = Supervisor::new(settings, Arc::new(PtyLauncher), Some(server.bridge.clone()));
    let recovered = sup.recover(&snapshot).unwrap();
    assert_eq!(recovered.session.status, SessionStatus::Running);

    let outcome = sup
        .kill("persist-1", Some(&recovered.capability_token), "test")
        .unwrap();
    assert!(outcome.killed, "{outcome:?}");
    assert!(wait_until(|| !server.bridge.has_session(&name)));
}
