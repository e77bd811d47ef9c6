//! Drives real shells through the platform pty.
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agents_grid::launcher::PtyLauncher;
use agents_grid::policy::CommandPolicy;
use agents_grid::{CreateOptions, SessionEvent, SessionStatus, Supervisor, SupervisorSettings, WriteOutcome};
use crossbeam_channel::Receiver;

fn supervisor() -> Supervisor {
    let settings = SupervisorSettings {
        default_shell: "/bin/sh".to_string(),
        shell_integration: false,
        restart_delay: Duration::from_millis(100),
        retention_capacity: 16,
        kill_on_shutdown: false,
        policy: CommandPolicy::default(),
    };
    Supervisor::new(settings, Arc::new(PtyLauncher), None)
}

/// Collect events for `id` until one satisfies `done`, returning all output seen.
fn collect_until(
    rx: &Receiver<SessionEvent>,
    id: &str,
    mut done: impl FnMut(&SessionEvent, &str) -> bool,
) -> String {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut output = String::new();
    loop {
        let event = rx
            .recv_deadline(deadline)
            .unwrap_or_else(|_| panic!("timed out; output so far: {output:?}"));
        if event.session_id() != id {
            continue;
        }
        if let SessionEvent::Data { chunk, .. } = &event {
            output.push_str(chunk);
        }
        if done(&event, &output) {
            return output;
        }
    }
}

fn opts(cwd: &Path, command: Option<&str>) -> CreateOptions {
    CreateOptions {
        cwd: Some(cwd.to_path_buf()),
        command: command.map(str::to_string),
        ..CreateOptions::default()
    }
}

#[test]
fn command_output_cwd_report_and_exit_code() {
    if !Path::new("/bin/sh").exists() {
        return;
    }
    let sup = supervisor();
    let events = sup.subscribe();
    let dir = tempfile::tempdir().unwrap();
    let created = sup
        .create(opts(
            dir.path(),
            Some(r"printf '\033]7;file://localhost/tmp\007'; echo grid-hello; exit 3"),
        ))
        .unwrap();
    let id = created.session.id.clone();

    let output = collect_until(&events, &id, |e, _| matches!(e, SessionEvent::Exit { .. }));
    assert!(output.contains("grid-hello"), "{output:?}");

    let snap = sup.snapshot(&id).unwrap();
    assert_eq!(snap.status, SessionStatus::Stopped);
    assert_eq!(snap.exit_code, Some(3));
    assert_eq!(snap.cwd, PathBuf::from("/tmp"));
}

#[test]
fn interactive_shell_echoes_and_dies_on_kill() {
    if !Path::new("/bin/sh").exists() {
        return;
    }
    let sup = supervisor();
    let events = sup.subscribe();
    let dir = tempfile::tempdir().unwrap();
    let created = sup.create(opts(dir.path(), None)).unwrap();
    let id = created.session.id.as_str();
    let token = Some(created.capability_token.as_str());

    assert_eq!(
        sup.write(id, token, b"echo marker-$((40+2))\n").unwrap(),
        WriteOutcome::Written
    );
    collect_until(&events, id, |_, out| out.contains("marker-42"));

    sup.resize(id, token, 132, 43).unwrap();
    let outcome = sup.kill(id, token, "test").unwrap();
    assert!(outcome.killed);
    collect_until(&events, id, |e, _| matches!(e, SessionEvent::Exit { .. }));
    assert_eq!(sup.snapshot(id).unwrap().status, SessionStatus::Stopped);
}

#[test]
fn kill_escalates_when_hangup_is_ignored() {
    if !Path::new("/bin/sh").exists() {
        return;
    }
    let sup = supervisor();
    let events = sup.subscribe();
    let dir = tempfile::tempdir().unwrap();
    let created = sup
        .create(opts(dir.path(), Some("trap '' HUP; echo hup-ignored; exec sleep 20")))
        .unwrap();
    let id = created.session.id.as_str();
    collect_until(&events, id, |_, out| out.contains("hup-ignored"));

    let started = Instant::now();
    let outcome = sup.kill(id, Some(&created.capability_token), "test").unwrap();
    assert!(outcome.killed);
    collect_until(&events, id, |e, _| matches!(e, SessionEvent::Exit { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));

    let snap = sup.snapshot(id).unwrap();
    assert_eq!(snap.status, SessionStatus::Stopped);
    assert!(snap.signal.is_some(), "{snap:?}");
}

#[test]
fn death_by_signal_is_reported_as_signal() {
    if !Path::new("/bin/sh").exists() {
        return;
    }
    let sup = supervisor();
    let events = sup.subscribe();
    let dir = tempfile::tempdir().unwrap();
    let created = sup.create(opts(dir.path(), Some("kill -KILL $$"))).unwrap();
    let id = created.session.id.clone();

    let mut exit_signal = None;
    collect_until(&events, &id, |e, _| match e {
        SessionEvent::Exit { signal, exit_code, .. } => {
            assert_eq!(*exit_code, None);
            exit_signal = signal.clone();
            true
        }
        _ => false,
    });
    assert!(exit_signal.is_some());

    let snap = sup.snapshot(&id).unwrap();
    assert_eq!(snap.exit_code, None);
    assert!(snap.signal.is_some(), "{snap:?}");
}
