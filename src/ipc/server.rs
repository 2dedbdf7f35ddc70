use anyhow::Result;
use log::{error, info, warn};
use notify::{EventKind, RecursiveMode, Watcher};
use serde::Serialize;
use std::{
    fs,
    io::{BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Sender},
    },
    thread,
    time::Duration,
};

use super::runtime::socket_path;
use crate::config::DaemonConfigState;
use crate::gestures::DetectionResult;
use crate::orchestrator::{Orchestrator, SessionState};
use crate::source::ProcessLandmarkSource;

pub fn run_daemon() -> Result<()> {
    // socket
    let sock = socket_path()?;
    if sock.exists() {
        let _ = fs::remove_file(&sock);
    }
    let listener = UnixListener::bind(&sock)?;
    info!("daemon: listening on {}", sock.display());

    // state
    let mut state = DaemonState::new()?;
    info!("daemon: active profile '{}'", state.cfg.active_name);

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, term.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, term.clone())?;

    // channels
    let (tx_req, rx_req) = mpsc::channel::<IpcMsg>();

    // profile hot reload
    let _watcher = watch_profiles(&state.cfg, tx_req.clone())
        .inspect_err(|e| warn!("profile watcher unavailable: {e}"))
        .ok();

    state.resume();

    // accept loop
    listener.set_nonblocking(true)?;
    loop {
        if term.load(Ordering::Relaxed) {
            info!("daemon: signal received");
            break;
        }

        if let Ok((stream, _)) = listener.accept() {
            let tx = tx_req.clone();
            let snapshot = state.snapshot();
            thread::spawn(move || {
                if let Err(e) = handle_client(stream, snapshot, tx) {
                    error!("ipc client error: {e}");
                }
            });
        }

        while let Ok(msg) = rx_req.try_recv() {
            match msg {
                IpcMsg::Reload => {
                    if let Err(e) = state.cfg.reload() {
                        error!("reload failed, keeping last good profile: {e}");
                    } else {
                        info!("profile reloaded");
                        state.apply_profile();
                    }
                }
                IpcMsg::UseProfile(name) => {
                    if let Err(e) = state.cfg.set_active(&name) {
                        error!("use profile failed: {e}");
                    } else {
                        info!("switched active profile to {}", state.cfg.active_name);
                        state.apply_profile();
                    }
                }
                IpcMsg::Pause => state.pause(),
                IpcMsg::Resume => state.resume(),
                IpcMsg::Shutdown => {
                    state.orchestrator.stop();
                    let _ = fs::remove_file(&sock);
                    info!("daemon: shut down");
                    return Ok(());
                }
            }
        }

        thread::sleep(Duration::from_millis(5));
    }

    state.orchestrator.stop();
    let _ = fs::remove_file(&sock);
    Ok(())
}

/// Whether `paths` include the profile the pointer file currently names.
/// The pointer is read on every call since `use` can move it.
fn touches_active_profile(paths: &[PathBuf], active_ptr: &Path, profiles_dir: &Path) -> bool {
    let Ok(name) = fs::read_to_string(active_ptr) else {
        return false;
    };
    let active = profiles_dir.join(format!("{}.toml", name.trim()));
    paths.iter().any(|p| p == &active)
}

fn watch_profiles(cfg: &DaemonConfigState, tx: Sender<IpcMsg>) -> notify::Result<impl Watcher + use<>> {
    let active_ptr = cfg.active_ptr.clone();
    let profiles_dir = cfg.profiles_dir.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let Ok(ev) = res else { return };
        if !matches!(ev.kind, EventKind::Modify(_) | EventKind::Create(_)) {
            return;
        }
        // other profiles can change freely without restarting the session
        if !touches_active_profile(&ev.paths, &active_ptr, &profiles_dir) {
            return;
        }
        let _ = tx.send(IpcMsg::Reload);
    })?;
    watcher.watch(&cfg.profiles_dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

fn handle_client(mut stream: UnixStream, snap: Snapshot, tx_req: Sender<IpcMsg>) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Ok(());
    }
    let req: serde_json::Value = serde_json::from_str(&line)?;
    let resp = handle_request(&req, &snap, &tx_req);
    writeln!(stream, "{}", resp)?;
    Ok(())
}

fn handle_request(req: &serde_json::Value, st: &Snapshot, tx_req: &Sender<IpcMsg>) -> serde_json::Value {
    let op = req.get("op").and_then(|v| v.as_str()).unwrap_or("");

    match op {
        "status" => serde_json::json!({"ok": true, "data": st.status}),
        "reload" => {
            let _ = tx_req.send(IpcMsg::Reload);
            serde_json::json!({"ok": true, "data": {"active_profile": st.cfg.active_name}})
        }
        "use" => {
            let name = req.get("profile").and_then(|v| v.as_str()).unwrap_or("");
            if name.is_empty() {
                return serde_json::json!({"ok": false, "error": "missing profile name"});
            }
            let _ = tx_req.send(IpcMsg::UseProfile(name.to_string()));
            serde_json::json!({"ok": true, "data": {"active_profile": name}})
        }
        "list" => {
            let list = st.cfg.list_profiles();
            serde_json::json!({"ok": true, "data": {"profiles": list, "active": st.cfg.active_name}})
        }
        "doctor" => {
            let report = st.cfg.doctor_report();
            serde_json::json!({"ok": true, "data": report})
        }
        "pause" => {
            let _ = tx_req.send(IpcMsg::Pause);
            serde_json::json!({"ok": true, "data": "pausing"})
        }
        "resume" => {
            let _ = tx_req.send(IpcMsg::Resume);
            serde_json::json!({"ok": true, "data": "resuming"})
        }
        "shutdown" => {
            let _ = tx_req.send(IpcMsg::Shutdown);
            serde_json::json!({"ok": true, "data": "shutting down"})
        }
        _ => serde_json::json!({"ok": false, "error": format!("unknown op: {op}")}),
    }
}

#[derive(Debug, Clone, Serialize)]
struct StatusReport {
    enabled: bool,
    active_profile: String,
    session: SessionState,
    velocity: f32,
    target_velocity: f32,
    last_result: Option<DetectionResult>,
    /// Detection and sink errors since the daemon started.
    errors: u64,
}

/// What a client thread gets to see: a copy taken at accept time.
struct Snapshot {
    cfg: DaemonConfigState,
    status: StatusReport,
}

struct DaemonState {
    enabled: bool,
    cfg: DaemonConfigState,
    orchestrator: Orchestrator,
    errors: Arc<AtomicU64>,
}

impl DaemonState {
    fn new() -> Result<Self> {
        let cfg = DaemonConfigState::load_or_install_default()?;
        let mut orchestrator = Orchestrator::new(cfg.profile.clone());
        orchestrator.on_result(|r| {
            info!(
                "hands={} left_open={} right_open={} action={:?}",
                r.hands_detected, r.left_palm_open, r.right_palm_open, r.gesture_action
            )
        });
        let errors = Arc::new(AtomicU64::new(0));
        let counter = errors.clone();
        orchestrator.on_error(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        Ok(Self {
            enabled: true,
            cfg,
            orchestrator,
            errors,
        })
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            cfg: self.cfg.clone(),
            status: StatusReport {
                enabled: self.enabled,
                active_profile: self.cfg.active_name.clone(),
                session: self.orchestrator.state(),
                velocity: self.orchestrator.current_velocity(),
                target_velocity: self.orchestrator.target_velocity(),
                last_result: self.orchestrator.last_result(),
                errors: self.errors.load(Ordering::Relaxed),
            },
        }
    }

    fn pause(&mut self) {
        self.enabled = false;
        self.orchestrator.stop();
    }

    /// Start a session if enabled. Failures are logged and kept in the
    /// session state; `resume` retries.
    fn resume(&mut self) {
        self.enabled = true;
        if self.orchestrator.state() == SessionState::Detecting {
            return;
        }
        let source = ProcessLandmarkSource::new(self.cfg.profile.source.clone());
        if let Err(e) = self.orchestrator.start(Box::new(source)) {
            warn!("session not started: {e}");
        }
    }

    fn apply_profile(&mut self) {
        self.orchestrator.stop();
        self.orchestrator.set_profile(self.cfg.profile.clone());
        if self.enabled {
            self.resume();
        }
    }
}

enum IpcMsg {
    Reload,
    UseProfile(String),
    Pause,
    Resume,
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::{TempDir, tempdir};

    /// The returned dir must outlive the snapshot's config paths.
    fn snapshot() -> (TempDir, Snapshot) {
        let dir = tempdir().unwrap();
        let cfg = DaemonConfigState::load_from(dir.path().to_path_buf()).unwrap();
        let snap = Snapshot {
            status: StatusReport {
                enabled: true,
                active_profile: cfg.active_name.clone(),
                session: SessionState::Detecting,
                velocity: 2.5,
                target_velocity: 5.0,
                last_result: None,
                errors: 3,
            },
            cfg,
        };
        (dir, snap)
    }

    #[test]
    fn status_reports_session() {
        let (tx, _rx) = mpsc::channel();
        let (_dir, snap) = snapshot();
        let resp = handle_request(&serde_json::json!({"op": "status"}), &snap, &tx);
        assert_eq!(resp["ok"], true);
        assert_eq!(resp["data"]["session"]["state"], "detecting");
        assert_eq!(resp["data"]["velocity"], 2.5);
        assert_eq!(resp["data"]["errors"], 3);
        assert_eq!(resp["data"]["active_profile"], "default");
    }

    #[test]
    fn control_ops_are_forwarded() {
        let (tx, rx) = mpsc::channel();
        let (_dir, snap) = snapshot();
        for op in ["pause", "resume", "reload", "shutdown"] {
            let resp = handle_request(&serde_json::json!({"op": op}), &snap, &tx);
            assert_eq!(resp["ok"], true, "{op}");
        }
        let resp = handle_request(&serde_json::json!({"op": "use", "profile": "calm"}), &snap, &tx);
        assert_eq!(resp["data"]["active_profile"], "calm");

        let msgs: Vec<IpcMsg> = rx.try_iter().collect();
        assert!(matches!(msgs[0], IpcMsg::Pause));
        assert!(matches!(msgs[1], IpcMsg::Resume));
        assert!(matches!(msgs[2], IpcMsg::Reload));
        assert!(matches!(msgs[3], IpcMsg::Shutdown));
        assert!(matches!(&msgs[4], IpcMsg::UseProfile(n) if n == "calm"));
    }

    #[test]
    fn bad_requests_are_rejected() {
        let (tx, rx) = mpsc::channel();
        let (_dir, snap) = snapshot();
        let resp = handle_request(&serde_json::json!({"op": "dance"}), &snap, &tx);
        assert_eq!(resp["ok"], false);
        let resp = handle_request(&serde_json::json!({"op": "use"}), &snap, &tx);
        assert_eq!(resp["ok"], false);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn list_includes_default_profile() {
        let (tx, _rx) = mpsc::channel();
        let (_dir, snap) = snapshot();
        let resp = handle_request(&serde_json::json!({"op": "list"}), &snap, &tx);
        assert_eq!(resp["data"]["profiles"][0], "default");
        assert_eq!(resp["data"]["active"], "default");
    }

    #[test]
    fn only_the_active_profile_triggers_reload() {
        let (_dir, snap) = snapshot();
        let cfg = &snap.cfg;
        let active = vec![cfg.profiles_dir.join("default.toml")];
        let other = vec![cfg.profiles_dir.join("calm.toml")];

        assert!(touches_active_profile(&active, &cfg.active_ptr, &cfg.profiles_dir));
        assert!(!touches_active_profile(&other, &cfg.active_ptr, &cfg.profiles_dir));
        assert!(!touches_active_profile(
            &[cfg.active_ptr.clone()],
            &cfg.active_ptr,
            &cfg.profiles_dir
        ));

        fs::write(&cfg.active_ptr, "calm").unwrap();
        assert!(touches_active_profile(&other, &cfg.active_ptr, &cfg.profiles_dir));
        assert!(!touches_active_profile(&active, &cfg.active_ptr, &cfg.profiles_dir));
    }
}
