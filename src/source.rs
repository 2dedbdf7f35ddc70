//! Landmark sources: where hand observations come from.
//!
//! The pose model runs out of process. The helper owns the camera, prints
//! `READY` once the model is loaded, and answers every `detect` line with one
//! JSON frame:
//!
//! ```text
//! {"hands":[{"handedness":"Left","score":0.93,"landmarks":[{"x":0.5,"y":0.8,"z":0.0}, ...]}]}
//! ```

use log::{debug, info, warn};
use serde::Deserialize;
use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    path::PathBuf,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::config::SourceSettings;
use crate::error::{ScrollError, ScrollResult};
use crate::landmarks::{HandObservation, Handedness, LANDMARK_COUNT, Landmark, LandmarkFrame};

pub trait LandmarkSource: Send {
    fn name(&self) -> &str;

    /// Make sure the camera can be used. Called before `initialize`.
    fn acquire_camera(&mut self) -> ScrollResult<()>;

    /// Load the model. May take a while.
    fn initialize(&mut self) -> ScrollResult<()>;

    fn next_frame(&mut self) -> ScrollResult<LandmarkFrame>;

    /// Stop the camera and free the model. Safe to call more than once.
    fn release(&mut self);

    /// A handle that makes a blocked `next_frame` return from another
    /// thread. Sources that never block have none.
    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        None
    }
}

pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

#[derive(Debug, Deserialize)]
struct HandJson {
    handedness: String,
    #[serde(default)]
    score: f32,
    landmarks: Vec<Landmark>,
}

#[derive(Debug, Deserialize)]
struct FrameJson {
    #[serde(default)]
    hands: Vec<HandJson>,
    #[serde(default)]
    error: Option<String>,
}

/// Decode one JSON frame line. Malformed hands are skipped, a malformed line
/// or a helper-reported error fails the frame.
pub fn parse_frame(line: &str) -> ScrollResult<LandmarkFrame> {
    let frame: FrameJson = serde_json::from_str(line.trim())
        .map_err(|e| ScrollError::Detection(format!("bad frame json: {e}")))?;
    if let Some(err) = frame.error {
        return Err(ScrollError::Detection(err));
    }

    let mut hands = Vec::with_capacity(frame.hands.len());
    for hand in frame.hands {
        let Some(handedness) = Handedness::from_label(&hand.handedness) else {
            debug!("skipping hand with handedness '{}'", hand.handedness);
            continue;
        };
        let landmarks: [Landmark; LANDMARK_COUNT] = match hand.landmarks.try_into() {
            Ok(l) => l,
            Err(v) => {
                warn!("expected {LANDMARK_COUNT} landmarks, got {}", v.len());
                continue;
            }
        };
        hands.push(HandObservation {
            landmarks,
            handedness,
            confidence: hand.score,
        });
    }
    Ok(LandmarkFrame::new(hands))
}

type SharedChild = Arc<Mutex<Option<Child>>>;

fn lock_child(child: &SharedChild) -> MutexGuard<'_, Option<Child>> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Kills the helper so a pending read sees end of file.
struct KillHelper(SharedChild);

impl Interrupt for KillHelper {
    fn interrupt(&self) {
        if let Some(child) = lock_child(&self.0).as_mut() {
            let _ = child.kill();
        }
    }
}

/// Landmark helper running as a child process.
pub struct ProcessLandmarkSource {
    settings: SourceSettings,
    camera_ready: bool,
    child: SharedChild,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
}

impl ProcessLandmarkSource {
    pub fn new(settings: SourceSettings) -> Self {
        Self {
            settings,
            camera_ready: false,
            child: Arc::new(Mutex::new(None)),
            stdin: None,
            stdout: None,
        }
    }

    fn helper_args(&self) -> Vec<String> {
        let s = &self.settings;
        let mut args = s.args.clone();
        args.extend([
            "--device".to_string(),
            s.device.display().to_string(),
            "--width".to_string(),
            s.width.to_string(),
            "--height".to_string(),
            s.height.to_string(),
            "--facing".to_string(),
            s.facing.clone(),
        ]);
        args
    }
}

impl LandmarkSource for ProcessLandmarkSource {
    fn name(&self) -> &str {
        &self.settings.command
    }

    fn acquire_camera(&mut self) -> ScrollResult<()> {
        if self.camera_ready {
            return Ok(());
        }
        let dev = &self.settings.device;
        match fs::OpenOptions::new().read(true).open(dev) {
            Ok(_) => {
                self.camera_ready = true;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ScrollError::CameraAccess(
                format!("no camera at {}", dev.display()),
            )),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(
                ScrollError::CameraAccess(format!("permission denied for {}", dev.display())),
            ),
            Err(e) => Err(ScrollError::CameraAccess(format!("{}: {e}", dev.display()))),
        }
    }

    fn initialize(&mut self) -> ScrollResult<()> {
        if lock_child(&self.child).is_some() {
            return Ok(());
        }
        info!("starting landmark helper '{}'", self.settings.command);
        let mut child = Command::new(&self.settings.command)
            .args(self.helper_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                ScrollError::ModelInit(format!("cannot spawn '{}': {e}", self.settings.command))
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);
        let (Some(stdin), Some(mut stdout)) = (stdin, stdout) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ScrollError::ModelInit("helper pipes unavailable".into()));
        };

        let mut ready = String::new();
        let n = stdout
            .read_line(&mut ready)
            .map_err(|e| ScrollError::ModelInit(format!("reading helper handshake: {e}")))?;
        let ready = ready.trim();
        if n == 0 || ready != "READY" {
            let _ = child.kill();
            let _ = child.wait();
            let reason = match ready.strip_prefix("ERROR") {
                Some(r) => r.trim().to_string(),
                None if n == 0 => "helper exited before signalling ready".to_string(),
                None => format!("unexpected handshake '{ready}'"),
            };
            return Err(ScrollError::ModelInit(reason));
        }

        info!("landmark helper ready");
        *lock_child(&self.child) = Some(child);
        self.stdin = Some(stdin);
        self.stdout = Some(stdout);
        Ok(())
    }

    fn next_frame(&mut self) -> ScrollResult<LandmarkFrame> {
        let (Some(stdin), Some(stdout)) = (self.stdin.as_mut(), self.stdout.as_mut()) else {
            return Err(ScrollError::SourceLost("helper not running".into()));
        };

        stdin
            .write_all(b"detect\n")
            .and_then(|_| stdin.flush())
            .map_err(|e| ScrollError::SourceLost(format!("writing to helper: {e}")))?;

        let mut line = String::new();
        let n = stdout
            .read_line(&mut line)
            .map_err(|e| ScrollError::SourceLost(format!("reading from helper: {e}")))?;
        if n == 0 {
            return Err(ScrollError::SourceLost("helper closed its output".into()));
        }
        parse_frame(&line)
    }

    fn release(&mut self) {
        // closing stdin lets a well-behaved helper exit on its own
        self.stdin = None;
        self.stdout = None;
        let child = lock_child(&self.child).take();
        if let Some(mut child) = child {
            let _ = child.kill();
            let _ = child.wait();
            info!("landmark helper stopped");
        }
        self.camera_ready = false;
    }

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        Some(Arc::new(KillHelper(self.child.clone())))
    }
}

impl Drop for ProcessLandmarkSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Frames replayed from a JSON-lines recording of helper output.
pub struct ReplaySource {
    path: PathBuf,
    lines: Vec<String>,
    pos: usize,
    looping: bool,
}

impl ReplaySource {
    pub fn new(path: impl Into<PathBuf>, looping: bool) -> Self {
        Self {
            path: path.into(),
            lines: Vec::new(),
            pos: 0,
            looping,
        }
    }

    pub fn remaining(&self) -> usize {
        self.lines.len().saturating_sub(self.pos)
    }
}

impl LandmarkSource for ReplaySource {
    fn name(&self) -> &str {
        "replay"
    }

    fn acquire_camera(&mut self) -> ScrollResult<()> {
        let txt = fs::read_to_string(&self.path).map_err(|e| {
            ScrollError::CameraAccess(format!("cannot open {}: {e}", self.path.display()))
        })?;
        self.lines = txt
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        self.pos = 0;
        Ok(())
    }

    fn initialize(&mut self) -> ScrollResult<()> {
        if self.lines.is_empty() {
            return Err(ScrollError::ModelInit(format!(
                "{} holds no frames",
                self.path.display()
            )));
        }
        info!("replay: {} frames from {}", self.remaining(), self.path.display());
        Ok(())
    }

    fn next_frame(&mut self) -> ScrollResult<LandmarkFrame> {
        if self.pos >= self.lines.len() {
            if !self.looping || self.lines.is_empty() {
                return Err(ScrollError::SourceLost("end of recording".into()));
            }
            self.pos = 0;
        }
        let line = &self.lines[self.pos];
        self.pos += 1;
        parse_frame(line)
    }

    fn release(&mut self) {
        self.lines.clear();
        self.pos = 0;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::NamedTempFile;

    pub(crate) fn hand_json(label: &str, open: bool) -> String {
        let mut pts = vec![(0.5f32, 0.8f32); LANDMARK_COUNT];
        if open {
            pts[12] = (0.5, 0.5);
            pts[8] = (0.42, 0.55);
            pts[20] = (0.60, 0.60);
        }
        let lms: Vec<String> = pts
            .iter()
            .map(|(x, y)| format!("{{\"x\":{x},\"y\":{y},\"z\":0.0}}"))
            .collect();
        format!(
            "{{\"handedness\":\"{label}\",\"score\":0.9,\"landmarks\":[{}]}}",
            lms.join(",")
        )
    }

    #[test]
    fn parses_hands_from_helper_line() {
        let line = format!(
            "{{\"hands\":[{},{}]}}",
            hand_json("Left", true),
            hand_json("Right", false)
        );
        let f = parse_frame(&line).unwrap();
        assert_eq!(f.len(), 2);
        assert_eq!(f.hands()[0].handedness, Handedness::Left);
        assert_eq!(f.hands()[0].landmarks[12].y, 0.5);
        assert!((f.hands()[1].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn empty_and_error_frames() {
        assert!(parse_frame("{\"hands\":[]}").unwrap().is_empty());
        assert!(parse_frame("{}").unwrap().is_empty());
        let err = parse_frame("{\"hands\":[],\"error\":\"inference timeout\"}").unwrap_err();
        assert_eq!(err, ScrollError::Detection("inference timeout".into()));
        assert!(matches!(
            parse_frame("not json"),
            Err(ScrollError::Detection(_))
        ));
    }

    #[test]
    fn skips_malformed_hands() {
        let short = "{\"handedness\":\"Left\",\"landmarks\":[{\"x\":0.1,\"y\":0.2}]}";
        let line = format!("{{\"hands\":[{short},{}]}}", hand_json("Ambidextrous", true));
        assert!(parse_frame(&line).unwrap().is_empty());
    }

    #[test]
    fn replay_reads_until_end() {
        let mut rec = NamedTempFile::new().unwrap();
        write!(rec, "{{\"hands\":[{}]}}\n\n{{\"hands\":[]}}\n", hand_json("Right", true)).unwrap();

        let mut src = ReplaySource::new(rec.path(), false);
        src.acquire_camera().unwrap();
        src.initialize().unwrap();
        assert_eq!(src.remaining(), 2);
        assert_eq!(src.next_frame().unwrap().len(), 1);
        assert!(src.next_frame().unwrap().is_empty());
        assert!(matches!(src.next_frame(), Err(ScrollError::SourceLost(_))));

        let mut looping = ReplaySource::new(rec.path(), true);
        looping.acquire_camera().unwrap();
        for _ in 0..5 {
            looping.next_frame().unwrap();
        }
    }

    #[test]
    fn missing_recording_is_a_camera_error() {
        let mut src = ReplaySource::new("/nonexistent/palmscroll.jsonl", false);
        assert!(matches!(
            src.acquire_camera(),
            Err(ScrollError::CameraAccess(_))
        ));
    }

    #[test]
    fn missing_camera_device_is_reported() {
        let mut src = ProcessLandmarkSource::new(SourceSettings {
            device: PathBuf::from("/nonexistent/video9"),
            ..SourceSettings::default()
        });
        let err = src.acquire_camera().unwrap_err();
        assert!(err.to_string().contains("no camera"));
    }

    #[test]
    fn unknown_helper_fails_model_init() {
        let mut src = ProcessLandmarkSource::new(SourceSettings {
            command: "/nonexistent/palmscroll-landmarks".into(),
            ..SourceSettings::default()
        });
        assert!(matches!(src.initialize(), Err(ScrollError::ModelInit(_))));
        src.release();
    }

    fn silent_helper() -> ProcessLandmarkSource {
        // handshakes, then never answers a detect request
        ProcessLandmarkSource::new(SourceSettings {
            command: "sh".into(),
            args: vec!["-c".into(), "echo READY; exec sleep 30".into()],
            device: PathBuf::from("/dev/null"),
            ..SourceSettings::default()
        })
    }

    #[test]
    fn interrupt_unblocks_a_silent_helper() {
        let mut src = silent_helper();
        src.acquire_camera().unwrap();
        src.initialize().unwrap();
        let interrupt = src.interrupter().unwrap();

        let started = Instant::now();
        let reader = thread::spawn(move || {
            let res = src.next_frame();
            (res, src)
        });
        thread::sleep(Duration::from_millis(50));
        interrupt.interrupt();

        let (res, mut src) = reader.join().unwrap();
        assert!(matches!(res, Err(ScrollError::SourceLost(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
        src.release();
        interrupt.interrupt();
    }
}
