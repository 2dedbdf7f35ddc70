//! Session lifecycle and the two timing domains.
//!
//! The detection thread samples the landmark source on a fixed interval and
//! steers the velocity target. The frame thread advances the velocity and
//! scrolls, once per frame interval. They share nothing but the velocity
//! state.

use log::{debug, error, info, warn};
use serde::Serialize;
use std::{
    ops::ControlFlow,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError, Sender},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::config::Profile;
use crate::error::{ScrollError, ScrollResult};
use crate::gestures::{DetectionResult, Gesture, GestureClassifier};
use crate::landmarks::LandmarkFrame;
use crate::scroll::{ScrollDriver, ScrollSink, sink_from_settings};
use crate::source::{Interrupt, LandmarkSource};
use crate::stabilizer::{GestureStabilizer, Stabilized};
use crate::velocity::{Direction, VelocityController, VelocityHandle};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "kebab-case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Detecting,
    Stopped,
    Error(String),
}

pub type ResultCallback = Arc<dyn Fn(&DetectionResult) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ScrollError) + Send + Sync>;

#[derive(Clone, Default)]
struct Callbacks {
    on_result: Option<ResultCallback>,
    on_error: Option<ErrorCallback>,
}

impl Callbacks {
    fn result(&self, r: &DetectionResult) {
        if let Some(cb) = &self.on_result {
            cb(r);
        }
    }

    fn error(&self, e: &ScrollError) {
        if let Some(cb) = &self.on_error {
            cb(e);
        }
    }
}

#[derive(Debug)]
struct Status {
    state: SessionState,
    last_result: Option<DetectionResult>,
}

type SharedStatus = Arc<Mutex<Status>>;

fn lock(status: &SharedStatus) -> MutexGuard<'_, Status> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of one detection sample.
#[derive(Debug, Clone, Copy)]
pub struct DetectionStep {
    pub result: DetectionResult,
    pub stability: Stabilized,
    /// The stable gesture differs from the last one reported.
    pub changed: bool,
}

/// Classifier + stabilizer + target steering for one session.
#[derive(Debug)]
pub struct DetectionPipeline {
    classifier: GestureClassifier,
    stabilizer: GestureStabilizer,
    velocity: VelocityHandle,
    reported: Option<Gesture>,
}

impl DetectionPipeline {
    pub fn new(profile: &Profile, velocity: VelocityHandle) -> Self {
        Self {
            classifier: GestureClassifier::new(profile.palm),
            stabilizer: GestureStabilizer::new(profile.scroll.stability_threshold),
            velocity,
            reported: None,
        }
    }

    pub fn process(&mut self, frame: &LandmarkFrame) -> DetectionStep {
        let result = self.classifier.classify(frame.hands());
        let stability = self.stabilizer.update(result.gesture());
        debug!(
            "raw {} x{}",
            result.gesture().as_str(),
            self.stabilizer.consecutive_count()
        );

        let mut changed = false;
        if stability.is_stable {
            self.velocity
                .set_target(Direction::from(stability.gesture.action()));
            changed = self.reported != Some(stability.gesture);
            self.reported = Some(stability.gesture);
        }
        DetectionStep {
            result,
            stability,
            changed,
        }
    }

    pub fn reset(&mut self) {
        self.stabilizer.reset();
        self.reported = None;
    }
}

/// Velocity update + scroll application, one call per frame.
#[derive(Debug)]
pub struct RenderLoop {
    controller: VelocityController,
    driver: ScrollDriver,
    frame: u64,
}

impl RenderLoop {
    pub fn new(controller: VelocityController, driver: ScrollDriver) -> Self {
        Self {
            controller,
            driver,
            frame: 0,
        }
    }

    /// Returns the pixels scrolled this frame.
    pub fn frame(&mut self, sink: &mut dyn ScrollSink) -> ScrollResult<i32> {
        self.controller.tick(self.frame);
        self.frame += 1;
        self.driver.apply(self.controller.current_velocity(), sink)
    }

    pub fn velocity(&self) -> VelocityHandle {
        self.controller.handle()
    }

    pub fn reset(&mut self) {
        self.controller.reset();
        self.frame = 0;
    }
}

/// A thread that runs `tick` every `period` until cancelled or until
/// `tick` breaks, then hands its state back.
struct Periodic<S> {
    cancel: Sender<()>,
    handle: JoinHandle<S>,
}

impl<S: Send + 'static> Periodic<S> {
    fn spawn<F>(name: &str, period: Duration, mut state: S, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut(&mut S) -> ControlFlow<()> + Send + 'static,
    {
        let (cancel, rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut next = Instant::now();
                loop {
                    if tick(&mut state).is_break() {
                        break;
                    }
                    next += period;
                    let now = Instant::now();
                    if next < now {
                        // fell behind; skip the missed ticks instead of bursting
                        next = now;
                    }
                    match rx.recv_timeout(next - now) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                state
            })?;
        Ok(Self { cancel, handle })
    }

    /// Cancel and join. `None` if the thread panicked.
    fn stop(self) -> Option<S> {
        let _ = self.cancel.send(());
        match self.handle.join() {
            Ok(s) => Some(s),
            Err(_) => {
                error!("periodic task panicked");
                None
            }
        }
    }
}

struct DetectionTask {
    source: Box<dyn LandmarkSource>,
    pipeline: DetectionPipeline,
    status: SharedStatus,
    callbacks: Callbacks,
    cancelled: Arc<AtomicBool>,
}

impl DetectionTask {
    fn tick(&mut self) -> ControlFlow<()> {
        let frame = self.source.next_frame();
        // stop() may have cut the read short; report nothing after cancel
        if self.cancelled.load(Ordering::Acquire) {
            return ControlFlow::Break(());
        }
        match frame {
            Ok(frame) => {
                let step = self.pipeline.process(&frame);
                lock(&self.status).last_result = Some(step.result);
                if step.changed {
                    info!("gesture: {}", step.stability.gesture.as_str());
                    self.callbacks.result(&step.result);
                }
                ControlFlow::Continue(())
            }
            Err(e) if e.is_fatal() => {
                error!("detection stopped: {e}");
                self.pipeline.velocity.set_target(Direction::None);
                self.source.release();
                lock(&self.status).state = SessionState::Error(e.to_string());
                self.callbacks.error(&e);
                ControlFlow::Break(())
            }
            Err(e) => {
                // keep the current target; scrolling carries on at the last speed
                warn!("{e}");
                self.callbacks.error(&e);
                ControlFlow::Continue(())
            }
        }
    }
}

struct RenderTask {
    render: RenderLoop,
    sink: Box<dyn ScrollSink>,
    callbacks: Callbacks,
}

impl RenderTask {
    fn tick(&mut self) -> ControlFlow<()> {
        match self.render.frame(self.sink.as_mut()) {
            Ok(px) if px != 0 => debug!("scrolled {px:+}px"),
            Ok(_) => {}
            Err(e) => {
                warn!("{e}");
                self.callbacks.error(&e);
            }
        }
        ControlFlow::Continue(())
    }
}

struct Session {
    detection: Periodic<DetectionTask>,
    render: Periodic<RenderTask>,
    velocity: VelocityHandle,
    cancelled: Arc<AtomicBool>,
    interrupt: Option<Arc<dyn Interrupt>>,
}

/// Owns one scroll session at a time: the landmark source, the sink and the
/// two periodic threads between them.
pub struct Orchestrator {
    profile: Profile,
    status: SharedStatus,
    callbacks: Callbacks,
    sink: Option<Box<dyn ScrollSink>>,
    /// Stabilizer and velocity state from the last session, reset to neutral.
    parked: Option<(DetectionPipeline, RenderLoop)>,
    session: Option<Session>,
}

impl Orchestrator {
    /// The sink is created from the profile on first start.
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            status: Arc::new(Mutex::new(Status {
                state: SessionState::Uninitialized,
                last_result: None,
            })),
            callbacks: Callbacks::default(),
            sink: None,
            parked: None,
            session: None,
        }
    }

    pub fn with_sink(profile: Profile, sink: Box<dyn ScrollSink>) -> Self {
        let mut o = Self::new(profile);
        o.sink = Some(sink);
        o
    }

    /// Callbacks registered here apply from the next `start`.
    pub fn on_result(&mut self, cb: impl Fn(&DetectionResult) + Send + Sync + 'static) {
        self.callbacks.on_result = Some(Arc::new(cb));
    }

    pub fn on_error(&mut self, cb: impl Fn(&ScrollError) + Send + Sync + 'static) {
        self.callbacks.on_error = Some(Arc::new(cb));
    }

    /// New settings take effect on the next `start`.
    pub fn set_profile(&mut self, profile: Profile) {
        if profile.sink.kind != self.profile.sink.kind
            || profile.sink.pixels_per_notch != self.profile.sink.pixels_per_notch
        {
            self.sink = None;
        }
        self.parked = None;
        self.profile = profile;
    }

    pub fn state(&self) -> SessionState {
        lock(&self.status).state.clone()
    }

    pub fn last_result(&self) -> Option<DetectionResult> {
        lock(&self.status).last_result
    }

    pub fn current_velocity(&self) -> f32 {
        self.session
            .as_ref()
            .map_or(0.0, |s| s.velocity.current_velocity())
    }

    pub fn target_velocity(&self) -> f32 {
        self.session
            .as_ref()
            .map_or(0.0, |s| s.velocity.target_velocity())
    }

    fn set_state(&self, state: SessionState) {
        lock(&self.status).state = state;
    }

    fn fail(&self, e: ScrollError) -> ScrollError {
        error!("{e}");
        self.set_state(SessionState::Error(e.to_string()));
        self.callbacks.error(&e);
        e
    }

    pub fn start(&mut self, mut source: Box<dyn LandmarkSource>) -> ScrollResult<()> {
        if self.session.is_some() {
            if self.state() == SessionState::Detecting {
                return Err(ScrollError::InvalidState("detection already running".into()));
            }
            // previous session died on its own; clean it up first
            self.stop();
        }

        info!("starting session with source '{}'", source.name());
        self.set_state(SessionState::Initializing);
        lock(&self.status).last_result = None;

        if let Err(e) = source.acquire_camera() {
            source.release();
            return Err(self.fail(e));
        }
        if let Err(e) = source.initialize() {
            source.release();
            return Err(self.fail(e));
        }

        let (pipeline, render) = match self.parked.take() {
            Some(parts) => parts,
            None => {
                let controller = VelocityController::new(
                    self.profile.smoother(),
                    self.profile.scroll.max_velocity,
                );
                let pipeline = DetectionPipeline::new(&self.profile, controller.handle());
                let render = RenderLoop::new(controller, ScrollDriver::new(&self.profile));
                (pipeline, render)
            }
        };
        let mode = render.controller.mode();
        let velocity = render.velocity();
        let interrupt = source.interrupter();
        let cancelled = Arc::new(AtomicBool::new(false));
        self.set_state(SessionState::Ready);

        let sink = match self.sink.take() {
            Some(s) => s,
            None => sink_from_settings(&self.profile.sink),
        };

        let render = Periodic::spawn(
            "palmscroll-frame",
            self.profile.frame_interval(),
            RenderTask {
                render,
                sink,
                callbacks: self.callbacks.clone(),
            },
            RenderTask::tick,
        );
        let render = match render {
            Ok(r) => r,
            Err(e) => {
                source.release();
                return Err(self.fail(ScrollError::InvalidState(format!(
                    "cannot spawn frame thread: {e}"
                ))));
            }
        };

        // the detection thread may report a lost source right away
        self.set_state(SessionState::Detecting);
        let detection = Periodic::spawn(
            "palmscroll-detect",
            self.profile.detection_interval(),
            DetectionTask {
                source,
                pipeline,
                status: self.status.clone(),
                callbacks: self.callbacks.clone(),
                cancelled: cancelled.clone(),
            },
            DetectionTask::tick,
        );
        let detection = match detection {
            Ok(d) => d,
            Err(e) => {
                if let Some(task) = render.stop() {
                    self.sink = Some(task.sink);
                }
                return Err(self.fail(ScrollError::InvalidState(format!(
                    "cannot spawn detection thread: {e}"
                ))));
            }
        };

        info!(
            "detecting every {}ms, {mode} smoothing",
            self.profile.scroll.detection_interval_ms
        );
        self.session = Some(Session {
            detection,
            render,
            velocity,
            cancelled,
            interrupt,
        });
        Ok(())
    }

    /// Stop sampling, stop scrolling, release the camera. No callback runs
    /// after this returns, even when the source is stuck mid-read.
    pub fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        session.cancelled.store(true, Ordering::Release);
        if let Some(interrupt) = &session.interrupt {
            interrupt.interrupt();
        }
        let detection = session.detection.stop();
        let render = session.render.stop().map(|task| {
            self.sink = Some(task.sink);
            task.render
        });
        let pipeline = detection.map(|mut task| {
            task.source.release();
            task.pipeline
        });
        if let (Some(mut pipeline), Some(mut render)) = (pipeline, render) {
            pipeline.reset();
            render.reset();
            self.parked = Some((pipeline, render));
        }

        self.set_state(SessionState::Stopped);
        info!("session stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}
