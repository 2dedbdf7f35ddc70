//! Offline run of the detection and frame steps over a recorded session.

use log::warn;
use serde::Serialize;

use crate::config::Profile;
use crate::error::{ScrollError, ScrollResult};
use crate::gestures::{DetectionResult, Gesture};
use crate::orchestrator::{DetectionPipeline, RenderLoop};
use crate::scroll::{DryRunSink, ScrollDriver};
use crate::source::LandmarkSource;
use crate::velocity::VelocityController;

/// Upper bound on frames spent coasting to rest after the recording ends.
const MAX_COAST_FRAMES: usize = 10_000;

#[derive(Debug, Clone, Serialize)]
pub struct ReplayLine {
    pub sample: usize,
    pub result: DetectionResult,
    pub stable: bool,
    pub gesture: Gesture,
    pub target_velocity: f32,
    pub velocity: f32,
    pub scrolled: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplaySummary {
    pub samples: usize,
    pub frame_errors: usize,
    pub scrolled: i64,
}

/// Frames rendered between two detection samples.
fn frames_per_sample(profile: &Profile) -> usize {
    let det = profile.scroll.detection_interval_ms;
    let frame = profile.scroll.frame_interval_ms.max(1);
    ((det as f64 / frame as f64).round() as usize).max(1)
}

pub fn replay(
    profile: &Profile,
    source: &mut dyn LandmarkSource,
    mut on_line: impl FnMut(&ReplayLine),
) -> ScrollResult<ReplaySummary> {
    source.acquire_camera()?;
    source.initialize()?;

    let controller = VelocityController::new(profile.smoother(), profile.scroll.max_velocity);
    let velocity = controller.handle();
    let mut pipeline = DetectionPipeline::new(profile, velocity.clone());
    let mut render = RenderLoop::new(controller, ScrollDriver::new(profile));
    let mut sink = DryRunSink::new();
    let per_sample = frames_per_sample(profile);
    let mut summary = ReplaySummary::default();

    loop {
        let frame = match source.next_frame() {
            Ok(f) => f,
            Err(ScrollError::SourceLost(_)) => break,
            Err(e) if e.is_fatal() => {
                source.release();
                return Err(e);
            }
            Err(e) => {
                warn!("sample {}: {e}", summary.samples);
                summary.frame_errors += 1;
                continue;
            }
        };

        let step = pipeline.process(&frame);
        for _ in 0..per_sample {
            render.frame(&mut sink)?;
        }
        on_line(&ReplayLine {
            sample: summary.samples,
            result: step.result,
            stable: step.stability.is_stable,
            gesture: step.stability.gesture,
            target_velocity: velocity.target_velocity(),
            velocity: velocity.current_velocity(),
            scrolled: sink.total(),
        });
        summary.samples += 1;
    }

    // recording over: let the scroll coast to a stop
    velocity.set_target(crate::velocity::Direction::None);
    for _ in 0..MAX_COAST_FRAMES {
        if velocity.current_velocity() == 0.0 {
            break;
        }
        render.frame(&mut sink)?;
    }

    source.release();
    summary.scrolled = sink.total();
    Ok(summary)
}
