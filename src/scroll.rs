//! Turning velocity into vertical scroll output.

use log::{info, trace, warn};

use crate::config::{Profile, SinkKind, SinkSettings};
use crate::error::{ScrollError, ScrollResult};
use crate::velocity::clamp_max_velocity;

/// Something that can scroll the focused view by a pixel delta.
/// Positive `dy` moves the content toward the end of the document.
pub trait ScrollSink: Send {
    fn scroll_by(&mut self, dy: i32) -> ScrollResult<()>;
}

/// Converts the per-frame velocity into whole-pixel scroll calls.
#[derive(Debug, Clone)]
pub struct ScrollDriver {
    velocity_threshold: f32,
    down_scale: f32,
    up_scale: f32,
}

impl ScrollDriver {
    pub fn new(profile: &Profile) -> Self {
        let s = &profile.scroll;
        let max = clamp_max_velocity(s.max_velocity);
        Self {
            velocity_threshold: s.velocity_threshold,
            down_scale: s.down_speed / max,
            up_scale: s.up_speed / max,
        }
    }

    /// Pixels to scroll this frame for `velocity`, `0` inside the dead zone.
    pub fn pixels_for(&self, velocity: f32) -> i32 {
        if velocity.abs() <= self.velocity_threshold {
            return 0;
        }
        let scale = if velocity > 0.0 {
            self.down_scale
        } else {
            self.up_scale
        };
        (velocity * scale).round() as i32
    }

    pub fn apply(&self, velocity: f32, sink: &mut dyn ScrollSink) -> ScrollResult<i32> {
        let px = self.pixels_for(velocity);
        if px != 0 {
            sink.scroll_by(px)?;
        }
        Ok(px)
    }
}

/// Collects pixel deltas and hands out whole wheel notches, keeping the rest.
#[derive(Debug, Clone)]
pub struct NotchAccumulator {
    pixels_per_notch: f32,
    pending: f32,
}

impl NotchAccumulator {
    pub fn new(pixels_per_notch: f32) -> Self {
        Self {
            pixels_per_notch: pixels_per_notch.max(1.0),
            pending: 0.0,
        }
    }

    pub fn push(&mut self, dy: i32) -> i32 {
        self.pending += dy as f32;
        let notches = (self.pending / self.pixels_per_notch) as i32;
        self.pending -= notches as f32 * self.pixels_per_notch;
        notches
    }
}

/// Virtual wheel device on /dev/uinput.
pub struct UinputSink {
    notches: NotchAccumulator,
    dev: uinput::device::Device,
}

impl UinputSink {
    pub fn new(settings: &SinkSettings) -> anyhow::Result<Self> {
        use uinput::event::relative;

        let dev = uinput::default()?
            .name("Palmscroll Virtual Wheel")?
            .event(relative::Wheel::Vertical)?
            .create()?;
        info!("uinput: created virtual wheel");
        Ok(Self {
            notches: NotchAccumulator::new(settings.pixels_per_notch),
            dev,
        })
    }
}

impl ScrollSink for UinputSink {
    fn scroll_by(&mut self, dy: i32) -> ScrollResult<()> {
        use uinput::event::relative::Wheel;

        let steps = self.notches.push(dy);
        if steps == 0 {
            return Ok(());
        }
        // wheel up is positive; content moving down means wheel down
        self.dev
            .send(Wheel::Vertical, -steps)
            .and_then(|_| self.dev.synchronize())
            .map_err(|e| ScrollError::Sink(e.to_string()))
    }
}

/// Logs deltas instead of emitting them.
#[derive(Debug, Default)]
pub struct DryRunSink {
    total: i64,
}

impl DryRunSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> i64 {
        self.total
    }
}

impl ScrollSink for DryRunSink {
    fn scroll_by(&mut self, dy: i32) -> ScrollResult<()> {
        self.total += dy as i64;
        trace!("dry-run scroll {dy:+} (total {})", self.total);
        Ok(())
    }
}

/// Sink selected by `sink.kind`. Falls back to dry-run when uinput is unusable.
pub fn sink_from_settings(settings: &SinkSettings) -> Box<dyn ScrollSink> {
    match settings.kind {
        SinkKind::DryRun => Box::new(DryRunSink::new()),
        SinkKind::Uinput => match UinputSink::new(settings) {
            Ok(s) => Box::new(s),
            Err(e) => {
                warn!("uinput not available ({e}); scrolling in dry-run mode");
                Box::new(DryRunSink::new())
            }
        },
    }
}
