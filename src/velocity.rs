//! Scroll velocity smoothing.
//!
//! The target velocity is discrete (`0` or `±max`) and is written by the
//! detection thread. The current velocity is continuous and only the frame
//! thread advances it, one smoother step per frame.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::gestures::GestureAction;

pub const MIN_MAX_VELOCITY: f32 = 1.0;
pub const MAX_MAX_VELOCITY: f32 = 10.0;
/// Below this magnitude a decaying velocity snaps to exactly zero.
pub const REST_EPSILON: f32 = 0.01;
const SLOW_DECAY: f32 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    None,
}

impl From<GestureAction> for Direction {
    fn from(a: GestureAction) -> Self {
        match a {
            GestureAction::ScrollDown => Direction::Down,
            GestureAction::ScrollUp => Direction::Up,
            GestureAction::Stop => Direction::None,
        }
    }
}

pub fn clamp_max_velocity(v: f32) -> f32 {
    if v.is_nan() {
        return MIN_MAX_VELOCITY;
    }
    v.clamp(MIN_MAX_VELOCITY, MAX_MAX_VELOCITY)
}

/// One smoothing strategy: where `current` goes next given `target`.
pub trait VelocitySmoother: Send + fmt::Debug {
    fn name(&self) -> &'static str;
    fn step(&self, current: f32, target: f32) -> f32;
}

/// Closes a fixed fraction of the gap every frame, then bleeds off the
/// last bit of motion slowly once the target is zero.
#[derive(Debug, Clone)]
pub struct Exponential {
    pub factor: f32,
    pub velocity_threshold: f32,
}

impl VelocitySmoother for Exponential {
    fn name(&self) -> &'static str {
        "exponential"
    }

    fn step(&self, current: f32, target: f32) -> f32 {
        if target == 0.0 && current.abs() < self.velocity_threshold {
            let next = current * SLOW_DECAY;
            return if next.abs() < REST_EPSILON { 0.0 } else { next };
        }
        let next = current + (target - current) * self.factor.clamp(0.01, 1.0);
        if (target - next).abs() < REST_EPSILON {
            target
        } else {
            next
        }
    }
}

/// Constant acceleration toward a moving target, multiplicative friction
/// when coming to rest.
#[derive(Debug, Clone)]
pub struct AccelerateFriction {
    pub acceleration: f32,
    pub friction: f32,
}

impl VelocitySmoother for AccelerateFriction {
    fn name(&self) -> &'static str {
        "accelerate-friction"
    }

    fn step(&self, current: f32, target: f32) -> f32 {
        if target == 0.0 {
            let next = current * self.friction;
            return if next.abs() < REST_EPSILON { 0.0 } else { next };
        }
        let gap = target - current;
        if gap.abs() <= self.acceleration {
            target
        } else {
            current + self.acceleration.copysign(gap)
        }
    }
}

#[derive(Debug, Default)]
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, v: f32) {
        self.0.store(v.to_bits(), Ordering::Release);
    }
}

/// Velocity shared between the detection and frame threads.
#[derive(Debug, Default)]
pub struct VelocityState {
    target: AtomicF32,
    current: AtomicF32,
}

/// Detection-side view of the velocity state. Only writes the target.
#[derive(Debug, Clone)]
pub struct VelocityHandle {
    state: Arc<VelocityState>,
    max_velocity: f32,
}

impl VelocityHandle {
    pub fn set_target(&self, dir: Direction) {
        let v = match dir {
            Direction::Down => self.max_velocity,
            Direction::Up => -self.max_velocity,
            Direction::None => 0.0,
        };
        self.state.target.store(v);
    }

    pub fn target_velocity(&self) -> f32 {
        self.state.target.load()
    }

    pub fn current_velocity(&self) -> f32 {
        self.state.current.load()
    }

    /// Zero both fields. Only call while no frame thread is running.
    pub fn reset(&self) {
        self.state.target.store(0.0);
        self.state.current.store(0.0);
    }
}

#[derive(Debug)]
pub struct VelocityController {
    handle: VelocityHandle,
    smoother: Box<dyn VelocitySmoother>,
    last_frame: Option<u64>,
}

impl VelocityController {
    pub fn new(smoother: Box<dyn VelocitySmoother>, max_velocity: f32) -> Self {
        Self {
            handle: VelocityHandle {
                state: Arc::new(VelocityState::default()),
                max_velocity: clamp_max_velocity(max_velocity),
            },
            smoother,
            last_frame: None,
        }
    }

    pub fn handle(&self) -> VelocityHandle {
        self.handle.clone()
    }

    pub fn mode(&self) -> &'static str {
        self.smoother.name()
    }

    pub fn set_target(&self, dir: Direction) {
        self.handle.set_target(dir);
    }

    pub fn current_velocity(&self) -> f32 {
        self.handle.current_velocity()
    }

    /// Advance `current` one step toward the target and return how much it
    /// moved. A repeated frame number is a no-op.
    pub fn tick(&mut self, frame: u64) -> f32 {
        if self.last_frame == Some(frame) {
            return 0.0;
        }
        self.last_frame = Some(frame);

        let max = self.handle.max_velocity;
        let target = self.handle.target_velocity().clamp(-max, max);
        let current = self.handle.current_velocity();
        let next = self.smoother.step(current, target).clamp(-max, max);
        self.handle.state.current.store(next);
        next - current
    }

    pub fn reset(&mut self) {
        self.handle.reset();
        self.last_frame = None;
    }
}
