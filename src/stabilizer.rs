//! Temporal debounce for classified gestures.

use crate::gestures::Gesture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stabilized {
    /// The raw gesture has held for at least the threshold.
    pub is_stable: bool,
    /// Last gesture that reached the threshold.
    pub gesture: Gesture,
}

#[derive(Debug)]
pub struct GestureStabilizer {
    threshold: u32,
    last_gesture: Option<Gesture>,
    consecutive: u32,
    confirmed: Gesture,
}

impl GestureStabilizer {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            last_gesture: None,
            consecutive: 0,
            confirmed: Gesture::None,
        }
    }

    pub fn update(&mut self, raw: Gesture) -> Stabilized {
        if self.last_gesture == Some(raw) {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.last_gesture = Some(raw);
            self.consecutive = 1;
        }

        let is_stable = self.consecutive >= self.threshold;
        if is_stable {
            self.confirmed = raw;
        }
        Stabilized {
            is_stable,
            gesture: self.confirmed,
        }
    }

    pub fn consecutive_count(&self) -> u32 {
        self.consecutive
    }

    pub fn reset(&mut self) {
        self.last_gesture = None;
        self.consecutive = 0;
        self.confirmed = Gesture::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn becomes_stable_on_threshold() {
        let mut s = GestureStabilizer::new(3);
        assert!(!s.update(Gesture::OnePalm).is_stable);
        assert!(!s.update(Gesture::OnePalm).is_stable);
        let third = s.update(Gesture::OnePalm);
        assert!(third.is_stable);
        assert_eq!(third.gesture, Gesture::OnePalm);
    }

    #[test]
    fn change_resets_the_count() {
        let mut s = GestureStabilizer::new(2);
        s.update(Gesture::OnePalm);
        s.update(Gesture::TwoPalms);
        assert_eq!(s.consecutive_count(), 1);
        assert!(s.update(Gesture::TwoPalms).is_stable);
    }

    #[test]
    fn single_anomalous_frame_does_not_flip_gesture() {
        let mut s = GestureStabilizer::new(3);
        for _ in 0..5 {
            s.update(Gesture::OnePalm);
        }
        let glitch = s.update(Gesture::None);
        assert!(!glitch.is_stable);
        assert_eq!(glitch.gesture, Gesture::OnePalm);
        for _ in 0..3 {
            assert_eq!(s.update(Gesture::OnePalm).gesture, Gesture::OnePalm);
        }
    }

    #[test]
    fn threshold_of_one_follows_raw_input() {
        let mut s = GestureStabilizer::new(1);
        assert_eq!(s.update(Gesture::TwoPalms).gesture, Gesture::TwoPalms);
        assert_eq!(s.update(Gesture::None).gesture, Gesture::None);
    }

    #[test]
    fn zero_threshold_is_treated_as_one() {
        let mut s = GestureStabilizer::new(0);
        assert!(s.update(Gesture::OnePalm).is_stable);
    }

    #[test]
    fn reset_forgets_everything() {
        let mut s = GestureStabilizer::new(2);
        s.update(Gesture::OnePalm);
        s.update(Gesture::OnePalm);
        s.reset();
        assert_eq!(s.consecutive_count(), 0);
        let first = s.update(Gesture::OnePalm);
        assert!(!first.is_stable);
        assert_eq!(first.gesture, Gesture::None);
    }
}
