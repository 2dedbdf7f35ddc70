//! Hand landmark frames as delivered by the landmark source.

use serde::{Deserialize, Serialize};

pub const LANDMARK_COUNT: usize = 21;
/// Hands beyond this are dropped from a frame.
pub const MAX_HANDS: usize = 2;

pub const WRIST: usize = 0;
pub const INDEX_TIP: usize = 8;
pub const MIDDLE_TIP: usize = 12;
pub const PINKY_TIP: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
}

impl Landmark {
    /// Distance in the image plane, ignoring depth.
    pub fn distance_2d(&self, other: &Landmark) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handedness {
    Left,
    Right,
}

impl Handedness {
    /// Parse the label emitted by pose estimators ("Left", "right", ...).
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "left" => Some(Handedness::Left),
            "right" => Some(Handedness::Right),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandObservation {
    pub landmarks: [Landmark; LANDMARK_COUNT],
    pub handedness: Handedness,
    pub confidence: f32,
}

impl HandObservation {
    pub fn landmark(&self, idx: usize) -> &Landmark {
        &self.landmarks[idx]
    }
}

/// One detection tick worth of hands. Never holds more than [`MAX_HANDS`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LandmarkFrame {
    hands: Vec<HandObservation>,
}

impl LandmarkFrame {
    pub fn new(mut hands: Vec<HandObservation>) -> Self {
        hands.truncate(MAX_HANDS);
        Self { hands }
    }

    pub fn hands(&self) -> &[HandObservation] {
        &self.hands
    }

    pub fn len(&self) -> usize {
        self.hands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_hand(handedness: Handedness) -> HandObservation {
        HandObservation {
            landmarks: [Landmark::default(); LANDMARK_COUNT],
            handedness,
            confidence: 0.9,
        }
    }

    #[test]
    fn frame_drops_extra_hands() {
        let f = LandmarkFrame::new(vec![
            flat_hand(Handedness::Left),
            flat_hand(Handedness::Right),
            flat_hand(Handedness::Left),
        ]);
        assert_eq!(f.len(), 2);
        assert_eq!(f.hands()[1].handedness, Handedness::Right);
    }

    #[test]
    fn distance_ignores_depth() {
        let a = Landmark { x: 0.0, y: 0.0, z: 5.0 };
        let b = Landmark { x: 0.3, y: 0.4, z: -5.0 };
        assert!((a.distance_2d(&b) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn handedness_labels_are_case_insensitive() {
        assert_eq!(Handedness::from_label("Left"), Some(Handedness::Left));
        assert_eq!(Handedness::from_label(" RIGHT "), Some(Handedness::Right));
        assert_eq!(Handedness::from_label("both"), None);
    }
}
