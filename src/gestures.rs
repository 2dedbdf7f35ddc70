use serde::Serialize;

use crate::config::PalmThresholds;
use crate::landmarks::{
    HandObservation, Handedness, INDEX_TIP, MAX_HANDS, MIDDLE_TIP, PINKY_TIP, WRIST,
};

/// Confidence reported for every detected hand.
pub const HAND_CONFIDENCE: f32 = 0.8;
/// Hands at or below this confidence never drive a scroll.
pub const MIN_ACTION_CONFIDENCE: f32 = 0.5;

/// Discrete classification of a frame's hand configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Gesture {
    None,
    OnePalm,
    TwoPalms,
}

impl Gesture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gesture::None => "none",
            Gesture::OnePalm => "one-palm",
            Gesture::TwoPalms => "two-palms",
        }
    }

    pub fn action(&self) -> GestureAction {
        match self {
            Gesture::None => GestureAction::Stop,
            Gesture::OnePalm => GestureAction::ScrollDown,
            Gesture::TwoPalms => GestureAction::ScrollUp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GestureAction {
    ScrollDown,
    ScrollUp,
    Stop,
}

impl GestureAction {
    pub fn gesture(&self) -> Gesture {
        match self {
            GestureAction::Stop => Gesture::None,
            GestureAction::ScrollDown => Gesture::OnePalm,
            GestureAction::ScrollUp => Gesture::TwoPalms,
        }
    }
}

/// Snapshot of one classified frame, handed to callbacks and IPC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectionResult {
    pub hands_detected: u8,
    pub left_palm_open: bool,
    pub right_palm_open: bool,
    pub left_confidence: f32,
    pub right_confidence: f32,
    pub gesture_action: GestureAction,
}

impl DetectionResult {
    pub fn gesture(&self) -> Gesture {
        self.gesture_action.gesture()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct HandSlot {
    present: bool,
    open: bool,
    confidence: f32,
}

impl HandSlot {
    fn drives(&self) -> bool {
        self.present && self.open && self.confidence > MIN_ACTION_CONFIDENCE
    }
}

#[derive(Debug, Clone)]
pub struct GestureClassifier {
    th: PalmThresholds,
}

impl GestureClassifier {
    pub fn new(th: PalmThresholds) -> Self {
        Self { th }
    }

    /// Open palm: fingers extended away from the wrist and spread apart.
    /// Extension uses the middle fingertip, spread runs index tip to pinky tip.
    pub fn is_palm_open(&self, hand: &HandObservation) -> bool {
        let wrist = hand.landmark(WRIST);
        let extension = (hand.landmark(MIDDLE_TIP).y - wrist.y).abs();
        let spread = hand.landmark(INDEX_TIP).distance_2d(hand.landmark(PINKY_TIP));
        extension > self.th.min_extension && spread > self.th.min_spread
    }

    pub fn classify(&self, hands: &[HandObservation]) -> DetectionResult {
        let hands = &hands[..hands.len().min(MAX_HANDS)];

        let mut left = HandSlot::default();
        let mut right = HandSlot::default();
        for hand in hands {
            let slot = HandSlot {
                present: true,
                open: self.is_palm_open(hand),
                confidence: HAND_CONFIDENCE,
            };
            // same label twice: the second hand takes whichever slot is free
            let target = match hand.handedness {
                Handedness::Left if !left.present => &mut left,
                Handedness::Right if !right.present => &mut right,
                _ if !left.present => &mut left,
                _ => &mut right,
            };
            *target = slot;
        }

        let gesture_action = match hands.len() {
            1 => {
                let only = if left.present { left } else { right };
                if only.drives() {
                    GestureAction::ScrollDown
                } else {
                    GestureAction::Stop
                }
            }
            2 => {
                if left.drives() && right.drives() {
                    GestureAction::ScrollUp
                } else {
                    GestureAction::Stop
                }
            }
            _ => GestureAction::Stop,
        };

        DetectionResult {
            hands_detected: hands.len() as u8,
            left_palm_open: left.open,
            right_palm_open: right.open,
            left_confidence: left.confidence,
            right_confidence: right.confidence,
            gesture_action,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::landmarks::{LANDMARK_COUNT, Landmark};

    /// Hand with wrist at the bottom; `open` controls finger extension and spread.
    pub(crate) fn make_hand(handedness: Handedness, open: bool) -> HandObservation {
        let mut landmarks = [Landmark { x: 0.5, y: 0.8, z: 0.0 }; LANDMARK_COUNT];
        if open {
            landmarks[MIDDLE_TIP] = Landmark { x: 0.5, y: 0.5, z: 0.0 };
            landmarks[INDEX_TIP] = Landmark { x: 0.42, y: 0.55, z: 0.0 };
            landmarks[PINKY_TIP] = Landmark { x: 0.60, y: 0.60, z: 0.0 };
        } else {
            // fist: tips curled back near the wrist
            landmarks[MIDDLE_TIP] = Landmark { x: 0.5, y: 0.75, z: 0.0 };
            landmarks[INDEX_TIP] = Landmark { x: 0.48, y: 0.74, z: 0.0 };
            landmarks[PINKY_TIP] = Landmark { x: 0.53, y: 0.75, z: 0.0 };
        }
        HandObservation {
            landmarks,
            handedness,
            confidence: 0.95,
        }
    }

    fn classifier() -> GestureClassifier {
        GestureClassifier::new(PalmThresholds::default())
    }

    #[test]
    fn no_hands_means_stop() {
        let r = classifier().classify(&[]);
        assert_eq!(r.hands_detected, 0);
        assert_eq!(r.gesture_action, GestureAction::Stop);
        assert!(!r.left_palm_open && !r.right_palm_open);
        assert_eq!(r.left_confidence, 0.0);
    }

    #[test]
    fn one_open_hand_scrolls_down() {
        for side in [Handedness::Left, Handedness::Right] {
            let r = classifier().classify(&[make_hand(side, true)]);
            assert_eq!(r.hands_detected, 1);
            assert_eq!(r.gesture_action, GestureAction::ScrollDown);
        }
    }

    #[test]
    fn one_closed_hand_stops() {
        let r = classifier().classify(&[make_hand(Handedness::Right, false)]);
        assert_eq!(r.gesture_action, GestureAction::Stop);
        assert!(!r.right_palm_open);
        assert!(r.right_confidence > MIN_ACTION_CONFIDENCE);
    }

    #[test]
    fn two_open_hands_scroll_up() {
        let r = classifier().classify(&[
            make_hand(Handedness::Left, true),
            make_hand(Handedness::Right, true),
        ]);
        assert_eq!(r.hands_detected, 2);
        assert!(r.left_palm_open && r.right_palm_open);
        assert_eq!(r.gesture_action, GestureAction::ScrollUp);
    }

    #[test]
    fn two_hands_with_any_closed_palm_stop() {
        let c = classifier();
        for (l, rt) in [(true, false), (false, true), (false, false)] {
            let r = c.classify(&[
                make_hand(Handedness::Left, l),
                make_hand(Handedness::Right, rt),
            ]);
            assert_eq!(r.gesture_action, GestureAction::Stop, "left={l} right={rt}");
        }
    }

    #[test]
    fn duplicate_labels_fill_both_slots() {
        let r = classifier().classify(&[
            make_hand(Handedness::Right, true),
            make_hand(Handedness::Right, true),
        ]);
        assert!(r.left_palm_open && r.right_palm_open);
        assert_eq!(r.gesture_action, GestureAction::ScrollUp);
    }

    #[test]
    fn extra_hands_are_ignored() {
        let r = classifier().classify(&[
            make_hand(Handedness::Left, true),
            make_hand(Handedness::Right, true),
            make_hand(Handedness::Left, false),
        ]);
        assert_eq!(r.hands_detected, 2);
        assert_eq!(r.gesture_action, GestureAction::ScrollUp);
    }

    #[test]
    fn extended_but_narrow_hand_is_not_open() {
        let mut hand = make_hand(Handedness::Left, true);
        hand.landmarks[PINKY_TIP] = Landmark { x: 0.45, y: 0.55, z: 0.0 };
        assert!(!classifier().is_palm_open(&hand));
    }

    #[test]
    fn action_and_gesture_map_both_ways() {
        for g in [Gesture::None, Gesture::OnePalm, Gesture::TwoPalms] {
            assert_eq!(g.action().gesture(), g);
        }
    }
}
