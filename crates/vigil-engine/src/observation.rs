//! Per-frame observation shared by every rule of a stream.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Instant;

use vigil_models::{Detection, ModelId, PoseEstimate, PostureLabel};

/// Class name detectors use for people.
pub const PERSON_CLASS: &str = "person";

/// A tracked person with their debounced posture.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedPerson {
    pub track_id: u64,
    pub label: PostureLabel,
    pub pose: PoseEstimate,
}

/// Model output for one analyzed frame after posture classification.
///
/// Windows hold observations behind an `Arc`, so one allocation serves
/// every rule of the stream.
#[derive(Debug, Clone)]
pub struct Observation {
    pub sequence: u64,
    /// Monotonic time of analysis.
    pub at: Instant,
    pub captured_at: DateTime<Utc>,
    /// Models whose output is present.
    pub models: BTreeSet<ModelId>,
    pub detections: Vec<Detection>,
    pub persons: Vec<TrackedPerson>,
}

impl Observation {
    pub fn new(sequence: u64, at: Instant, captured_at: DateTime<Utc>) -> Self {
        Self {
            sequence,
            at,
            captured_at,
            models: BTreeSet::new(),
            detections: Vec::new(),
            persons: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<ModelId>) -> Self {
        self.models.insert(model.into());
        self
    }

    pub fn with_detections(mut self, detections: Vec<Detection>) -> Self {
        self.detections = detections;
        self
    }

    pub fn with_persons(mut self, persons: Vec<TrackedPerson>) -> Self {
        self.persons = persons;
        self
    }

    /// Whether output of every model in `required` is present.
    pub fn has_models(&self, required: &[ModelId]) -> bool {
        required.iter().all(|m| self.models.contains(m))
    }

    /// Whether an object of `class` was detected at `min_confidence` or above.
    pub fn has_object(&self, class: &str, min_confidence: f64) -> bool {
        self.detections
            .iter()
            .any(|d| d.confidence >= min_confidence && d.class_name.eq_ignore_ascii_case(class))
    }

    /// Number of people: tracked poses if any, otherwise person detections.
    pub fn person_count(&self) -> usize {
        if !self.persons.is_empty() {
            return self.persons.len();
        }
        self.detections
            .iter()
            .filter(|d| d.class_name.eq_ignore_ascii_case(PERSON_CLASS))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_models::BoundingBox;

    fn detection(class: &str, confidence: f64) -> Detection {
        Detection {
            class_name: class.to_string(),
            confidence,
            bbox: BoundingBox { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 },
        }
    }

    #[test]
    fn test_person_count_falls_back_to_detections() {
        let obs = Observation::new(1, Instant::now(), Utc::now())
            .with_detections(vec![detection("person", 0.9), detection("Person", 0.4), detection("chair", 0.9)]);
        assert_eq!(obs.person_count(), 2);
        assert!(obs.has_object("chair", 0.5));
        assert!(!obs.has_object("person", 0.95));
    }

    #[test]
    fn test_has_models() {
        let obs = Observation::new(1, Instant::now(), Utc::now()).with_model("detector");
        assert!(obs.has_models(&[ModelId::from("detector")]));
        assert!(!obs.has_models(&[ModelId::from("detector"), ModelId::from("pose")]));
        assert!(obs.has_models(&[]));
    }
}
