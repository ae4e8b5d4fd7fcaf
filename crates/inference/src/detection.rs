use serde::{Deserialize, Serialize};

/// Detector output in source-image pixel space, before label resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    /// Corner box `[x1, y1, x2, y2]`.
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_index: usize,
}

/// One entry of the `detections` array in a prediction response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    #[serde(rename = "box")]
    pub bbox: [i32; 4],
    pub confidence: f32,
    pub label: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes_box_field_and_short_confidence() {
        let record = DetectionRecord {
            bbox: [10, 10, 50, 50],
            confidence: 0.91,
            label: "Chalky".to_string(),
        };

        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"box":[10,10,50,50],"confidence":0.91,"label":"Chalky"}"#
        );
    }
}
