use crate::{DetectionRecord, LabelMap, RawDetection};
use thiserror::Error;

/// Labels that mark an image as containing defective rice.
pub const BAD_RICE_LABELS: [&str; 5] = [
    "Damaged",
    "Discolored",
    "Broken",
    "Chalky",
    "Organic Foreign Matters",
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("class index {index} is outside the label map ({classes} classes)")]
    UnknownClassIndex { index: usize, classes: usize },
}

pub fn is_bad_label(label: &str) -> bool {
    BAD_RICE_LABELS.contains(&label)
}

/// Convert raw detector output into response records and compute the
/// bad-rice verdict.
///
/// Box coordinates are truncated toward zero (`f32 as i32`, saturating, NaN
/// becomes 0) and each axis is re-ordered so `x1 <= x2` and `y1 <= y2`.
/// Every detection is converted even once the verdict is known; the output
/// keeps the input order and length.
pub fn normalize(
    raw: &[RawDetection],
    labels: &LabelMap,
) -> Result<(Vec<DetectionRecord>, bool), NormalizeError> {
    let _s = common::span_debug!("normalize_detections");

    let mut records = Vec::with_capacity(raw.len());
    let mut bad_rice_detected = false;

    for detection in raw {
        let label = labels
            .get(detection.class_index)
            .ok_or(NormalizeError::UnknownClassIndex {
                index: detection.class_index,
                classes: labels.len(),
            })?;

        bad_rice_detected |= is_bad_label(label);

        records.push(DetectionRecord {
            bbox: truncate_box(detection.bbox),
            confidence: detection.confidence,
            label: label.to_string(),
        });
    }

    Ok((records, bad_rice_detected))
}

#[inline]
fn truncate_box([x1, y1, x2, y2]: [f32; 4]) -> [i32; 4] {
    let (x1, x2) = ordered(x1 as i32, x2 as i32);
    let (y1, y2) = ordered(y1 as i32, y2 as i32);
    [x1, y1, x2, y2]
}

#[inline]
fn ordered(a: i32, b: i32) -> (i32, i32) {
    if a <= b { (a, b) } else { (b, a) }
}
