use crate::RawDetection;
use std::cmp::Ordering;

/// Maps boxes from the letterboxed model input back to the source image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformParams {
    pub orig_width: u32,
    pub orig_height: u32,
    pub scale: f32,
    pub offset_x: f32,
    pub offset_y: f32,
}

pub struct PostProcessor {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl PostProcessor {
    pub fn new(confidence_threshold: f32, iou_threshold: f32, max_detections: usize) -> Self {
        Self {
            confidence_threshold,
            iou_threshold,
            max_detections,
        }
    }

    /// Number of classes encoded in a `[1, 4 + C, N]` YOLO head output.
    pub fn num_classes(output: &ndarray::ArrayViewD<f32>) -> anyhow::Result<usize> {
        let shape = output.shape();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            anyhow::bail!(
                "unexpected detector output shape {:?}, expected [1, 4 + classes, anchors]",
                shape
            );
        }
        Ok(shape[1] - 4)
    }

    /// Decode a YOLOv8-style head output into source-space detections.
    ///
    /// `output` is `[1, 4 + C, N]`: cxcywh in input pixels, then class scores.
    /// Output is ordered by descending confidence after class-aware NMS.
    #[tracing::instrument(skip_all, fields(max_detections = self.max_detections))]
    pub fn parse_detections(
        &self,
        output: &ndarray::ArrayViewD<f32>,
        transform: &TransformParams,
    ) -> anyhow::Result<Vec<RawDetection>> {
        let num_classes = Self::num_classes(output)?;
        let num_anchors = output.shape()[2];

        let mut candidates = Vec::new();

        for i in 0..num_anchors {
            let mut best_score = f32::NEG_INFINITY;
            let mut class_index = 0usize;
            for c in 0..num_classes {
                let score = output[[0, 4 + c, i]];
                if score > best_score {
                    best_score = score;
                    class_index = c;
                }
            }

            if !(best_score >= self.confidence_threshold) {
                continue;
            }

            let cx = output[[0, 0, i]];
            let cy = output[[0, 1, i]];
            let w = output[[0, 2, i]];
            let h = output[[0, 3, i]];

            candidates.push(RawDetection {
                bbox: cxcywh_to_xyxy(cx, cy, w, h),
                confidence: best_score,
                class_index,
            });
        }

        let kept = non_max_suppression(candidates, self.iou_threshold, self.max_detections);

        Ok(kept
            .into_iter()
            .map(|d| RawDetection {
                bbox: unletterbox(d.bbox, transform),
                ..d
            })
            .collect())
    }
}

/// Greedy per-class NMS. Input order does not matter.
fn non_max_suppression(
    mut candidates: Vec<RawDetection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut kept: Vec<RawDetection> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept.iter().any(|k| {
            k.class_index == candidate.class_index && iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[inline]
fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Convert bounding box from center-width-height format to corner format
#[inline]
fn cxcywh_to_xyxy(cx: f32, cy: f32, w: f32, h: f32) -> [f32; 4] {
    [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
}

#[inline]
fn unletterbox([x1, y1, x2, y2]: [f32; 4], t: &TransformParams) -> [f32; 4] {
    let w = t.orig_width as f32;
    let h = t.orig_height as f32;
    [
        ((x1 - t.offset_x) / t.scale).clamp(0.0, w),
        ((y1 - t.offset_y) / t.scale).clamp(0.0, h),
        ((x2 - t.offset_x) / t.scale).clamp(0.0, w),
        ((y2 - t.offset_y) / t.scale).clamp(0.0, h),
    ]
}
