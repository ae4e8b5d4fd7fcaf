use crate::processing::PostProcessor;
use crate::{DecodedImage, LabelMap, RawDetection};
use ndarray::ArrayViewD;

#[cfg(feature = "ort-backend")]
pub mod ort;

/// An object detector loaded once per worker and invoked sequentially.
///
/// Implementations own their model state; `infer` takes `&mut self` so a
/// backend never has to be shared across threads.
pub trait Detector {
    /// Run the model on one image and return detections in source pixel space.
    fn infer(&mut self, image: &DecodedImage) -> anyhow::Result<Vec<RawDetection>>;

    /// Class names indexed by `RawDetection::class_index`.
    fn labels(&self) -> &LabelMap;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn infer(&mut self, image: &DecodedImage) -> anyhow::Result<Vec<RawDetection>> {
        (**self).infer(image)
    }

    fn labels(&self) -> &LabelMap {
        (**self).labels()
    }
}

/// Class count of a YOLO head output, checked against the label map.
///
/// A model whose head disagrees with its labels cannot be served, so loaders
/// treat an error here as fatal.
pub(crate) fn check_class_count(
    head: &ArrayViewD<f32>,
    labels: &LabelMap,
) -> anyhow::Result<usize> {
    let num_classes = PostProcessor::num_classes(head)?;
    if num_classes != labels.len() {
        anyhow::bail!(
            "model predicts {} classes but the label map has {} names",
            num_classes,
            labels.len()
        );
    }
    Ok(num_classes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    fn labels(count: usize) -> LabelMap {
        LabelMap::new((0..count).map(|i| format!("class-{}", i))).unwrap()
    }

    #[test]
    fn test_matching_class_count() {
        let head = Array::<f32, _>::zeros(IxDyn(&[1, 4 + 7, 8400]));
        assert_eq!(check_class_count(&head.view(), &labels(7)).unwrap(), 7);
    }

    #[test]
    fn test_mismatched_class_count_is_rejected() {
        let head = Array::<f32, _>::zeros(IxDyn(&[1, 4 + 80, 8400]));
        let err = check_class_count(&head.view(), &labels(7)).unwrap_err();
        assert!(err.to_string().contains("80 classes"));
        assert!(err.to_string().contains("7 names"));
    }

    #[test]
    fn test_malformed_head_is_rejected() {
        let head = Array::<f32, _>::zeros(IxDyn(&[1, 84]));
        assert!(check_class_count(&head.view(), &labels(80)).is_err());
    }
}
