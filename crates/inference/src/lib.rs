pub mod backend;
pub mod config;
pub mod decode;
pub mod detection;
pub mod labels;
pub mod normalize;
pub mod processing;

// Re-export commonly used types for convenience
pub use backend::Detector;
pub use config::{DetectorConfig, ExecutionProvider};
pub use decode::{DecodeError, DecodedImage, decode};
pub use detection::{DetectionRecord, RawDetection};
pub use labels::{LabelError, LabelMap};
pub use normalize::{BAD_RICE_LABELS, NormalizeError, is_bad_label, normalize};

#[cfg(feature = "ort-backend")]
pub use backend::ort::OrtDetector;
