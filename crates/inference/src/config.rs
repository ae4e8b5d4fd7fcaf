use std::env;

pub const DEFAULT_INPUT_SIZE: u32 = 640;
pub const DEFAULT_MODEL_PATH: &str = "best.onnx";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Cpu,
    Cuda,
}

impl ExecutionProvider {
    fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "cuda" | "gpu" => ExecutionProvider::Cuda,
            _ => ExecutionProvider::Cpu,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub model_path: String,
    /// Plain-text class names, one per line. When unset the names embedded
    /// in the model metadata are used.
    pub labels_path: Option<String>,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub intra_threads: usize,
    pub execution_provider: ExecutionProvider,
}

impl DetectorConfig {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> Self {
        let model_path =
            env::var("MODEL_PATH").unwrap_or_else(|_| DEFAULT_MODEL_PATH.to_string());

        let labels_path = env::var("LABELS_PATH").ok().filter(|s| !s.trim().is_empty());

        let input_size = env::var("INPUT_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&size: &u32| size > 0)
            .unwrap_or(DEFAULT_INPUT_SIZE);

        let confidence_threshold = env::var("CONFIDENCE_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.25);

        let iou_threshold = env::var("IOU_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.7);

        let max_detections = env::var("MAX_DETECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        let intra_threads = env::var("INTRA_THREADS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(1);

        let execution_provider = env::var("EXECUTION_PROVIDER")
            .map(|s| ExecutionProvider::parse(&s))
            .unwrap_or(ExecutionProvider::Cpu);

        Self {
            model_path,
            labels_path,
            input_size,
            confidence_threshold,
            iou_threshold,
            max_detections,
            intra_threads,
            execution_provider,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 8] = [
        "MODEL_PATH",
        "LABELS_PATH",
        "INPUT_SIZE",
        "CONFIDENCE_THRESHOLD",
        "IOU_THRESHOLD",
        "MAX_DETECTIONS",
        "INTRA_THREADS",
        "EXECUTION_PROVIDER",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn test_defaults_when_unset() {
        clear_env();
        let config = DetectorConfig::from_env();
        assert_eq!(config.model_path, "best.onnx");
        assert_eq!(config.labels_path, None);
        assert_eq!(config.input_size, 640);
        assert_eq!(config.confidence_threshold, 0.25);
        assert_eq!(config.iou_threshold, 0.7);
        assert_eq!(config.max_detections, 300);
        assert_eq!(config.intra_threads, 1);
        assert_eq!(config.execution_provider, ExecutionProvider::Cpu);
    }

    #[test]
    #[serial]
    fn test_overrides_and_invalid_values() {
        clear_env();
        unsafe {
            env::set_var("MODEL_PATH", "/srv/rice.onnx");
            env::set_var("LABELS_PATH", "   ");
            env::set_var("INPUT_SIZE", "0");
            env::set_var("CONFIDENCE_THRESHOLD", "0.4");
            env::set_var("MAX_DETECTIONS", "not-a-number");
            env::set_var("EXECUTION_PROVIDER", "CUDA");
        }

        let config = DetectorConfig::from_env();
        assert_eq!(config.model_path, "/srv/rice.onnx");
        assert_eq!(config.labels_path, None, "blank path means unset");
        assert_eq!(config.input_size, 640, "zero input size falls back");
        assert_eq!(config.confidence_threshold, 0.4);
        assert_eq!(config.max_detections, 300);
        assert_eq!(config.execution_provider, ExecutionProvider::Cuda);

        clear_env();
    }
}
