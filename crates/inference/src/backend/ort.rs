use super::{Detector, check_class_count};
use crate::{
    DecodedImage, DetectorConfig, ExecutionProvider, LabelMap, RawDetection,
    processing::{PostProcessor, PreProcessor},
};
use anyhow::Context;
use ndarray::{Array, IxDyn};
use ort::{
    session::{Session, builder::GraphOptimizationLevel},
    value::TensorRef,
};
use std::time::Instant;

const INPUT_NAME: &str = "images";
const NAMES_METADATA_KEY: &str = "names";

/// YOLO detector running on ONNX Runtime.
pub struct OrtDetector {
    session: Session,
    labels: LabelMap,
    preprocessor: PreProcessor,
    postprocessor: PostProcessor,
}

impl OrtDetector {
    /// Load the model, resolve class names and run one warm-up pass that also
    /// checks the head's class count against the label map.
    pub fn load(config: &DetectorConfig) -> anyhow::Result<Self> {
        let started = Instant::now();

        // Initialize ORT environment (idempotent)
        let _ = ort::init().commit();

        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.intra_threads)?;

        match config.execution_provider {
            ExecutionProvider::Cuda => {
                tracing::info!("Initializing ONNX Runtime with CUDA execution provider");
                builder = with_cuda(builder)?;
            }
            ExecutionProvider::Cpu => {
                tracing::info!("Initializing ONNX Runtime with CPU execution provider");
            }
        }

        let session = builder
            .commit_from_file(&config.model_path)
            .with_context(|| format!("failed to load model from {}", config.model_path))?;

        let labels = match &config.labels_path {
            Some(path) => LabelMap::from_file(path)?,
            None => {
                let names = session
                    .metadata()?
                    .custom(NAMES_METADATA_KEY)
                    .with_context(|| {
                        format!(
                            "model {} has no `{}` metadata; set LABELS_PATH",
                            config.model_path, NAMES_METADATA_KEY
                        )
                    })?;
                LabelMap::from_ultralytics_names(&names)?
            }
        };

        let mut detector = Self {
            session,
            labels,
            preprocessor: PreProcessor::new(config.input_size),
            postprocessor: PostProcessor::new(
                config.confidence_threshold,
                config.iou_threshold,
                config.max_detections,
            ),
        };

        let num_classes = detector.warm_up()?;

        tracing::info!(
            model_path = %config.model_path,
            classes = num_classes,
            load_seconds = started.elapsed().as_secs_f64(),
            "Model loaded"
        );

        Ok(detector)
    }

    /// Run a blank image through the model and return its class count,
    /// failing if it disagrees with the label map.
    fn warm_up(&mut self) -> anyhow::Result<usize> {
        let size = self.preprocessor.input_size as usize;
        let input = Array::<f32, _>::zeros(IxDyn(&[1, 3, size, size]));
        let outputs = self.session.run(ort::inputs![
            INPUT_NAME => TensorRef::from_array_view(input.view())?
        ])?;
        let head = outputs[0].try_extract_array::<f32>()?;
        check_class_count(&head, &self.labels)
    }
}

#[cfg(feature = "cuda")]
fn with_cuda(
    builder: ort::session::builder::SessionBuilder,
) -> anyhow::Result<ort::session::builder::SessionBuilder> {
    Ok(builder.with_execution_providers([
        ort::execution_providers::CUDAExecutionProvider::default()
            .with_device_id(0)
            .build()
            .error_on_failure(),
    ])?)
}

#[cfg(not(feature = "cuda"))]
fn with_cuda(
    _builder: ort::session::builder::SessionBuilder,
) -> anyhow::Result<ort::session::builder::SessionBuilder> {
    anyhow::bail!("CUDA execution provider requested but the `cuda` feature is not enabled")
}

impl Detector for OrtDetector {
    fn infer(&mut self, image: &DecodedImage) -> anyhow::Result<Vec<RawDetection>> {
        let (input, transform) = self.preprocessor.preprocess(image)?;

        let outputs = {
            let _infer_span = tracing::info_span!("model_inference").entered();
            self.session.run(ort::inputs![
                INPUT_NAME => TensorRef::from_array_view(input.view())?
            ])?
        };

        let head = outputs[0].try_extract_array::<f32>()?;
        self.postprocessor.parse_detections(&head, &transform)
    }

    fn labels(&self) -> &LabelMap {
        &self.labels
    }
}
