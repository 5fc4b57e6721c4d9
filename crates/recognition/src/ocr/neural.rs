/// Neural plate OCR on ONNX Runtime
///
/// A CRNN-style recognizer reads a fixed-size grayscale crop and emits one
/// probability row per timestep; the rows are collapsed with greedy CTC
/// decoding. The same model runs on the CPU provider and, when requested, on
/// CUDA / TensorRT.
use super::{OcrEngine, RecognitionHints};
use crate::config::NeuralEngineConfig;
use crate::error::RecognitionError;
use anyhow::{Context, Result};
use common::plates::{OcrEngineKind, OcrResult};
use image::DynamicImage;
use ndarray::{Array, ArrayD, IxDyn};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider,
        TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, builder::SessionBuilder, Session},
    value::Value,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use telemetry::metrics::LPR_OCR_INFERENCE_TIME;

/// One loaded recognizer session
struct OnnxRecognizer {
    session: Mutex<Session>,
    provider: String,
    input_width: u32,
    input_height: u32,
    vocab: Vec<char>,
}

impl OnnxRecognizer {
    fn load(config: &NeuralEngineConfig, provider_preference: &str) -> Result<Self> {
        if !Path::new(&config.model_path).exists() {
            anyhow::bail!("model file {} not found", config.model_path);
        }

        let (session, provider) = create_session(config, provider_preference)?;
        tracing::info!(
            model = %config.model_path,
            provider = %provider,
            device = config.device_id,
            "initialized OCR recognizer"
        );

        Ok(Self {
            session: Mutex::new(session),
            provider,
            input_width: config.input_width,
            input_height: config.input_height,
            vocab: config.char_vocab.chars().collect(),
        })
    }

    /// Resize to the model input and convert to NCHW in [0, 1]
    fn preprocess(&self, img: &DynamicImage) -> Array<f32, IxDyn> {
        let width = self.input_width;
        let height = self.input_height;
        let gray = img
            .resize_exact(width, height, image::imageops::FilterType::Triangle)
            .to_luma8();

        let mut input = Array::zeros(IxDyn(&[1, 1, height as usize, width as usize]));
        for (x, y, pixel) in gray.enumerate_pixels() {
            input[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        }
        input
    }

    fn run(&self, img: &DynamicImage, kind: OcrEngineKind) -> Result<(String, f32)> {
        let input_tensor = Value::from_array(self.preprocess(img))?;

        let started = Instant::now();
        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to lock OCR session: {}", e))?;
        let outputs = session.run(ort::inputs![input_tensor])?;

        // Exported recognizers disagree on the output name
        let output_value = outputs
            .get("output")
            .or_else(|| outputs.get("output0"))
            .or_else(|| outputs.get("logits"))
            .context("No OCR output tensor found (tried: output, output0, logits)")?;
        let (shape, data) = output_value.try_extract_tensor::<f32>()?;

        let shape_usize: Vec<usize> = shape.as_ref().iter().map(|&x| x as usize).collect();
        let output = Array::from_shape_vec(IxDyn(&shape_usize), data.to_vec())?;

        LPR_OCR_INFERENCE_TIME
            .with_label_values(&[kind.as_str(), &self.provider])
            .observe(started.elapsed().as_secs_f64());

        ctc_decode(&output, &self.vocab)
    }
}

fn session_builder(config: &NeuralEngineConfig) -> Result<SessionBuilder> {
    Session::builder()
        .context("Failed to create session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("Failed to set optimization level")?
        .with_intra_threads(config.intra_threads)
        .context("Failed to set intra threads")?
        .with_inter_threads(config.inter_threads)
        .context("Failed to set inter threads")
}

/// Session on the preferred provider, degrading TensorRT -> CUDA -> CPU
fn create_session(config: &NeuralEngineConfig, preference: &str) -> Result<(Session, String)> {
    let model_path = config.model_path.as_str();
    match preference.to_uppercase().as_str() {
        "TENSORRT" => {
            tracing::info!("Attempting TensorRT for {}", model_path);
            let result = session_builder(config)?
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                    CPUExecutionProvider::default().build(),
                ])
                .context("Failed to set execution providers")?
                .commit_from_file(model_path);

            match result {
                Ok(session) => Ok((session, "TensorRT".to_string())),
                Err(e) => {
                    tracing::warn!("TensorRT failed, trying CUDA: {}", e);
                    try_cuda(config)
                }
            }
        }
        "CUDA" => try_cuda(config),
        _ => try_cpu(config),
    }
}

fn try_cuda(config: &NeuralEngineConfig) -> Result<(Session, String)> {
    let model_path = config.model_path.as_str();
    tracing::info!("Attempting CUDA for {}", model_path);
    let result = session_builder(config)?
        .with_execution_providers([
            CUDAExecutionProvider::default()
                .with_device_id(config.device_id)
                .build(),
            CPUExecutionProvider::default().build(),
        ])
        .context("Failed to set execution providers")?
        .commit_from_file(model_path);

    match result {
        Ok(session) => Ok((session, "CUDA".to_string())),
        Err(e) => {
            tracing::warn!("CUDA failed, using CPU: {}", e);
            try_cpu(config)
        }
    }
}

fn try_cpu(config: &NeuralEngineConfig) -> Result<(Session, String)> {
    tracing::info!("Using CPU for {}", config.model_path);
    let session = session_builder(config)?
        .commit_from_file(&config.model_path)
        .context("Failed to load model from file")?;
    Ok((session, "CPU".to_string()))
}

fn accelerator_present(preference: &str) -> bool {
    let cuda = CUDAExecutionProvider::default().is_available().unwrap_or(false);
    match preference.to_uppercase().as_str() {
        "TENSORRT" => {
            TensorRTExecutionProvider::default()
                .is_available()
                .unwrap_or(false)
                || cuda
        }
        "CUDA" => cuda,
        _ => false,
    }
}

/// Greedy CTC decoding of a `[batch, timesteps, classes]` output.
///
/// Class 0 is the blank; class `i > 0` maps to `vocab[i - 1]`. Returns the
/// text and the mean probability of the emitted characters. Rows that are
/// not probability distributions are treated as logits and softmaxed.
pub fn ctc_decode(output: &ArrayD<f32>, vocab: &[char]) -> Result<(String, f32)> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] == 0 {
        anyhow::bail!("unexpected OCR output shape {:?}", shape);
    }
    let (sequence_length, classes) = (shape[1], shape[2]);
    if classes == 0 {
        return Ok((String::new(), 0.0));
    }

    let is_logits = output.iter().any(|&v| !(0.0..=1.0).contains(&v));

    let mut text = String::new();
    let mut probabilities = Vec::new();
    let mut prev_idx = 0usize;

    for t in 0..sequence_length {
        let row: Vec<f32> = (0..classes).map(|c| output[[0, t, c]]).collect();
        let row = if is_logits { softmax(&row) } else { row };

        let (max_idx, max_prob) = row
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        if max_idx > 0 && max_idx != prev_idx {
            if let Some(&ch) = vocab.get(max_idx - 1) {
                text.push(ch);
                probabilities.push(max_prob);
            }
        }
        prev_idx = max_idx;
    }

    let confidence = if probabilities.is_empty() {
        0.0
    } else {
        probabilities.iter().sum::<f32>() / probabilities.len() as f32
    };
    Ok((text, confidence.clamp(0.0, 1.0)))
}

fn softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::MIN, f32::max);
    let exps: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// CTC recognizer on the CPU execution provider
pub struct NeuralOcrEngine {
    recognizer: OnnxRecognizer,
}

impl NeuralOcrEngine {
    pub fn new(config: &NeuralEngineConfig) -> Result<Self, RecognitionError> {
        let recognizer = OnnxRecognizer::load(config, "CPU")
            .map_err(|e| RecognitionError::unavailable(OcrEngineKind::Neural.as_str(), e))?;
        Ok(Self { recognizer })
    }
}

impl OcrEngine for NeuralOcrEngine {
    fn kind(&self) -> OcrEngineKind {
        OcrEngineKind::Neural
    }

    fn recognize(
        &self,
        image: &DynamicImage,
        _hints: &RecognitionHints,
    ) -> Result<OcrResult, RecognitionError> {
        let (text, confidence) = self
            .recognizer
            .run(image, self.kind())
            .map_err(|e| RecognitionError::inference(self.kind().as_str(), e))?;
        Ok(OcrResult {
            text,
            confidence,
            engine: self.kind(),
        })
    }
}

/// The same recognizer on CUDA / TensorRT, degrading to the CPU engine
/// whenever accelerated inference fails.
pub struct AcceleratedOcrEngine {
    recognizer: OnnxRecognizer,
    fallback: Option<Arc<NeuralOcrEngine>>,
}

impl AcceleratedOcrEngine {
    pub fn new(
        config: &NeuralEngineConfig,
        fallback: Option<Arc<NeuralOcrEngine>>,
    ) -> Result<Self, RecognitionError> {
        let kind = OcrEngineKind::Accelerated.as_str();
        if !accelerator_present(&config.execution_provider) {
            return Err(RecognitionError::unavailable(
                kind,
                format!("no {} device available", config.execution_provider),
            ));
        }

        let recognizer = OnnxRecognizer::load(config, &config.execution_provider)
            .map_err(|e| RecognitionError::unavailable(kind, e))?;
        if recognizer.provider == "CPU" {
            return Err(RecognitionError::unavailable(
                kind,
                "accelerated providers failed to initialize",
            ));
        }
        Ok(Self {
            recognizer,
            fallback,
        })
    }

    pub fn execution_provider(&self) -> &str {
        &self.recognizer.provider
    }
}

impl OcrEngine for AcceleratedOcrEngine {
    fn kind(&self) -> OcrEngineKind {
        OcrEngineKind::Accelerated
    }

    fn recognize(
        &self,
        image: &DynamicImage,
        hints: &RecognitionHints,
    ) -> Result<OcrResult, RecognitionError> {
        match self.recognizer.run(image, self.kind()) {
            Ok((text, confidence)) => Ok(OcrResult {
                text,
                confidence,
                engine: self.kind(),
            }),
            Err(e) => match &self.fallback {
                Some(cpu) => {
                    tracing::warn!(
                        provider = %self.recognizer.provider,
                        error = %e,
                        "accelerated inference failed, retrying on CPU"
                    );
                    cpu.recognize(image, hints)
                }
                None => Err(RecognitionError::inference(self.kind().as_str(), e)),
            },
        }
    }
}
