use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};
use crate::faces::matcher::DistanceMetric;

pub const DEFAULT_THUMBNAIL_SIDE: u32 = 32;

/// Turns a decoded image into a fixed-length face embedding.
pub trait FaceEmbedder: Send + Sync {
    /// Identifies the model; embeddings from different names are not comparable.
    fn name(&self) -> String;
    fn embed(&self, image: &RgbImage) -> AppResult<Vec<f64>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedderKind {
    Thumbnail,
    Dlib,
}

impl EmbedderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbedderKind::Thumbnail => "thumbnail",
            EmbedderKind::Dlib => "dlib",
        }
    }

    /// Distance at or below which two faces are considered the same person.
    pub fn default_threshold(&self, metric: DistanceMetric) -> f64 {
        match (self, metric) {
            (EmbedderKind::Thumbnail, DistanceMetric::Cosine) => 0.15,
            (EmbedderKind::Thumbnail, DistanceMetric::Euclidean) => 0.55,
            (EmbedderKind::Thumbnail, DistanceMetric::EuclideanL2) => 0.55,
            (EmbedderKind::Dlib, DistanceMetric::Cosine) => 0.07,
            (EmbedderKind::Dlib, DistanceMetric::Euclidean) => 0.6,
            (EmbedderKind::Dlib, DistanceMetric::EuclideanL2) => 0.4,
        }
    }
}

impl fmt::Display for EmbedderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbedderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "thumbnail" => Ok(EmbedderKind::Thumbnail),
            "dlib" => Ok(EmbedderKind::Dlib),
            other => Err(format!(
                "unknown embedder '{other}'; expected thumbnail | dlib"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbedderSettings {
    pub kind: EmbedderKind,
    pub enforce_detection: bool,
    pub landmark_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
    pub jitters: u32,
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        Self {
            kind: EmbedderKind::Thumbnail,
            enforce_detection: false,
            landmark_model: None,
            encoder_model: None,
            jitters: 1,
        }
    }
}

/// Grey-scale thumbnail, mean-centred and L2-normalised.
///
/// Cheap and deterministic; it recognises near-identical frames rather than
/// people, which is what tests and local development need.
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailEmbedder {
    side: u32,
}

impl ThumbnailEmbedder {
    pub fn new(side: u32) -> Self {
        Self { side: side.max(1) }
    }
}

impl Default for ThumbnailEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_THUMBNAIL_SIDE)
    }
}

impl FaceEmbedder for ThumbnailEmbedder {
    fn name(&self) -> String {
        format!("thumbnail-{}", self.side)
    }

    fn embed(&self, image: &RgbImage) -> AppResult<Vec<f64>> {
        let gray = imageops::grayscale(image);
        let small = imageops::resize(&gray, self.side, self.side, FilterType::Triangle);
        let mut values: Vec<f64> = small.pixels().map(|pixel| f64::from(pixel[0])).collect();

        let mean = values.iter().sum::<f64>() / values.len() as f64;
        for value in values.iter_mut() {
            *value -= mean;
        }
        let norm = values.iter().map(|value| value * value).sum::<f64>().sqrt();
        // A flat frame carries no structure to compare.
        if norm <= f64::EPSILON {
            return Err(AppError::NoFaceDetected);
        }
        for value in values.iter_mut() {
            *value /= norm;
        }
        Ok(values)
    }
}

/// Settings that change the produced embeddings are part of the dlib name.
pub fn dlib_embedder_name(jitters: u32, enforce_detection: bool) -> String {
    let detection = if enforce_detection { "strict" } else { "lenient" };
    format!("dlib-resnet-j{jitters}-{detection}")
}

#[cfg(feature = "dlib")]
pub use self::dlib::{DlibEmbedder, EnvModelPathResolver, FaceModelPaths, ModelPathResolver};

#[cfg(feature = "dlib")]
mod dlib {
    use std::env;
    use std::path::PathBuf;

    use dlib_face_recognition::{
        FaceDetector, FaceDetectorTrait, FaceEncoderNetwork, FaceEncoderTrait, ImageMatrix,
        LandmarkPredictor, LandmarkPredictorTrait, Rectangle,
    };
    use image::RgbImage;
    use parking_lot::Mutex;
    use tracing::debug;

    use super::{EmbedderSettings, FaceEmbedder};
    use crate::errors::{AppError, AppResult};

    const LANDMARK_ENV: &str = "DLIB_LANDMARK_MODEL";
    const ENCODER_ENV: &str = "DLIB_ENCODER_MODEL";

    #[derive(Debug, Clone)]
    pub struct FaceModelPaths {
        pub landmark: PathBuf,
        pub encoder: PathBuf,
    }

    pub trait ModelPathResolver {
        fn resolve(&self, settings: &EmbedderSettings) -> AppResult<FaceModelPaths>;
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct EnvModelPathResolver;

    impl ModelPathResolver for EnvModelPathResolver {
        fn resolve(&self, settings: &EmbedderSettings) -> AppResult<FaceModelPaths> {
            let landmark = settings
                .landmark_model
                .clone()
                .or_else(|| env::var(LANDMARK_ENV).ok().map(PathBuf::from))
                .ok_or(AppError::MissingModel {
                    kind: "landmark predictor",
                    key: "landmark_model",
                    env: LANDMARK_ENV,
                })?;

            let encoder = settings
                .encoder_model
                .clone()
                .or_else(|| env::var(ENCODER_ENV).ok().map(PathBuf::from))
                .ok_or(AppError::MissingModel {
                    kind: "face encoding network",
                    key: "encoder_model",
                    env: ENCODER_ENV,
                })?;

            Ok(FaceModelPaths { landmark, encoder })
        }
    }

    struct DlibModels {
        detector: FaceDetector,
        predictor: LandmarkPredictor,
        encoder: FaceEncoderNetwork,
    }

    pub struct DlibEmbedder {
        models: Mutex<DlibModels>,
        jitters: u32,
        enforce_detection: bool,
    }

    impl DlibEmbedder {
        pub fn new(models: &FaceModelPaths, settings: &EmbedderSettings) -> AppResult<Self> {
            debug!(path = %models.landmark.display(), "loading landmark model");
            let predictor =
                LandmarkPredictor::open(&models.landmark).map_err(|message| AppError::ModelLoad {
                    path: models.landmark.clone(),
                    message,
                })?;
            debug!(path = %models.encoder.display(), "loading encoder model");
            let encoder = FaceEncoderNetwork::open(&models.encoder).map_err(|message| {
                AppError::ModelLoad {
                    path: models.encoder.clone(),
                    message,
                }
            })?;
            let detector = FaceDetector::new();

            Ok(Self {
                models: Mutex::new(DlibModels {
                    detector,
                    predictor,
                    encoder,
                }),
                jitters: settings.jitters,
                enforce_detection: settings.enforce_detection,
            })
        }

        pub fn from_settings(settings: &EmbedderSettings) -> AppResult<Self> {
            let models = EnvModelPathResolver.resolve(settings)?;
            Self::new(&models, settings)
        }
    }

    fn area(rect: &Rectangle) -> i64 {
        (rect.right - rect.left).max(0) * (rect.bottom - rect.top).max(0)
    }

    impl FaceEmbedder for DlibEmbedder {
        fn name(&self) -> String {
            super::dlib_embedder_name(self.jitters, self.enforce_detection)
        }

        fn embed(&self, image: &RgbImage) -> AppResult<Vec<f64>> {
            let matrix = ImageMatrix::from_image(image);
            let models = self.models.lock();
            let locations = models.detector.face_locations(&matrix);

            let face = match locations.iter().max_by_key(|rect| area(rect)) {
                Some(rect) => Rectangle {
                    left: rect.left,
                    top: rect.top,
                    right: rect.right,
                    bottom: rect.bottom,
                },
                None if self.enforce_detection => return Err(AppError::NoFaceDetected),
                None => {
                    debug!("no face located; encoding the whole frame");
                    Rectangle {
                        left: 0,
                        top: 0,
                        right: i64::from(image.width()) - 1,
                        bottom: i64::from(image.height()) - 1,
                    }
                }
            };

            let landmarks = vec![models.predictor.face_landmarks(&matrix, &face)];
            let encodings = models
                .encoder
                .get_face_encodings(&matrix, &landmarks, self.jitters);
            let embedding = encodings
                .iter()
                .next()
                .map(|encoding| encoding.as_ref().to_vec())
                .ok_or(AppError::NoFaceDetected)?;
            Ok(embedding)
        }
    }
}

/// The configured backend.
pub enum Embedder {
    Thumbnail(ThumbnailEmbedder),
    #[cfg(feature = "dlib")]
    Dlib(DlibEmbedder),
}

impl Embedder {
    pub fn from_settings(settings: &EmbedderSettings) -> AppResult<Self> {
        match settings.kind {
            EmbedderKind::Thumbnail => Ok(Embedder::Thumbnail(ThumbnailEmbedder::default())),
            #[cfg(feature = "dlib")]
            EmbedderKind::Dlib => Ok(Embedder::Dlib(DlibEmbedder::from_settings(settings)?)),
            #[cfg(not(feature = "dlib"))]
            EmbedderKind::Dlib => Err(AppError::EmbedderUnavailable {
                embedder: settings.kind.to_string(),
            }),
        }
    }

    pub fn kind(&self) -> EmbedderKind {
        match self {
            Embedder::Thumbnail(_) => EmbedderKind::Thumbnail,
            #[cfg(feature = "dlib")]
            Embedder::Dlib(_) => EmbedderKind::Dlib,
        }
    }
}

impl FaceEmbedder for Embedder {
    fn name(&self) -> String {
        match self {
            Embedder::Thumbnail(inner) => inner.name(),
            #[cfg(feature = "dlib")]
            Embedder::Dlib(inner) => inner.name(),
        }
    }

    fn embed(&self, image: &RgbImage) -> AppResult<Vec<f64>> {
        match self {
            Embedder::Thumbnail(inner) => inner.embed(image),
            #[cfg(feature = "dlib")]
            Embedder::Dlib(inner) => inner.embed(image),
        }
    }
}
