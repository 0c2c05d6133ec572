use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::decode::decode_image;
use crate::errors::{AppError, AppResult};
use crate::faces::cache::{artifact_path, CacheOptions, RepresentationCache};
use crate::faces::embedder::{Embedder, EmbedderSettings, FaceEmbedder};
use crate::faces::enrollment::{EnrollmentManager, EnrollmentOutcome};
use crate::faces::matcher::{find_best_match, DistanceMetric, MatchResult};
use crate::faces::store::{FilesystemIdentityStore, IdentityStore};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage_dir: PathBuf,
    pub embedder: EmbedderSettings,
    pub metric: DistanceMetric,
    /// Falls back to the embedder's default for `metric`.
    pub threshold: Option<f64>,
    pub persist_cache: bool,
    pub rebuild_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    pub metric: DistanceMetric,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOutcome {
    pub result: MatchResult,
    /// False when the embedder found no face in the probe.
    pub face_detected: bool,
    /// Number of cached references the probe was compared against.
    pub compared: usize,
}

impl VerifyOutcome {
    pub fn is_match(&self) -> bool {
        self.result.is_match()
    }
}

pub type DefaultIdentityService = IdentityService<FilesystemIdentityStore, Embedder>;

/// Wires the store, cache, matcher and enrollment manager behind `verify` / `enroll`.
pub struct IdentityService<S, E> {
    embedder: Arc<E>,
    cache: Arc<RepresentationCache<S, E>>,
    enrollment: EnrollmentManager<S, E>,
    policy: MatchPolicy,
}

pub fn open_identity_service(config: &ServiceConfig) -> AppResult<DefaultIdentityService> {
    let embedder = Embedder::from_settings(&config.embedder)?;
    let threshold = config
        .threshold
        .unwrap_or_else(|| embedder.kind().default_threshold(config.metric));
    let options = CacheOptions {
        artifact_path: config
            .persist_cache
            .then(|| artifact_path(&config.storage_dir, &embedder.name())),
        rebuild_timeout: config.rebuild_timeout,
    };
    info!(
        storage = %config.storage_dir.display(),
        embedder = %embedder.name(),
        metric = %config.metric,
        threshold,
        "opening identity service"
    );

    Ok(IdentityService::new(
        Arc::new(FilesystemIdentityStore::new(&config.storage_dir)),
        Arc::new(embedder),
        MatchPolicy {
            metric: config.metric,
            threshold,
        },
        options,
    ))
}

impl<S, E> IdentityService<S, E>
where
    S: IdentityStore,
    E: FaceEmbedder,
{
    pub fn new(store: Arc<S>, embedder: Arc<E>, policy: MatchPolicy, options: CacheOptions) -> Self {
        let cache = Arc::new(RepresentationCache::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            options,
        ));
        let enrollment = EnrollmentManager::new(store, Arc::clone(&cache));
        Self {
            embedder,
            cache,
            enrollment,
            policy,
        }
    }

    pub fn verify(&self, image: &[u8]) -> AppResult<VerifyOutcome> {
        let probe_image = decode_image(image)?;
        let probe = match self.embedder.embed(&probe_image) {
            Ok(probe) => probe,
            Err(AppError::NoFaceDetected) => {
                debug!("no face in probe image");
                return Ok(VerifyOutcome {
                    result: MatchResult::no_match(None, self.policy.threshold),
                    face_detected: false,
                    compared: 0,
                });
            }
            Err(err) => return Err(err),
        };

        let snapshot = self.cache.get_or_build()?;
        let result = find_best_match(
            &probe,
            &snapshot,
            self.policy.metric,
            self.policy.threshold,
        );
        match &result.identity {
            Some(identity) => info!(identity, distance = ?result.distance, "verified probe"),
            None => info!(distance = ?result.distance, "probe matched no identity"),
        }

        Ok(VerifyOutcome {
            result,
            face_detected: true,
            compared: snapshot.len(),
        })
    }

    pub fn enroll(&self, identity: &str, image: &[u8]) -> AppResult<EnrollmentOutcome> {
        self.enrollment.enroll(identity, image)
    }

    /// Builds the cache ahead of the first request; failures are only logged.
    pub fn warm_up(&self) {
        match self.cache.get_or_build() {
            Ok(snapshot) => info!(entries = snapshot.len(), "representation cache ready"),
            Err(err) => warn!(error = %err, "failed to warm up representation cache"),
        }
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    pub fn cache(&self) -> &RepresentationCache<S, E> {
        &self.cache
    }
}
