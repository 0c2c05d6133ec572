pub mod cache;
pub mod embedder;
pub mod enrollment;
pub mod matcher;
pub mod service;
pub mod store;

pub use cache::{
    artifact_path, read_artifact, write_artifact, CacheEntry, CacheOptions, CacheSnapshot,
    ReferenceFingerprint, RepresentationCache,
};

#[cfg(feature = "dlib")]
pub use embedder::{DlibEmbedder, EnvModelPathResolver, FaceModelPaths, ModelPathResolver};
pub use embedder::{
    dlib_embedder_name, Embedder, EmbedderKind, EmbedderSettings, FaceEmbedder,
    ThumbnailEmbedder, DEFAULT_THUMBNAIL_SIDE,
};

pub use enrollment::{validate_identity_key, EnrollmentManager, EnrollmentOutcome};

pub use matcher::{
    cosine_similarity, euclidean_distance, find_best_match, l2_normalize, DistanceMetric,
    MatchResult,
};

pub use service::{
    open_identity_service, DefaultIdentityService, IdentityService, MatchPolicy, ServiceConfig,
    VerifyOutcome,
};

pub use store::{
    EnvStoreDirResolver, FilesystemIdentityStore, IdentityStore, InMemoryIdentityStore,
    ReferenceIter, StoreDirResolver, StoredReference, CANONICAL_REFERENCE, DEFAULT_STORE_DIR,
    STORE_DIR_ENV,
};
