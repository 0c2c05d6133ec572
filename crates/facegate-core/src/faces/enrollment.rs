use std::path::PathBuf;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::info;

use crate::decode::{decode_image, encode_png};
use crate::errors::{AppError, AppResult};
use crate::faces::cache::RepresentationCache;
use crate::faces::embedder::FaceEmbedder;
use crate::faces::store::IdentityStore;

const MAX_IDENTITY_BYTES: usize = 254;

#[derive(Debug, Clone)]
pub struct EnrollmentOutcome {
    pub identity: String,
    pub image_id: String,
    /// Location of the written reference, for stores backed by a directory.
    pub stored_path: Option<PathBuf>,
    pub created_at: String,
    pub logs: Vec<String>,
}

/// Sole writer of the identity store and sole caller of cache invalidation.
pub struct EnrollmentManager<S, E> {
    store: Arc<S>,
    cache: Arc<RepresentationCache<S, E>>,
}

impl<S, E> EnrollmentManager<S, E>
where
    S: IdentityStore,
    E: FaceEmbedder,
{
    pub fn new(store: Arc<S>, cache: Arc<RepresentationCache<S, E>>) -> Self {
        Self { store, cache }
    }

    pub fn enroll(&self, identity: &str, image: &[u8]) -> AppResult<EnrollmentOutcome> {
        validate_identity_key(identity)?;

        let mut logs = Vec::new();
        let decoded = decode_image(image)?;
        logs.push(format!(
            "Decoded {}x{} reference image for {}",
            decoded.width(),
            decoded.height(),
            identity
        ));
        let canonical = encode_png(&decoded)?;

        let image_id = match self.store.put_reference(identity, &canonical) {
            Ok(image_id) => image_id,
            Err(err) => {
                // The write may have landed before the failure was reported.
                self.cache.invalidate();
                return Err(err);
            }
        };
        let stored_path = self
            .store
            .root()
            .map(|root| root.join(identity).join(&image_id));
        match &stored_path {
            Some(path) => logs.push(format!("Stored reference at {}", path.display())),
            None => logs.push(format!("Stored reference {image_id}")),
        }

        self.cache.invalidate();
        logs.push("Invalidated representation cache".to_string());
        info!(identity, image = %image_id, "enrolled identity");

        Ok(EnrollmentOutcome {
            identity: identity.to_string(),
            image_id,
            stored_path,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            logs,
        })
    }
}

/// Identity keys double as directory names.
pub fn validate_identity_key(identity: &str) -> AppResult<()> {
    let reject = |message: &str| {
        Err(AppError::InvalidIdentity {
            identity: identity.to_string(),
            message: message.to_string(),
        })
    };

    if identity.is_empty() {
        return reject("identity cannot be empty");
    }
    if identity.len() > MAX_IDENTITY_BYTES {
        return reject("identity is longer than 254 bytes");
    }
    if identity.starts_with('.') {
        return reject("identity cannot start with '.'");
    }
    if identity.contains("..") {
        return reject("identity cannot contain '..'");
    }
    if identity.contains(['/', '\\']) {
        return reject("identity cannot contain path separators");
    }
    if identity
        .chars()
        .any(|ch| ch.is_control() || ch.is_whitespace())
    {
        return reject("identity cannot contain whitespace or control characters");
    }

    Ok(())
}
