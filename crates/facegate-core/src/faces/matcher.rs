use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::faces::cache::CacheSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
    EuclideanL2,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::EuclideanL2 => "euclidean_l2",
        }
    }

    /// Smaller is closer for every metric.
    pub fn distance(&self, lhs: &[f64], rhs: &[f64]) -> f64 {
        match self {
            DistanceMetric::Cosine => 1.0 - cosine_similarity(lhs, rhs),
            DistanceMetric::Euclidean => euclidean_distance(lhs, rhs),
            DistanceMetric::EuclideanL2 => {
                euclidean_distance(&l2_normalize(lhs), &l2_normalize(rhs))
            }
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "euclidean_l2" | "euclidean-l2" => Ok(DistanceMetric::EuclideanL2),
            other => Err(format!(
                "unknown distance metric '{other}'; expected cosine | euclidean | euclidean_l2"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub identity: Option<String>,
    pub image_id: Option<String>,
    /// Smallest distance seen; `None` when nothing was comparable.
    pub distance: Option<f64>,
    pub threshold: f64,
}

impl MatchResult {
    pub fn no_match(distance: Option<f64>, threshold: f64) -> Self {
        Self {
            identity: None,
            image_id: None,
            distance,
            threshold,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}

/// Scans every cached embedding and reports the closest one within `threshold`.
///
/// Entries are visited in snapshot order (sorted by identity key), and only a
/// strictly smaller distance replaces the current best, so ties go to the
/// lowest key.
pub fn find_best_match(
    probe: &[f64],
    snapshot: &CacheSnapshot,
    metric: DistanceMetric,
    threshold: f64,
) -> MatchResult {
    let mut best: Option<(usize, f64)> = None;

    for (idx, entry) in snapshot.entries.iter().enumerate() {
        if entry.embedding.len() != probe.len() {
            continue;
        }
        let distance = metric.distance(probe, &entry.embedding);
        if distance.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if distance >= current => {}
            _ => best = Some((idx, distance)),
        }
    }

    match best {
        Some((idx, distance)) if distance <= threshold => {
            let entry = &snapshot.entries[idx];
            MatchResult {
                identity: Some(entry.identity.clone()),
                image_id: Some(entry.image_id.clone()),
                distance: Some(distance),
                threshold,
            }
        }
        Some((_, distance)) => MatchResult::no_match(Some(distance), threshold),
        None => MatchResult::no_match(None, threshold),
    }
}

pub fn cosine_similarity(lhs: &[f64], rhs: &[f64]) -> f64 {
    let mut dot = 0.0;
    let mut norm_lhs = 0.0;
    let mut norm_rhs = 0.0;

    for (l, r) in lhs.iter().zip(rhs.iter()) {
        dot += l * r;
        norm_lhs += l * l;
        norm_rhs += r * r;
    }

    let denominator = norm_lhs.sqrt() * norm_rhs.sqrt();
    if denominator <= f64::EPSILON {
        return 0.0;
    }
    dot / denominator
}

pub fn euclidean_distance(lhs: &[f64], rhs: &[f64]) -> f64 {
    lhs.iter()
        .zip(rhs.iter())
        .map(|(l, r)| (l - r) * (l - r))
        .sum::<f64>()
        .sqrt()
}

pub fn l2_normalize(values: &[f64]) -> Vec<f64> {
    let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm <= f64::EPSILON {
        return values.to_vec();
    }
    values.iter().map(|v| v / norm).collect()
}
