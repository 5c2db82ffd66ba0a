//! Warming Predictor
//!
//! Groups historical accesses with a small k-means model over standardized
//! features `(hour, weekday, distinct keys accessed, preference count)`. The
//! cluster holding the most samples is the "active" cluster; users whose
//! feature vector at the current time lands in it are predicted to be active
//! soon and get warmed.
//!
//! Predictions are heuristic. The only guarantees are that training and
//! prediction do not fail on well-formed input and that the predicted set
//! is bounded.

use chrono::{DateTime, Datelike, Timelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::patterns::{AccessPattern, AccessPatternTracker};
use crate::error::{Error, Result};

/// Feature vector width
pub const FEATURES: usize = 4;

/// Upper bound on k-means iterations
const MAX_ITERATIONS: usize = 50;

type Features = [f64; FEATURES];

/// A trained model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorModel {
    pub means: Features,
    pub stds: Features,
    pub centroids: Vec<Features>,
    pub cluster_sizes: Vec<usize>,
    pub active_cluster: usize,
    pub samples: usize,
    pub users: usize,
    pub trained_at: DateTime<Utc>,
}

impl PredictorModel {
    fn scale(&self, raw: &Features) -> Features {
        let mut scaled = [0.0; FEATURES];
        for i in 0..FEATURES {
            scaled[i] = (raw[i] - self.means[i]) / self.stds[i];
        }
        scaled
    }

    fn nearest(&self, point: &Features) -> usize {
        nearest_centroid(&self.centroids, point)
    }
}

/// Feature vector for one access by one user
fn features(at: DateTime<Utc>, pattern: &AccessPattern) -> Features {
    [
        at.hour() as f64,
        at.weekday().num_days_from_monday() as f64,
        pattern.accessed_keys.len() as f64,
        pattern.preferences.len() as f64,
    ]
}

fn distance_sq(a: &Features, b: &Features) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest_centroid(centroids: &[Features], point: &Features) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (c, centroid) in centroids.iter().enumerate() {
        let distance = distance_sq(point, centroid);
        if distance < best_distance {
            best_distance = distance;
            best = c;
        }
    }
    best
}

/// Per-column mean and standard deviation; a zero deviation becomes 1
fn standardize(samples: &[Features]) -> (Features, Features) {
    let n = samples.len() as f64;
    let mut means = [0.0; FEATURES];
    let mut stds = [0.0; FEATURES];

    for sample in samples {
        for i in 0..FEATURES {
            means[i] += sample[i];
        }
    }
    for mean in &mut means {
        *mean /= n;
    }

    for sample in samples {
        for i in 0..FEATURES {
            stds[i] += (sample[i] - means[i]).powi(2);
        }
    }
    for std in &mut stds {
        *std = (*std / n).sqrt();
        if *std == 0.0 || !std.is_finite() {
            *std = 1.0;
        }
    }
    (means, stds)
}

/// Deterministic k-means: farthest-point seeding from the first sample
fn kmeans(points: &[Features], k: usize) -> (Vec<Features>, Vec<usize>) {
    let k = k.min(points.len()).max(1);

    let mut centroids = vec![points[0]];
    while centroids.len() < k {
        let mut far_index = 0;
        let mut far_distance = -1.0;
        for (i, point) in points.iter().enumerate() {
            let distance = distance_sq(point, &centroids[nearest_centroid(&centroids, point)]);
            if distance > far_distance {
                far_distance = distance;
                far_index = i;
            }
        }
        centroids.push(points[far_index]);
    }

    let mut assignments = vec![usize::MAX; points.len()];
    for _ in 0..MAX_ITERATIONS {
        let mut changed = false;
        for (i, point) in points.iter().enumerate() {
            let cluster = nearest_centroid(&centroids, point);
            if assignments[i] != cluster {
                assignments[i] = cluster;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        for (c, centroid) in centroids.iter_mut().enumerate() {
            let mut sum = [0.0; FEATURES];
            let mut count = 0usize;
            for (point, _) in points.iter().zip(&assignments).filter(|(_, a)| **a == c) {
                for i in 0..FEATURES {
                    sum[i] += point[i];
                }
                count += 1;
            }
            // Empty clusters keep their previous centroid
            if count > 0 {
                for i in 0..FEATURES {
                    centroid[i] = sum[i] / count as f64;
                }
            }
        }
    }

    let mut sizes = vec![0usize; centroids.len()];
    for cluster in assignments {
        sizes[cluster] += 1;
    }
    (centroids, sizes)
}

/// Clustering-based predictor of soon-active users
pub struct WarmingPredictor {
    model: RwLock<Option<PredictorModel>>,
    clusters: usize,
    min_training_users: usize,
    max_predicted_users: usize,
}

impl WarmingPredictor {
    pub fn new(clusters: usize, min_training_users: usize, max_predicted_users: usize) -> Self {
        Self {
            model: RwLock::new(None),
            clusters: clusters.max(1),
            min_training_users: min_training_users.max(1),
            max_predicted_users,
        }
    }

    /// Fit a fresh model. On error the previous model, if any, stays in place.
    pub fn train(&self, tracker: &AccessPatternTracker, now: DateTime<Utc>) -> Result<PredictorModel> {
        let patterns = tracker.snapshot();
        if patterns.len() < self.min_training_users {
            return Err(Error::Training(format!(
                "{} users tracked, {} required",
                patterns.len(),
                self.min_training_users
            )));
        }

        let samples: Vec<Features> = patterns
            .iter()
            .flat_map(|pattern| pattern.accesses.iter().map(move |at| features(*at, pattern)))
            .collect();
        if samples.is_empty() {
            return Err(Error::Training("no access samples".into()));
        }

        let (means, stds) = standardize(&samples);
        let scaled: Vec<Features> = samples
            .iter()
            .map(|sample| {
                let mut out = [0.0; FEATURES];
                for i in 0..FEATURES {
                    out[i] = (sample[i] - means[i]) / stds[i];
                }
                out
            })
            .collect();
        if scaled.iter().flatten().any(|value| !value.is_finite()) {
            return Err(Error::Training("non-finite feature value".into()));
        }

        let (centroids, cluster_sizes) = kmeans(&scaled, self.clusters);
        let active_cluster = cluster_sizes
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
            .map(|(index, _)| index)
            .unwrap_or(0);

        let model = PredictorModel {
            means,
            stds,
            centroids,
            cluster_sizes,
            active_cluster,
            samples: samples.len(),
            users: patterns.len(),
            trained_at: now,
        };

        info!(
            users = model.users,
            samples = model.samples,
            active_cluster,
            sizes = ?model.cluster_sizes,
            "Warming predictor trained"
        );
        *self.model.write() = Some(model.clone());
        Ok(model)
    }

    /// Users predicted active at `now`, at most `max_predicted_users`, in
    /// user-id order. Empty before the first successful training.
    pub fn predict(&self, tracker: &AccessPatternTracker, now: DateTime<Utc>) -> Vec<String> {
        let model = self.model.read();
        let Some(model) = model.as_ref() else {
            return Vec::new();
        };

        let predicted: Vec<String> = tracker
            .snapshot()
            .into_iter()
            .filter(|pattern| model.nearest(&model.scale(&features(now, pattern))) == model.active_cluster)
            .map(|pattern| pattern.user_id)
            .take(self.max_predicted_users)
            .collect();

        debug!(predicted = predicted.len(), "Warming prediction pass");
        predicted
    }

    pub fn is_trained(&self) -> bool {
        self.model.read().is_some()
    }

    pub fn model(&self) -> Option<PredictorModel> {
        self.model.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, hour, minute, 0).unwrap()
    }

    fn populated_tracker(users: usize) -> AccessPatternTracker {
        let tracker = AccessPatternTracker::new(100, 30);
        for u in 0..users {
            let user = format!("user-{u:02}");
            // Two groups: morning users with few keys, evening users with many
            let (hour, keys) = if u % 3 == 0 { (20, 6) } else { (9, 1) };
            for minute in 0..5 {
                tracker.record_access(&user, at(hour, minute * 10), None);
            }
            for k in 0..keys {
                tracker.record_access(&user, at(hour, 55), Some(&format!("k{k}")));
            }
            tracker.set_preferences(&user, vec!["remote".into(); (u % 4) + 1]);
        }
        tracker
    }

    #[test]
    fn test_standardize_handles_constant_columns() {
        let samples = vec![[1.0, 2.0, 3.0, 4.0], [3.0, 2.0, 3.0, 4.0]];
        let (means, stds) = standardize(&samples);
        assert_eq!(means, [2.0, 2.0, 3.0, 4.0]);
        assert_eq!(stds, [1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_kmeans_separates_groups() {
        let mut points = vec![[0.0, 0.0, 0.0, 0.0]; 6];
        points.extend(vec![[10.0, 10.0, 10.0, 10.0]; 3]);
        points.push([0.1, 0.0, 0.0, 0.0]);

        let (centroids, sizes) = kmeans(&points, 2);
        assert_eq!(centroids.len(), 2);
        let mut sorted = sizes.clone();
        sorted.sort();
        assert_eq!(sorted, vec![3, 7]);
    }

    #[test]
    fn test_kmeans_more_clusters_than_points() {
        let points = vec![[1.0; FEATURES], [2.0; FEATURES]];
        let (centroids, sizes) = kmeans(&points, 3);
        assert_eq!(centroids.len(), 2);
        assert_eq!(sizes.iter().sum::<usize>(), 2);
    }

    #[test]
    fn test_training_requires_population() {
        let predictor = WarmingPredictor::new(3, 10, 100);
        let tracker = populated_tracker(9);
        assert_matches!(predictor.train(&tracker, at(12, 0)), Err(Error::Training(_)));
        assert!(!predictor.is_trained());
        assert!(predictor.predict(&tracker, at(12, 0)).is_empty());
    }

    #[test]
    fn test_train_and_predict_bounded() {
        let predictor = WarmingPredictor::new(3, 10, 4);
        let tracker = populated_tracker(12);

        let model = predictor.train(&tracker, at(12, 0)).unwrap();
        assert_eq!(model.users, 12);
        assert_eq!(model.cluster_sizes.iter().sum::<usize>(), model.samples);
        assert!(model.active_cluster < model.centroids.len());

        for hour in [9, 20] {
            let predicted = predictor.predict(&tracker, at(hour, 0));
            assert!(predicted.len() <= 4);
            for user in &predicted {
                assert!(tracker.get(user).is_some());
            }
        }
    }

    #[test]
    fn test_failed_retrain_keeps_previous_model() {
        let predictor = WarmingPredictor::new(3, 10, 100);
        let tracker = populated_tracker(12);
        let model = predictor.train(&tracker, at(12, 0)).unwrap();

        let small = populated_tracker(2);
        assert!(predictor.train(&small, at(13, 0)).is_err());
        assert_eq!(predictor.model(), Some(model));
    }
}
