//! Enrollment gallery and matcher.
//!
//! The gallery owns every enrolled [`FaceTemplate`] and a compiled
//! [`LbphModel`] over their samples. Mutations are serialized by the store
//! mutex and rebuild the model before returning; identification only takes
//! the read lock long enough to clone the current model handle.

use crate::detector::{Detector, DetectorError};
use crate::lbph::{self, Histogram, LbphModel, LbphParams};
use crate::preprocess::Preprocessor;
use crate::store::{GalleryStore, StoredIdentity};
use crate::types::{DescriptorInput, Identification};
use chrono::{DateTime, Utc};
use image::GrayImage;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

const DEFAULT_MAX_SAMPLES: usize = 10;
const DEFAULT_THRESHOLD: f32 = 0.35;
const MIN_THRESHOLD: f32 = 0.1;
const MAX_THRESHOLD: f32 = 1.0;
/// Fewer samples than this across the whole gallery leaves it untrained.
const MIN_TRAINING_SAMPLES: usize = 2;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("no face found in the enrollment image")]
    NoFaceFound,
    #[error("identity not enrolled: {0}")]
    NotFound(String),
    #[error("gallery is not trained (fewer than {MIN_TRAINING_SAMPLES} samples)")]
    NotTrained,
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("invalid sample: {0}")]
    InvalidSample(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
}

#[derive(Debug, Clone)]
pub struct GalleryParams {
    /// Samples kept per identity; the oldest is evicted first.
    pub max_samples_per_identity: usize,
    /// Minimum similarity for a positive identification.
    pub threshold: f32,
    /// Side of the descriptor inputs this gallery accepts.
    pub canonical_size: u32,
    pub lbph: LbphParams,
}

impl Default for GalleryParams {
    fn default() -> Self {
        Self {
            max_samples_per_identity: DEFAULT_MAX_SAMPLES,
            threshold: DEFAULT_THRESHOLD,
            canonical_size: 100,
            lbph: LbphParams::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct Sample {
    input: DescriptorInput,
    histogram: Histogram,
}

/// All enrolled samples of one identity.
#[derive(Debug, Clone)]
pub struct FaceTemplate {
    pub id: String,
    pub name: String,
    samples: VecDeque<Sample>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FaceTemplate {
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn to_stored(&self) -> StoredIdentity {
        StoredIdentity {
            id: self.id.clone(),
            name: self.name.clone(),
            enrolled_at: self.enrolled_at,
            updated_at: self.updated_at,
            samples: self.samples.iter().map(|s| s.input.clone()).collect(),
        }
    }
}

/// Public view of one enrolled identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySummary {
    pub id: String,
    pub name: String,
    pub samples: usize,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Diagnostic result of [`Gallery::match_face`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchOutcome {
    pub id: String,
    pub name: String,
    /// Mean per-cell chi-square distance to the nearest sample.
    pub distance: f32,
    pub similarity: f32,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GalleryStatistics {
    pub identities: usize,
    pub samples_per_identity: BTreeMap<String, usize>,
    pub total_samples: usize,
    pub trained: bool,
    pub threshold: f32,
    pub revision: u64,
}

struct GalleryState {
    templates: BTreeMap<String, FaceTemplate>,
    model: Option<Arc<LbphModel>>,
    threshold: f32,
    revision: u64,
}

pub struct Gallery {
    params: GalleryParams,
    state: RwLock<GalleryState>,
    /// Held for the whole of every mutation; also guards the store.
    writer: Mutex<Option<GalleryStore>>,
}

impl Gallery {
    /// A gallery that is never persisted.
    pub fn in_memory(params: GalleryParams) -> Self {
        Self::build(params, None, Vec::new())
    }

    /// Open the gallery stored at `path`.
    ///
    /// An unreadable or corrupt store is not an error: the gallery starts
    /// empty and in-memory, and a warning is logged.
    pub fn open(path: &Path, params: GalleryParams) -> Self {
        match GalleryStore::open(path) {
            Ok(store) => Self::with_store(store, params),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "gallery store unavailable; starting empty");
                Self::in_memory(params)
            }
        }
    }

    /// Load from an already-open store; load failures degrade to empty.
    pub fn with_store(store: GalleryStore, params: GalleryParams) -> Self {
        let loaded = match store.load_all(params.canonical_size) {
            Ok(identities) => identities,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read gallery store; starting empty");
                Vec::new()
            }
        };
        Self::build(params, Some(store), loaded)
    }

    fn build(params: GalleryParams, store: Option<GalleryStore>, loaded: Vec<StoredIdentity>) -> Self {
        let max = params.max_samples_per_identity.max(1);
        let mut templates = BTreeMap::new();
        for stored in loaded {
            let mut samples: VecDeque<Sample> = stored
                .samples
                .into_iter()
                .map(|input| Sample { histogram: lbph::histogram(&input, &params.lbph), input })
                .collect();
            while samples.len() > max {
                samples.pop_front();
            }
            templates.insert(
                stored.id.clone(),
                FaceTemplate {
                    id: stored.id,
                    name: stored.name,
                    samples,
                    enrolled_at: stored.enrolled_at,
                    updated_at: stored.updated_at,
                },
            );
        }

        let mut state = GalleryState {
            templates,
            model: None,
            threshold: params.threshold.clamp(MIN_THRESHOLD, MAX_THRESHOLD),
            revision: 0,
        };
        rebuild_model(&mut state, &params.lbph);

        tracing::info!(
            identities = state.templates.len(),
            trained = state.model.is_some(),
            persistent = store.is_some(),
            "gallery loaded"
        );

        Self { params, state: RwLock::new(state), writer: Mutex::new(store) }
    }

    pub fn params(&self) -> &GalleryParams {
        &self.params
    }

    /// Detect the largest face in `image` and enroll its variations.
    ///
    /// Returns the identity's sample count afterwards.
    pub fn enroll(
        &self,
        detector: &mut Detector,
        preprocessor: &Preprocessor,
        id: &str,
        name: &str,
        image: &GrayImage,
    ) -> Result<usize, GalleryError> {
        validate_id(id)?;
        let samples = Self::capture_samples(detector, preprocessor, image)?;
        self.enroll_samples(id, name, samples)
    }

    /// Normalized variations of the largest face in `image`, ready for
    /// [`enroll_samples`](Self::enroll_samples). Touches no gallery state, so
    /// callers can release the detector before the gallery write.
    pub fn capture_samples(
        detector: &mut Detector,
        preprocessor: &Preprocessor,
        image: &GrayImage,
    ) -> Result<Vec<DescriptorInput>, GalleryError> {
        let region = detector.largest(image)?.ok_or(GalleryError::NoFaceFound)?;
        let input = preprocessor.normalize(image, &region).ok_or(GalleryError::NoFaceFound)?;
        tracing::debug!(bbox = ?region.bbox, detector = region.detector, "enrollment face found");
        Ok(preprocessor.variations(&input))
    }

    /// Append pre-normalized samples to an identity, creating it if needed.
    pub fn enroll_samples(
        &self,
        id: &str,
        name: &str,
        inputs: Vec<DescriptorInput>,
    ) -> Result<usize, GalleryError> {
        validate_id(id)?;
        let id = id.trim();
        let name = match name.trim() {
            "" => id,
            n => n,
        };
        if inputs.is_empty() {
            return Err(GalleryError::NoFaceFound);
        }
        if let Some(bad) = inputs.iter().find(|i| i.size != self.params.canonical_size) {
            return Err(GalleryError::InvalidSample(format!(
                "sample is {}x{}, expected {}x{}",
                bad.size, bad.size, self.params.canonical_size, self.params.canonical_size
            )));
        }

        let samples: Vec<Sample> = inputs
            .into_iter()
            .map(|input| Sample { histogram: lbph::histogram(&input, &self.params.lbph), input })
            .collect();

        let mut store = self.lock_writer();
        let (count, stored) = {
            let mut state = self.write_state();
            let now = Utc::now();
            let max = self.params.max_samples_per_identity.max(1);

            let template = state.templates.entry(id.to_string()).or_insert_with(|| FaceTemplate {
                id: id.to_string(),
                name: name.to_string(),
                samples: VecDeque::new(),
                enrolled_at: now,
                updated_at: now,
            });
            template.name = name.to_string();
            template.updated_at = now;
            template.samples.extend(samples);
            while template.samples.len() > max {
                template.samples.pop_front();
            }
            let count = template.samples.len();
            let stored = template.to_stored();

            rebuild_model(&mut state, &self.params.lbph);
            state.revision += 1;
            (count, stored)
        };

        if let Some(store) = store.as_mut() {
            if let Err(e) = store.save_identity(&stored) {
                tracing::warn!(id, error = %e, "failed to persist enrollment");
            }
        }

        tracing::info!(id, name, samples = count, "identity enrolled");
        Ok(count)
    }

    /// Remove an identity and all of its samples.
    ///
    /// The id is trimmed the same way [`enroll_samples`](Self::enroll_samples) trims it.
    pub fn unenroll(&self, id: &str) -> Result<(), GalleryError> {
        validate_id(id)?;
        let id = id.trim();
        let mut store = self.lock_writer();
        {
            let mut state = self.write_state();
            if state.templates.remove(id).is_none() {
                return Err(GalleryError::NotFound(id.to_string()));
            }
            rebuild_model(&mut state, &self.params.lbph);
            state.revision += 1;
        }

        if let Some(store) = store.as_mut() {
            if let Err(e) = store.delete_identity(id) {
                tracing::warn!(id, error = %e, "failed to persist removal");
            }
        }

        tracing::info!(id, "identity removed");
        Ok(())
    }

    /// Rebuild the model from every template.
    pub fn retrain(&self) {
        let _writer = self.lock_writer();
        let mut state = self.write_state();
        rebuild_model(&mut state, &self.params.lbph);
        state.revision += 1;
    }

    /// Identify a canonical face. `None` when untrained, the nearest sample
    /// is below threshold, or the input is not canonical size.
    pub fn identify(&self, input: &DescriptorInput) -> Option<Identification> {
        match self.match_face(input) {
            Ok(outcome) if outcome.accepted => Some(Identification {
                id: outcome.id,
                name: outcome.name,
                similarity: outcome.similarity,
            }),
            Ok(_) | Err(_) => None,
        }
    }

    /// Nearest enrolled identity with its raw distance, accepted or not.
    pub fn match_face(&self, input: &DescriptorInput) -> Result<MatchOutcome, GalleryError> {
        if input.size != self.params.canonical_size {
            return Err(GalleryError::InvalidSample(format!(
                "probe is {}x{}, expected {}x{}",
                input.size, input.size, self.params.canonical_size, self.params.canonical_size
            )));
        }

        let (model, threshold) = {
            let state = self.read_state();
            (state.model.clone(), state.threshold)
        };
        let model = model.ok_or(GalleryError::NotTrained)?;
        let nearest = model.nearest(input).ok_or(GalleryError::NotTrained)?;

        Ok(MatchOutcome {
            accepted: nearest.similarity >= threshold,
            id: nearest.id,
            name: nearest.name,
            distance: nearest.distance,
            similarity: nearest.similarity,
        })
    }

    pub fn is_trained(&self) -> bool {
        self.read_state().model.is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read_state().templates.contains_key(id)
    }

    /// Incremented by every mutation.
    pub fn revision(&self) -> u64 {
        self.read_state().revision
    }

    pub fn threshold(&self) -> f32 {
        self.read_state().threshold
    }

    /// Set the acceptance threshold, clamped to [0.1, 1.0]. Returns the value applied.
    pub fn set_threshold(&self, threshold: f32) -> f32 {
        let applied = if threshold.is_nan() {
            DEFAULT_THRESHOLD
        } else {
            threshold.clamp(MIN_THRESHOLD, MAX_THRESHOLD)
        };
        self.write_state().threshold = applied;
        tracing::info!(threshold = applied, "similarity threshold updated");
        applied
    }

    pub fn identities(&self) -> Vec<IdentitySummary> {
        self.read_state()
            .templates
            .values()
            .map(|t| IdentitySummary {
                id: t.id.clone(),
                name: t.name.clone(),
                samples: t.sample_count(),
                enrolled_at: t.enrolled_at,
                updated_at: t.updated_at,
            })
            .collect()
    }

    pub fn statistics(&self) -> GalleryStatistics {
        let state = self.read_state();
        let samples_per_identity: BTreeMap<String, usize> = state
            .templates
            .values()
            .map(|t| (t.id.clone(), t.sample_count()))
            .collect();
        GalleryStatistics {
            identities: state.templates.len(),
            total_samples: samples_per_identity.values().sum(),
            samples_per_identity,
            trained: state.model.is_some(),
            threshold: state.threshold,
            revision: state.revision,
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, GalleryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, GalleryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_writer(&self) -> MutexGuard<'_, Option<GalleryStore>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn validate_id(id: &str) -> Result<(), GalleryError> {
    if id.trim().is_empty() {
        return Err(GalleryError::InvalidIdentity("identity id must not be empty".into()));
    }
    Ok(())
}

fn rebuild_model(state: &mut GalleryState, params: &LbphParams) {
    let total: usize = state.templates.values().map(FaceTemplate::sample_count).sum();
    if total < MIN_TRAINING_SAMPLES {
        state.model = None;
        tracing::debug!(total, "gallery untrained");
        return;
    }

    let model = LbphModel::build(
        params.clone(),
        state.templates.values().map(|t| {
            (
                t.id.as_str(),
                t.name.as_str(),
                t.samples.iter().map(|s| Arc::clone(&s.histogram)).collect::<Vec<_>>(),
            )
        }),
    );
    tracing::debug!(identities = state.templates.len(), samples = total, "gallery retrained");
    state.model = Some(Arc::new(model));
}
