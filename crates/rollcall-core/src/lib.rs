//! rollcall-core: face detection, gallery matching and temporal smoothing.
//!
//! Detection runs through a [`Detector`] over SCRFD (ONNX Runtime) or a
//! SeetaFace cascade. Faces are normalized to a canonical crop and matched
//! with local binary pattern histograms against an SQLite-backed [`Gallery`].

pub mod cascade;
pub mod detector;
pub mod gallery;
pub mod imgops;
pub mod lbph;
pub mod preprocess;
pub mod scrfd;
pub mod stabilizer;
pub mod store;
pub mod types;

pub use detector::{BackendPreference, Detector, DetectorError, DetectorParams, FaceBackend};
pub use gallery::{Gallery, GalleryError, GalleryParams, GalleryStatistics, IdentitySummary, MatchOutcome};
pub use preprocess::{ContrastMode, PreprocessParams, Preprocessor};
pub use stabilizer::{PositionKey, Stabilizer, StabilizerParams};
pub use store::{GalleryStore, StoreError};
pub use types::{BoundingBox, DescriptorInput, FaceRegion, Identification, Observation, TrackedFace};
