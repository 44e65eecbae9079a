//! Line feature extraction.
//!
//! [`LineExtractor`] runs a [`LineBackend`] over an image pyramid, removes
//! lines on dynamic objects, caps the result by response and attaches LBD
//! descriptors.

pub mod backend;
pub mod dynamic;
pub mod extractor;
pub mod keyline;
pub mod pyramid;

pub use backend::{Detection, DetectionParams, EdBackend, LineBackend, LsdBackend, LsdParams};
pub use dynamic::{DynamicConfig, DynamicFilter, InstanceMasks};
pub use extractor::{DetectorKind, LineExtractor, LineExtractorConfig, LineFeatures, cap_by_response};
pub use keyline::KeyLine;
pub use pyramid::{Pyramid, ScaleLevels};
