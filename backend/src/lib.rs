//! Skin-image analysis service: classifier probability, image heuristics and
//! an external second opinion fused into an Eczema / Normal / Uncertain call.

pub mod analysis;
pub mod assessor;
pub mod classifier;
pub mod config;
pub mod imaging;
pub mod pipeline;
pub mod routes;

pub use pipeline::{AnalysisError, AnalysisPipeline};
