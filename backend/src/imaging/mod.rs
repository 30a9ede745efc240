pub mod color;
pub mod processor;
pub mod relevance;

/// Normalized (height, width, channel) pixel array handed to the classifier and
/// the feature extractor.
pub type ImageArray = ndarray::Array3<f32>;
