//! Cart classification and customer segmentation, the two inputs every
//! discount decision starts from.

pub mod classifier;
pub mod segmenter;

pub use classifier::{CartAnalysis, CartClassifier, CategoryBucket, MatchSource};
pub use segmenter::{CustomerSegmenter, SegmentAssignment, SegmentRule};
