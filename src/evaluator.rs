//! Recoverability Evaluator
//! Maps what is known about a candidate's content to a confidence tier

use serde::{Deserialize, Serialize};

use crate::types::{extents_contiguous, CandidateEntry, ConfidenceTier, SourceKind, StructuralCheck};

/// Everything the tier depends on. Two equal inputs always give the same tier.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// Byte-weighted share of the extents that is neither overwritten nor unreadable.
    pub readable_fraction: f64,
    pub structural: StructuralCheck,
    pub extent_count: usize,
    /// Extents follow each other on disk without gaps.
    pub contiguous: bool,
    pub source: SourceKind,
}

impl Evaluation {
    pub fn of_entry(entry: &CandidateEntry, sector_size: u32) -> Self {
        Evaluation {
            readable_fraction: entry.readable_fraction,
            structural: entry.structural,
            extent_count: entry.extents.len(),
            contiguous: extents_contiguous(&entry.extents, sector_size),
            source: entry.source,
        }
    }
}

pub fn evaluate(input: &Evaluation, fragmentation_threshold: usize) -> ConfidenceTier {
    if input.readable_fraction < 1.0 || input.structural == StructuralCheck::Failed {
        return ConfidenceTier::Low;
    }
    let minor_fragmentation = input.extent_count <= fragmentation_threshold;
    match (input.source, input.structural) {
        (SourceKind::Carved, StructuralCheck::Passed) => ConfidenceTier::Medium,
        (SourceKind::Carved, _) => ConfidenceTier::Low,
        (SourceKind::Metadata, StructuralCheck::Passed)
            if input.extent_count <= 1 || input.contiguous =>
        {
            ConfidenceTier::High
        }
        (SourceKind::Metadata, StructuralCheck::Passed | StructuralCheck::Unavailable)
            if minor_fragmentation =>
        {
            ConfidenceTier::Medium
        }
        (SourceKind::Metadata, _) => ConfidenceTier::Low,
    }
}
