//! Box geometry and greedy matching of predicted against true parts.
//!
//! [`greedy_match`] scores every (prediction, truth) pair by IoU and takes
//! pairs best-first. It is not a maximum-weight assignment: evaluation
//! numbers depend on this exact algorithm, so it is kept greedy.

mod geometry;

pub use geometry::{iou, merge_boxes, to_corners, Corners};

use crate::annotation::{Assembly, BBox, Normalized, Part, PartId};
use crate::codec::TagCodec;
use crate::error::CompographError;

/// IoU a pair must exceed to be matched.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.2;

/// Anything with a normalized box that can take part in matching.
pub trait HasBox {
    fn bbox(&self) -> Option<BBox<Normalized>>;
}

impl HasBox for Part {
    fn bbox(&self) -> Option<BBox<Normalized>> {
        Some(Part::bbox(self))
    }
}

impl HasBox for BBox<Normalized> {
    fn bbox(&self) -> Option<BBox<Normalized>> {
        Some(*self)
    }
}

impl<T: HasBox + ?Sized> HasBox for &T {
    fn bbox(&self) -> Option<BBox<Normalized>> {
        (**self).bbox()
    }
}

/// One output row of the matcher.
///
/// At least one side is always present; the constructors make the empty
/// state impossible to build.
#[derive(Debug, PartialEq)]
pub struct Match<'p, 't, P, T> {
    predicted: Option<&'p P>,
    truth: Option<&'t T>,
    score: f64,
}

impl<'p, 't, P, T> Match<'p, 't, P, T> {
    pub fn pair(predicted: &'p P, truth: &'t T, score: f64) -> Self {
        Self {
            predicted: Some(predicted),
            truth: Some(truth),
            score,
        }
    }

    pub fn unmatched_prediction(predicted: &'p P) -> Self {
        Self {
            predicted: Some(predicted),
            truth: None,
            score: 0.0,
        }
    }

    pub fn unmatched_truth(truth: &'t T) -> Self {
        Self {
            predicted: None,
            truth: Some(truth),
            score: 0.0,
        }
    }

    pub fn predicted(&self) -> Option<&'p P> {
        self.predicted
    }

    pub fn truth(&self) -> Option<&'t T> {
        self.truth
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn is_pair(&self) -> bool {
        self.predicted.is_some() && self.truth.is_some()
    }
}

// Derives would require `P: Clone` and `T: Clone`.
impl<P, T> Clone for Match<'_, '_, P, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P, T> Copy for Match<'_, '_, P, T> {}

/// Pairs predictions with truths, best IoU first.
///
/// Every pair is scored; pairs are taken in descending score order (ties
/// broken by prediction index, then truth index) while both members are
/// free, until the score drops to `threshold` or below. Unmatched
/// predictions follow in index order, then unmatched truths, both with score
/// 0. Items without a box are never paired.
pub fn greedy_match<'p, 't, P, T>(
    predicted: impl IntoIterator<Item = &'p P>,
    truth: impl IntoIterator<Item = &'t T>,
    threshold: f64,
) -> Vec<Match<'p, 't, P, T>>
where
    P: HasBox + 'p,
    T: HasBox + 't,
{
    let predicted: Vec<&'p P> = predicted.into_iter().collect();
    let truth: Vec<&'t T> = truth.into_iter().collect();

    let truth_boxes: Vec<Option<BBox<Normalized>>> = truth.iter().map(|t| t.bbox()).collect();
    let mut scored: Vec<(f64, usize, usize)> = Vec::with_capacity(predicted.len() * truth.len());
    for (i, p) in predicted.iter().enumerate() {
        let Some(pbox) = p.bbox() else { continue };
        for (j, tbox) in truth_boxes.iter().enumerate() {
            if let Some(tbox) = tbox {
                scored.push((iou(&pbox, tbox), i, j));
            }
        }
    }
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut used_p = vec![false; predicted.len()];
    let mut used_t = vec![false; truth.len()];
    let mut matches = Vec::with_capacity(predicted.len() + truth.len());

    for (score, i, j) in scored {
        if score <= threshold {
            break;
        }
        if used_p[i] || used_t[j] {
            continue;
        }
        used_p[i] = true;
        used_t[j] = true;
        matches.push(Match::pair(predicted[i], truth[j], score));
    }

    matches.extend(
        predicted
            .iter()
            .zip(&used_p)
            .filter(|(_, used)| !**used)
            .map(|(p, _)| Match::unmatched_prediction(*p)),
    );
    matches.extend(
        truth
            .iter()
            .zip(&used_t)
            .filter(|(_, used)| !**used)
            .map(|(t, _)| Match::unmatched_truth(*t)),
    );
    matches
}

/// Merges overlapping parts of an assembly, best overlap first.
///
/// Repeatedly takes the pair of parts with the highest IoU above `threshold`
/// (ties by insertion order) and merges the later part into the earlier one,
/// until no such pair is left. With a codec, only parts that share a label
/// are merged. Returns the number of merges.
pub fn merge_overlapping(
    assembly: &mut Assembly,
    threshold: f64,
    codec: Option<&TagCodec>,
) -> Result<usize, CompographError> {
    let mut merges = 0;
    while let Some((from, into)) = best_overlap(assembly, threshold, codec) {
        assembly.merge_parts(from, into)?;
        merges += 1;
    }
    Ok(merges)
}

fn best_overlap(
    assembly: &Assembly,
    threshold: f64,
    codec: Option<&TagCodec>,
) -> Option<(PartId, PartId)> {
    let parts: Vec<(PartId, &Part)> = assembly.parts().collect();
    let mut best: Option<(f64, PartId, PartId)> = None;

    for (n, &(id_a, a)) in parts.iter().enumerate() {
        for &(id_b, b) in &parts[n + 1..] {
            if let Some(codec) = codec {
                if codec.encode(&a.tags) != codec.encode(&b.tags) {
                    continue;
                }
            }
            let score = iou(&a.bbox(), &b.bbox());
            if score > threshold && best.is_none_or(|(s, _, _)| score > s) {
                best = Some((score, id_b, id_a));
            }
        }
    }
    best.map(|(_, from, into)| (from, into))
}
