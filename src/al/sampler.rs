//! Uncertainty Sampler
//! Mission: Surface the cases the production model is least sure about

use serde::Serialize;

use crate::model::Prediction;
use crate::storage::models::LedgerEntry;

/// An image attached to a candidate case, with its stored predictions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CandidateImage {
    pub path: Option<String>,
    pub image_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub predictions: Vec<Prediction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blur_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// A case summary with its resolved images, ready for margin scoring.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateCase {
    #[serde(flatten)]
    pub entry: LedgerEntry,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<CandidateImage>,
}

/// A selected candidate, augmented with its uncertainty scores.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredCandidate {
    #[serde(flatten)]
    pub case: CandidateCase,
    pub margin: f64,
    pub uncertainty_score: f64,
}

/// Selection result returned by the candidates endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateSelection {
    pub candidates: Vec<ScoredCandidate>,
    pub total_candidates: usize,
    pub selection_method: &'static str,
    pub description: String,
}

/// Margin of one prediction set: top-1 minus top-2 confidence. Fewer than
/// two predictions means maximal certainty.
pub fn margin(predictions: &[Prediction]) -> f64 {
    if predictions.len() < 2 {
        return 1.0;
    }
    let mut confidences: Vec<f64> = predictions.iter().map(|p| p.confidence).collect();
    confidences.sort_by(|a, b| b.total_cmp(a));
    confidences[0] - confidences[1]
}

/// Case-level margin: the minimum margin across the case's images. A case is
/// as uncertain as its most uncertain image. Cases without images fall back
/// to case-level predictions.
pub fn case_margin(case: &CandidateCase) -> f64 {
    if case.images.is_empty() {
        if case.entry.predictions.is_empty() {
            return 1.0;
        }
        return margin(&case.entry.predictions);
    }

    case.images
        .iter()
        .filter(|img| !img.predictions.is_empty())
        .map(|img| margin(&img.predictions))
        .min_by(|a, b| a.total_cmp(b))
        .unwrap_or(1.0)
}

/// Top-k cases with the smallest margins, ties broken by input order. Each
/// selected case carries `margin` and `uncertainty_score = 1 - margin`.
pub fn select_uncertain(cases: Vec<CandidateCase>, top_k: usize) -> Vec<ScoredCandidate> {
    let mut scored: Vec<(f64, usize, CandidateCase)> = cases
        .into_iter()
        .enumerate()
        .map(|(idx, case)| (case_margin(&case), idx, case))
        .collect();

    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    scored.truncate(top_k);

    scored
        .into_iter()
        .map(|(margin, _, case)| ScoredCandidate {
            case,
            margin,
            uncertainty_score: 1.0 - margin,
        })
        .collect()
}

/// Full selection with the response envelope.
pub fn get_candidates(cases: Vec<CandidateCase>, top_k: usize) -> CandidateSelection {
    let candidates = select_uncertain(cases, top_k);
    let total = candidates.len();
    CandidateSelection {
        description: format!(
            "Top {total} most uncertain cases based on minimum prediction margins across all images"
        ),
        candidates,
        total_candidates: total,
        selection_method: "minimum_margin_case_sampling",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preds(confidences: &[f64]) -> Vec<Prediction> {
        confidences
            .iter()
            .enumerate()
            .map(|(i, &c)| Prediction {
                label: format!("class_{i}"),
                confidence: c,
            })
            .collect()
    }

    fn case_with_images(case_id: &str, image_preds: &[&[f64]]) -> CandidateCase {
        CandidateCase {
            entry: LedgerEntry {
                case_id: Some(case_id.to_string()),
                ..Default::default()
            },
            images: image_preds
                .iter()
                .map(|p| CandidateImage {
                    predictions: preds(p),
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn test_margin_basic() {
        assert!((margin(&preds(&[0.7, 0.2, 0.1])) - 0.5).abs() < 1e-12);
        // Unsorted input is handled.
        assert!((margin(&preds(&[0.2, 0.7, 0.1])) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_single_prediction_is_maximally_certain() {
        assert_eq!(margin(&preds(&[0.9])), 1.0);
        assert_eq!(margin(&[]), 1.0);
    }

    #[test]
    fn test_case_margin_takes_weakest_image() {
        let case = case_with_images("10000", &[&[0.9, 0.1], &[0.5, 0.45]]);
        assert!((case_margin(&case) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_case_margin_falls_back_to_case_predictions() {
        let mut case = case_with_images("10000", &[]);
        case.entry.predictions = preds(&[0.6, 0.3]);
        assert!((case_margin(&case) - 0.3).abs() < 1e-12);

        let empty = case_with_images("10001", &[]);
        assert_eq!(case_margin(&empty), 1.0);
    }

    #[test]
    fn test_images_without_predictions_are_ignored() {
        let mut case = case_with_images("10000", &[&[0.8, 0.1]]);
        case.images.push(CandidateImage::default());
        assert!((case_margin(&case) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_top_k_ranking_and_order() {
        // Margins: A=0.10, B=0.02, C=0.40.
        let cases = vec![
            case_with_images("A", &[&[0.55, 0.45]]),
            case_with_images("B", &[&[0.51, 0.49]]),
            case_with_images("C", &[&[0.70, 0.30]]),
        ];

        let selected = select_uncertain(cases, 2);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].case.entry.case_id.as_deref(), Some("B"));
        assert_eq!(selected[1].case.entry.case_id.as_deref(), Some("A"));
        assert!((selected[0].margin - 0.02).abs() < 1e-12);
        assert!((selected[0].uncertainty_score - 0.98).abs() < 1e-12);
    }

    #[test]
    fn test_ties_break_by_input_order() {
        let cases = vec![
            case_with_images("first", &[&[0.6, 0.5]]),
            case_with_images("second", &[&[0.6, 0.5]]),
        ];
        let selected = select_uncertain(cases, 2);
        assert_eq!(selected[0].case.entry.case_id.as_deref(), Some("first"));
        assert_eq!(selected[1].case.entry.case_id.as_deref(), Some("second"));
    }

    #[test]
    fn test_selection_envelope() {
        let result = get_candidates(vec![case_with_images("A", &[&[0.9, 0.05]])], 5);
        assert_eq!(result.total_candidates, 1);
        assert_eq!(result.selection_method, "minimum_margin_case_sampling");
        assert!(result.description.contains("Top 1"));
    }
}
