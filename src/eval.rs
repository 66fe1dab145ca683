//! Retrieval quality evaluation against a labelled query set.

use std::collections::HashSet;
use std::io::BufRead;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RagError, Result};
use crate::retriever::Retriever;

const PREVIEW_CHARS: usize = 200;

/// One labelled query.
#[derive(Debug, Clone, Deserialize)]
pub struct EvalCase {
    /// Question text.
    pub query: String,
    /// Documents a good retrieval should surface.
    #[serde(default)]
    pub relevant_document_ids: Vec<String>,
    /// Free-form annotation carried into the report.
    #[serde(default)]
    pub notes: Option<String>,
}

/// A retrieved chunk as seen by the evaluator.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedEntry {
    /// 1-based rank.
    pub rank: usize,
    /// Chunk identifier.
    pub chunk_id: String,
    /// Owning document.
    pub document_id: String,
    /// Similarity score.
    pub score: f32,
    /// Leading characters of the chunk.
    pub text_preview: String,
    /// Whether the document is labelled relevant.
    pub hit: bool,
}

/// Per-query outcome.
#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    /// Question text.
    pub query: String,
    /// Labelled relevant documents.
    pub relevant_document_ids: Vec<String>,
    /// Annotation from the case file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Fraction of relevant documents retrieved; `None` when none are labelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recall: Option<f64>,
    /// Rank of the first relevant hit.
    pub best_rank: Option<usize>,
    /// Wall time of the retrieval call.
    pub latency_ms: f64,
    /// Ranked results.
    pub retrieved: Vec<RetrievedEntry>,
}

/// Aggregate metrics.
#[derive(Debug, Clone, Serialize)]
pub struct EvalSummary {
    /// Cases evaluated.
    pub total_cases: usize,
    /// Share of cases with at least one relevant hit.
    pub hit_rate: f64,
    /// Mean recall over cases that have labels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_recall: Option<f64>,
    /// Mean of `1 / best_rank`, zero for misses.
    pub mean_reciprocal_rank: f64,
    /// Mean retrieval latency.
    pub avg_latency_ms: f64,
    /// Chunks requested per query.
    pub top_k: usize,
}

/// Summary plus per-case detail.
#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    /// Aggregate metrics.
    pub summary: EvalSummary,
    /// Per-query detail.
    pub cases: Vec<CaseReport>,
}

/// Reads JSONL cases, skipping blank lines.
pub fn load_cases<R: BufRead>(reader: R) -> Result<Vec<EvalCase>> {
    let mut cases = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let case: EvalCase = serde_json::from_str(&line).map_err(|err| {
            RagError::InvalidConfig(format!("invalid evaluation record at line {}: {err}", idx + 1))
        })?;
        cases.push(case);
    }
    Ok(cases)
}

/// Runs every case through `retriever` and scores the results.
pub fn evaluate(retriever: &Retriever, cases: Vec<EvalCase>, k: usize) -> Result<EvalReport> {
    let mut reports = Vec::with_capacity(cases.len());
    for case in cases {
        let started = Instant::now();
        let result = retriever.retrieve(&case.query, k, None)?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let retrieved = result
            .hits
            .iter()
            .enumerate()
            .map(|(idx, hit)| RetrievedEntry {
                rank: idx + 1,
                chunk_id: hit.metadata.chunk_id.clone(),
                document_id: hit.metadata.document_id.clone(),
                score: hit.score,
                text_preview: preview(&hit.metadata.chunk_text),
                hit: false,
            })
            .collect();
        let mut report = case_report(case, retrieved);
        report.latency_ms = latency_ms;
        debug!(query = %report.query, best_rank = ?report.best_rank, "evaluated case");
        reports.push(report);
    }
    Ok(EvalReport {
        summary: summarize(&reports, k),
        cases: reports,
    })
}

fn case_report(case: EvalCase, mut retrieved: Vec<RetrievedEntry>) -> CaseReport {
    let relevant: HashSet<&str> = case.relevant_document_ids.iter().map(String::as_str).collect();
    let mut matched = HashSet::new();
    let mut best_rank = None;
    for entry in retrieved.iter_mut() {
        if relevant.contains(entry.document_id.as_str()) {
            entry.hit = true;
            if matched.insert(entry.document_id.clone()) && best_rank.is_none() {
                best_rank = Some(entry.rank);
            }
        }
    }
    let recall = if relevant.is_empty() {
        None
    } else {
        Some(matched.len() as f64 / relevant.len() as f64)
    };
    CaseReport {
        query: case.query,
        relevant_document_ids: case.relevant_document_ids,
        notes: case.notes,
        recall,
        best_rank,
        latency_ms: 0.0,
        retrieved,
    }
}

fn summarize(cases: &[CaseReport], top_k: usize) -> EvalSummary {
    let total = cases.len();
    if total == 0 {
        return EvalSummary {
            total_cases: 0,
            hit_rate: 0.0,
            mean_recall: None,
            mean_reciprocal_rank: 0.0,
            avg_latency_ms: 0.0,
            top_k,
        };
    }
    let hits = cases.iter().filter(|c| c.best_rank.is_some()).count();
    let recalls: Vec<f64> = cases.iter().filter_map(|c| c.recall).collect();
    let mrr: f64 = cases
        .iter()
        .filter_map(|c| c.best_rank)
        .map(|rank| 1.0 / rank as f64)
        .sum();
    let latency: f64 = cases.iter().map(|c| c.latency_ms).sum();
    EvalSummary {
        total_cases: total,
        hit_rate: hits as f64 / total as f64,
        mean_recall: (!recalls.is_empty()).then(|| recalls.iter().sum::<f64>() / recalls.len() as f64),
        mean_reciprocal_rank: mrr / total as f64,
        avg_latency_ms: latency / total as f64,
        top_k,
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let mut snippet: String = text.chars().take(PREVIEW_CHARS).collect();
    snippet.push('…');
    snippet
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(rank: usize, document_id: &str) -> RetrievedEntry {
        RetrievedEntry {
            rank,
            chunk_id: format!("{document_id}#{rank:08}"),
            document_id: document_id.to_string(),
            score: 1.0 / rank as f32,
            text_preview: String::new(),
            hit: false,
        }
    }

    fn case(relevant: &[&str]) -> EvalCase {
        EvalCase {
            query: "q".into(),
            relevant_document_ids: relevant.iter().map(|s| s.to_string()).collect(),
            notes: None,
        }
    }

    #[test]
    fn recall_counts_documents_once() {
        let report = case_report(
            case(&["cpi", "wpi"]),
            vec![entry(1, "gdp"), entry(2, "cpi"), entry(3, "cpi")],
        );
        assert_eq!(report.best_rank, Some(2));
        assert_eq!(report.recall, Some(0.5));
        assert!(report.retrieved[2].hit);
    }

    #[test]
    fn unlabelled_case_has_no_recall() {
        let report = case_report(case(&[]), vec![entry(1, "gdp")]);
        assert_eq!(report.recall, None);
        assert_eq!(report.best_rank, None);
    }

    #[test]
    fn summary_averages_over_cases() {
        let a = case_report(case(&["cpi"]), vec![entry(1, "cpi")]);
        let b = case_report(case(&["cpi"]), vec![entry(1, "gdp"), entry(2, "cpi")]);
        let c = case_report(case(&["cpi"]), vec![entry(1, "gdp")]);
        let summary = summarize(&[a, b, c], 2);
        assert_eq!(summary.total_cases, 3);
        assert!((summary.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((summary.mean_reciprocal_rank - 0.5).abs() < 1e-9);
        assert_eq!(summary.mean_recall.map(|r| (r * 3.0).round()), Some(2.0));
    }

    #[test]
    fn loads_cases_and_skips_blank_lines() {
        let input = "{\"query\":\"cpi\",\"relevant_document_ids\":[\"cpi\"]}\n\n{\"query\":\"gdp\"}\n";
        let cases = load_cases(input.as_bytes()).expect("cases");
        assert_eq!(cases.len(), 2);
        assert!(cases[1].relevant_document_ids.is_empty());
    }

    #[test]
    fn bad_line_reports_its_number() {
        let err = load_cases("{\"query\":\"a\"}\nnot json\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
