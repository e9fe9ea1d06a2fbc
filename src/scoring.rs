//! Evaluation collaborator: scores extracted question/answer pairs
//! against the pre-processed source text.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::chunk::Chunk;
use crate::qna::QnaPair;

/// Answers whose grounding score falls below this are reported as weak.
pub const DEFAULT_WEAK_THRESHOLD: f64 = 0.5;

const STOPWORDS: &[&str] = &[
    "and", "are", "but", "for", "from", "has", "have", "its", "not", "that", "the", "their",
    "there", "this", "was", "were", "which", "will", "with", "you",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairScore {
    pub question: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub method: String,
    pub mean_score: f64,
    pub scores: Vec<PairScore>,
    /// Questions whose answers are weakly grounded in the source.
    pub weak_questions: Vec<String>,
}

pub trait Evaluator: Send + Sync {
    fn evaluate(&self, chunks: &[Chunk], pairs: &[QnaPair]) -> Evaluation;
}

/// Scores each pair by the share of its answer's terms that occur in the
/// source chunks. Terms are lower-cased alphanumeric words of three or
/// more characters, minus a short stopword list.
#[derive(Debug, Clone)]
pub struct OverlapEvaluator {
    pub weak_threshold: f64,
}

impl Default for OverlapEvaluator {
    fn default() -> Self {
        Self {
            weak_threshold: DEFAULT_WEAK_THRESHOLD,
        }
    }
}

impl Evaluator for OverlapEvaluator {
    fn evaluate(&self, chunks: &[Chunk], pairs: &[QnaPair]) -> Evaluation {
        let source: HashSet<String> = chunks.iter().flat_map(|c| terms(&c.text)).collect();

        let scores: Vec<PairScore> = pairs
            .iter()
            .map(|pair| {
                let answer = terms(&pair.answer);
                let score = if answer.is_empty() {
                    0.0
                } else {
                    let found = answer.iter().filter(|t| source.contains(*t)).count();
                    found as f64 / answer.len() as f64
                };
                PairScore {
                    question: pair.question.clone(),
                    score,
                }
            })
            .collect();

        let mean_score = if scores.is_empty() {
            0.0
        } else {
            scores.iter().map(|s| s.score).sum::<f64>() / scores.len() as f64
        };

        let weak_questions = scores
            .iter()
            .filter(|s| s.score < self.weak_threshold)
            .map(|s| s.question.clone())
            .collect();

        Evaluation {
            method: "term_overlap".to_string(),
            mean_score,
            scores,
            weak_questions,
        }
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}
