//! Lexical scorer used when embeddings are unavailable
//!
//! Each question token is matched against the entry's tokens, exactly or by
//! Jaro-Winkler similarity above a threshold; the entry score is the mean of
//! the per-token best matches.

use lazy_static::lazy_static;
use std::collections::{BTreeSet, HashSet};
use strsim::jaro_winkler;

/// Minimum Jaro-Winkler similarity for a fuzzy token match.
pub const FUZZY_THRESHOLD: f64 = 0.92;

lazy_static! {
    static ref STOPWORDS: HashSet<&'static str> = [
        "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "each", "for",
        "from", "give", "how", "i", "in", "is", "it", "list", "me", "many", "much", "of", "on",
        "or", "per", "please", "show", "tell", "than", "that", "the", "their", "there", "this",
        "to", "us", "was", "we", "what", "when", "where", "which", "who", "with", "you",
    ]
    .into_iter()
    .collect();
}

/// Lowercase alphanumeric tokens with stop words removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1 && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Token sets for every document, in entry order.
#[derive(Debug, Clone, Default)]
pub struct LexicalIndex {
    docs: Vec<BTreeSet<String>>,
}

impl LexicalIndex {
    pub fn build<'a, I>(texts: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self {
            docs: texts.into_iter().map(|t| tokenize(t).into_iter().collect()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Score of every document for the question, in entry order, each in [0, 1].
    pub fn scores(&self, question: &str) -> Vec<f32> {
        let query: Vec<String> = tokenize(question);
        if query.is_empty() {
            return vec![0.0; self.docs.len()];
        }
        self.docs.iter().map(|doc| score_tokens(&query, doc)).collect()
    }
}

fn best_match(token: &str, doc: &BTreeSet<String>) -> f64 {
    if doc.contains(token) {
        return 1.0;
    }
    doc.iter()
        .map(|candidate| jaro_winkler(token, candidate))
        .filter(|sim| *sim >= FUZZY_THRESHOLD)
        .fold(0.0, f64::max)
}

fn score_tokens(query: &[String], doc: &BTreeSet<String>) -> f32 {
    let total: f64 = query.iter().map(|t| best_match(t, doc)).sum();
    (total / query.len() as f64).clamp(0.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_drops_stopwords() {
        assert_eq!(
            tokenize("What is the headcount by Department?"),
            vec!["headcount", "department"]
        );
        assert_eq!(tokenize("main.employees.hire_date"), vec!["main", "employees", "hire", "date"]);
    }

    #[test]
    fn test_scores_exact_and_fuzzy() {
        let index = LexicalIndex::build([
            "table main.employees: Columns: department, status",
            "table main.offices: Columns: city",
        ]);
        let scores = index.scores("headcount by departments");
        // "departments" ~ "department" via jaro-winkler, "headcount" unmatched
        assert!(scores[0] > 0.45 && scores[0] < 0.5);
        assert_eq!(scores[1], 0.0);

        let exact = index.scores("department status");
        assert_eq!(exact[0], 1.0);
    }

    #[test]
    fn test_empty_question_scores_zero() {
        let index = LexicalIndex::build(["table a"]);
        assert_eq!(index.scores("the of"), vec![0.0]);
    }
}
