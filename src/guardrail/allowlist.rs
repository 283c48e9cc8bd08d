//! Allowlist - relations a single query may reference
//!
//! Exact names come from the retrieval result of the request (or the whole
//! catalog for offline validation) and match case-sensitively. Reference
//! patterns are `*`/`?` globs that are always allowed.

use crate::catalog::SchemaEntry;
use crate::schema_rag::RetrievalResult;
use regex::Regex;
use std::collections::BTreeSet;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    names: BTreeSet<String>,
    patterns: Vec<Regex>,
}

impl Allowlist {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            patterns: Vec::new(),
        }
    }

    /// Relations granted by the retrieved entries.
    pub fn from_retrieval(result: &RetrievalResult) -> Self {
        Self::new(result.relations())
    }

    /// Every relation in the catalog.
    pub fn from_entries(entries: &[SchemaEntry]) -> Self {
        Self::new(entries.iter().filter_map(|e| e.relation()).map(str::to_string))
    }

    pub fn with_reference_patterns<S: AsRef<str>>(mut self, patterns: &[S]) -> Self {
        for pattern in patterns {
            match glob_to_regex(pattern.as_ref()) {
                Some(re) => self.patterns.push(re),
                None => warn!("Ignoring invalid reference pattern '{}'", pattern.as_ref()),
            }
        }
        self
    }

    pub fn names(&self) -> &BTreeSet<String> {
        &self.names
    }

    pub fn permits(&self, relation: &str) -> bool {
        self.names.contains(relation) || self.patterns.iter().any(|re| re.is_match(relation))
    }
}

fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return None;
    }
    let mut expr = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_names_are_case_sensitive() {
        let allow = Allowlist::new(["main.employees"]);
        assert!(allow.permits("main.employees"));
        assert!(!allow.permits("MAIN.EMPLOYEES"));
        assert!(!allow.permits("main.employees_archive"));
    }

    #[test]
    fn test_reference_patterns() {
        let allow = Allowlist::new(Vec::<String>::new()).with_reference_patterns(&["seeds.*", "ref.country_?"]);
        assert!(allow.permits("seeds.calendar"));
        assert!(allow.permits("ref.country_a"));
        assert!(!allow.permits("ref.country_ab"));
        assert!(!allow.permits("seedsXcalendar"));
        assert!(!allow.permits("internal.secrets"));
    }

    #[test]
    fn test_from_entries_uses_relations() {
        let entries = vec![
            SchemaEntry::table("main.employees", "Employees"),
            SchemaEntry::column("main.employees", "status", "TEXT", "Status"),
        ];
        let allow = Allowlist::from_entries(&entries);
        assert_eq!(allow.names().len(), 1);
        assert!(allow.permits("main.employees"));
    }
}
