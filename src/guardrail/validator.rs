//! Guardrail - validates model-generated SQL before it reaches a warehouse
//!
//! Checks run in a fixed order and the first failure wins:
//! statement type, referenced relations, called functions, keywords.
//! Queries that pass always leave with an explicit, bounded LIMIT.

use crate::config::SafetyLimits;
use crate::error::{BiError, ErrorKind, Result};
use crate::guardrail::allowlist::Allowlist;
use crate::guardrail::deny;
use crate::guardrail::lexer::{has_ambiguous_escape, lex, render, Lexeme};
use serde::{Deserialize, Serialize};
use sqlparser::tokenizer::Token;
use tracing::debug;

type Check<T> = std::result::Result<T, String>;

/// Functions whose argument syntax uses FROM without naming a relation
const FROM_TAKING_FUNCTIONS: &[&str] = &["EXTRACT", "SUBSTRING", "SUBSTR", "TRIM", "POSITION", "OVERLAY"];

/// Words that end a relation reference, so they are never read as an alias
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "NATURAL", "ON", "USING",
    "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "FETCH", "UNION", "EXCEPT", "INTERSECT", "MINUS",
    "WINDOW", "QUALIFY", "FOR", "TABLESAMPLE", "SAMPLE", "PIVOT", "UNPIVOT", "LATERAL", "WITH",
];

/// Words that close a FROM clause at its own depth
const FROM_TERMINATORS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "FETCH", "UNION", "EXCEPT", "INTERSECT",
    "MINUS", "WINDOW", "QUALIFY", "FOR",
];

/// A common table expression name and the lexeme range where it is visible.
#[derive(Debug, Clone)]
struct CteScope {
    name: String,
    start: usize,
    end: usize,
}

impl CteScope {
    fn covers(&self, name: &str, at: usize) -> bool {
        at >= self.start && at < self.end && self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateQuery {
    pub raw_text: String,
    pub declared_row_limit: Option<u64>,
}

impl CandidateQuery {
    pub fn new(raw_text: impl Into<String>) -> Self {
        Self {
            raw_text: raw_text.into(),
            declared_row_limit: None,
        }
    }

    pub fn with_row_limit(mut self, limit: u64) -> Self {
        self.declared_row_limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ValidationVerdict {
    Allowed {
        normalized_sql: String,
        enforced_row_limit: u64,
    },
    Rejected {
        reason: ErrorKind,
        detail: String,
    },
}

impl ValidationVerdict {
    fn rejected(reason: ErrorKind, detail: impl Into<String>) -> Self {
        ValidationVerdict::Rejected {
            reason,
            detail: detail.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, ValidationVerdict::Allowed { .. })
    }

    /// `(normalized_sql, enforced_row_limit)` or the rejection as an error.
    pub fn into_result(self) -> Result<(String, u64)> {
        match self {
            ValidationVerdict::Allowed {
                normalized_sql,
                enforced_row_limit,
            } => Ok((normalized_sql, enforced_row_limit)),
            ValidationVerdict::Rejected { reason, detail } => Err(BiError::Rejected { kind: reason, detail }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Guardrail {
    max_rows: u64,
    default_limit: u64,
}

impl Guardrail {
    pub fn new(max_rows: u64, default_limit: u64) -> Self {
        Self {
            max_rows,
            default_limit: default_limit.max(1).min(max_rows),
        }
    }

    pub fn from_limits(limits: &SafetyLimits) -> Self {
        Self::new(limits.max_rows, limits.effective_default_limit())
    }

    pub fn max_rows(&self) -> u64 {
        self.max_rows
    }

    pub fn default_limit(&self) -> u64 {
        self.default_limit
    }

    pub fn validate(&self, candidate: &CandidateQuery, allowlist: &Allowlist) -> ValidationVerdict {
        let verdict = self.check(candidate, allowlist);
        if let ValidationVerdict::Rejected { reason, detail } = &verdict {
            debug!("Guardrail rejected query ({}): {}", reason, detail);
        }
        verdict
    }

    /// Runs the checks, then runs them again on the normalized SQL: what leaves
    /// the guardrail must be exactly what was validated.
    fn check(&self, candidate: &CandidateQuery, allowlist: &Allowlist) -> ValidationVerdict {
        let verdict = self.evaluate(candidate, allowlist);
        let ValidationVerdict::Allowed { normalized_sql, .. } = &verdict else {
            return verdict;
        };
        match self.evaluate(&CandidateQuery::new(normalized_sql.clone()), allowlist) {
            ValidationVerdict::Allowed {
                normalized_sql: again, ..
            } if &again == normalized_sql => verdict,
            _ => ValidationVerdict::rejected(
                ErrorKind::NotSelect,
                "query does not keep its meaning after normalization",
            ),
        }
    }

    fn evaluate(&self, candidate: &CandidateQuery, allowlist: &Allowlist) -> ValidationVerdict {
        let lexemes = match lex(&candidate.raw_text) {
            Ok(lexemes) => lexemes,
            Err(e) => return ValidationVerdict::rejected(ErrorKind::NotSelect, e.to_string()),
        };
        if let Some(literal) = lexemes.iter().find(|l| has_ambiguous_escape(l)) {
            return ValidationVerdict::rejected(
                ErrorKind::NotSelect,
                format!("string literal {} mixes backslashes and quotes", render(std::slice::from_ref(literal))),
            );
        }

        let ctes = match classify(&lexemes) {
            Ok(ctes) => ctes,
            Err(detail) => return ValidationVerdict::rejected(ErrorKind::NotSelect, detail),
        };

        if let Err(detail) = check_relations(&lexemes, &ctes, allowlist) {
            return ValidationVerdict::rejected(ErrorKind::SchemaViolation, detail);
        }

        if let Some(name) = find_blocked_function(&lexemes) {
            return ValidationVerdict::rejected(
                ErrorKind::BlockedFunction,
                format!("function '{}' is not allowed", name),
            );
        }

        if let Some(word) = lexemes.iter().filter_map(Lexeme::keyword).find(|w| deny::is_blocked_keyword(w)) {
            return ValidationVerdict::rejected(ErrorKind::BlockedKeyword, format!("keyword {} is not allowed", word));
        }

        let (normalized_sql, enforced_row_limit) = self.enforce_limit(&lexemes, candidate.declared_row_limit);
        ValidationVerdict::Allowed {
            normalized_sql,
            enforced_row_limit,
        }
    }

    /// Drop any top-level LIMIT or FETCH clause and emit a single bounded LIMIT,
    /// placed before a top-level OFFSET when there is one.
    fn enforce_limit(&self, lexemes: &[Lexeme], declared: Option<u64>) -> (String, u64) {
        let mut requested = declared;
        let mut removed: Vec<(usize, usize)> = Vec::new();

        if let Some(pos) = lexemes.iter().rposition(|l| l.depth == 0 && l.is_keyword("LIMIT")) {
            let end = clause_end(lexemes, pos + 1);
            match literal_limit(&lexemes[pos + 1..end]) {
                Some(n) => requested = Some(requested.map_or(n, |d| d.min(n))),
                None => debug!("Replacing non-literal LIMIT with the default"),
            }
            removed.push((pos, end));
        }

        if let Some(pos) = lexemes.iter().position(|l| l.depth == 0 && l.is_keyword("FETCH")) {
            let end = lexemes[pos..]
                .iter()
                .position(|l| l.depth == 0 && (l.is_keyword("ONLY") || l.is_keyword("TIES")))
                .map_or(lexemes.len(), |offset| pos + offset + 1);
            let n = lexemes[pos..end]
                .iter()
                .find_map(|l| match &l.token {
                    Token::Number(value, _) => value.parse::<u64>().ok(),
                    _ => None,
                })
                .unwrap_or(1);
            requested = Some(requested.map_or(n, |d| d.min(n)));
            removed.push((pos, end));
        }

        let enforced = match requested {
            Some(n) => n.min(self.max_rows),
            None => self.default_limit,
        };

        let kept: Vec<Lexeme> = lexemes
            .iter()
            .enumerate()
            .filter(|(i, _)| !removed.iter().any(|(start, end)| i >= start && i < end))
            .map(|(_, l)| l.clone())
            .collect();
        let insert_at = kept
            .iter()
            .position(|l| l.depth == 0 && l.is_keyword("OFFSET"))
            .unwrap_or(kept.len());

        let mut sql = render(&kept[..insert_at]);
        sql.push_str(&format!(" LIMIT {}", enforced));
        if insert_at < kept.len() {
            sql.push(' ');
            sql.push_str(&render(&kept[insert_at..]));
        }
        (sql, enforced)
    }
}

fn token_at(lexemes: &[Lexeme], i: usize) -> Option<&Token> {
    lexemes.get(i).map(|l| &l.token)
}

fn keyword_at(lexemes: &[Lexeme], i: usize, keyword: &str) -> bool {
    lexemes.get(i).map_or(false, |l| l.is_keyword(keyword))
}

fn skip_lparens(lexemes: &[Lexeme], mut i: usize) -> usize {
    while matches!(token_at(lexemes, i), Some(Token::LParen)) {
        i += 1;
    }
    i
}

fn matching_paren(lexemes: &[Lexeme], open: usize) -> Check<usize> {
    let depth = lexemes[open].depth;
    lexemes[open + 1..]
        .iter()
        .position(|l| l.depth == depth && matches!(l.token, Token::RParen))
        .map(|offset| open + 1 + offset)
        .ok_or_else(|| "unbalanced parentheses".to_string())
}

fn starts_query(lexemes: &[Lexeme], i: usize) -> bool {
    let i = skip_lparens(lexemes, i);
    keyword_at(lexemes, i, "SELECT") || keyword_at(lexemes, i, "WITH")
}

/// Accepts exactly one read-only query and returns the CTE names it defines,
/// each scoped to the query block that declares it.
fn classify(lexemes: &[Lexeme]) -> Check<Vec<CteScope>> {
    if lexemes.iter().any(|l| matches!(l.token, Token::SemiColon)) {
        return Err("multiple statements are not allowed".to_string());
    }

    let start = skip_lparens(lexemes, 0);
    match lexemes.get(start).and_then(Lexeme::keyword).as_deref() {
        Some("SELECT") | Some("WITH") => {}
        Some(other) => return Err(format!("only SELECT queries are allowed, found {}", other)),
        None => return Err("statement is not a SELECT query".to_string()),
    }

    if lexemes.iter().any(|l| l.is_keyword("INTO")) {
        return Err("SELECT ... INTO is not allowed".to_string());
    }

    let mut ctes = Vec::new();
    for (idx, lexeme) in lexemes.iter().enumerate() {
        if !lexeme.is_keyword("WITH") {
            continue;
        }
        // WITH TIES and similar modifiers do not open a query
        if idx != start && !matches!(lexemes[idx - 1].token, Token::LParen) {
            continue;
        }
        // The block runs until its enclosing parenthesis closes.
        let depth = lexeme.depth;
        let block_end = lexemes[idx + 1..]
            .iter()
            .position(|l| l.depth < depth)
            .map_or(lexemes.len(), |offset| idx + 1 + offset);
        let end = parse_with(lexemes, idx + 1, block_end, &mut ctes)?;
        if !keyword_at(lexemes, skip_lparens(lexemes, end), "SELECT") {
            return Err("WITH must be followed by a SELECT query".to_string());
        }
    }
    Ok(ctes)
}

/// Parses `[RECURSIVE] name [(cols)] AS [NOT] [MATERIALIZED] (query) [, ...]`,
/// returning the index after the last definition.
///
/// A name is visible from the end of its own definition (from the name itself
/// when RECURSIVE) to `block_end`; inside its own body a plain CTE name still
/// refers to the real relation.
fn parse_with(lexemes: &[Lexeme], mut i: usize, block_end: usize, ctes: &mut Vec<CteScope>) -> Check<usize> {
    let recursive = keyword_at(lexemes, i, "RECURSIVE");
    if recursive {
        i += 1;
    }
    loop {
        let name_at = i;
        let name = lexemes
            .get(i)
            .and_then(Lexeme::ident)
            .ok_or_else(|| "expected a common table expression name after WITH".to_string())?;
        i += 1;

        if matches!(token_at(lexemes, i), Some(Token::LParen)) {
            i = matching_paren(lexemes, i)? + 1;
        }
        if !keyword_at(lexemes, i, "AS") {
            return Err(format!("expected AS after common table expression {}", name));
        }
        i += 1;
        if keyword_at(lexemes, i, "NOT") {
            i += 1;
        }
        if keyword_at(lexemes, i, "MATERIALIZED") {
            i += 1;
        }
        if !matches!(token_at(lexemes, i), Some(Token::LParen)) {
            return Err(format!("expected a parenthesized query for {}", name));
        }
        if !starts_query(lexemes, i + 1) {
            return Err(format!("common table expression {} must be a SELECT query", name));
        }
        i = matching_paren(lexemes, i)? + 1;
        ctes.push(CteScope {
            name: name.to_string(),
            start: if recursive { name_at } else { i },
            end: block_end,
        });

        if matches!(token_at(lexemes, i), Some(Token::Comma)) {
            i += 1;
            continue;
        }
        return Ok(i);
    }
}

fn introduces_relation(lexemes: &[Lexeme], i: usize) -> bool {
    let lexeme = &lexemes[i];
    if lexeme.is_keyword("JOIN") {
        return true;
    }
    if !lexeme.is_keyword("FROM") {
        return false;
    }
    // EXTRACT(YEAR FROM d), a IS DISTINCT FROM b
    let in_function = lexeme
        .group_owner
        .as_deref()
        .map_or(false, |owner| FROM_TAKING_FUNCTIONS.contains(&owner));
    let after_distinct = i > 0 && lexemes[i - 1].is_keyword("DISTINCT");
    !in_function && !after_distinct
}

/// Checks every relation a FROM or JOIN introduces.
///
/// After FROM the whole clause is scanned at its own depth, so items listed
/// after a `JOIN ... ON ...` condition are checked too. JOIN targets are
/// reached by their own JOIN keyword.
fn check_relations(lexemes: &[Lexeme], ctes: &[CteScope], allowlist: &Allowlist) -> Check<()> {
    for i in 0..lexemes.len() {
        if !introduces_relation(lexemes, i) {
            continue;
        }
        let mut j = check_relation_at(lexemes, i + 1, ctes, allowlist)?;
        if !lexemes[i].is_keyword("FROM") {
            continue;
        }
        let depth = lexemes[i].depth;
        while let Some(lexeme) = lexemes.get(j) {
            if lexeme.depth < depth {
                break;
            }
            if lexeme.depth == depth {
                if lexeme.keyword().map_or(false, |w| FROM_TERMINATORS.contains(&w.as_str())) {
                    break;
                }
                if matches!(lexeme.token, Token::Comma) {
                    j = check_relation_at(lexemes, j + 1, ctes, allowlist)?.max(j + 1);
                    continue;
                }
            }
            j += 1;
        }
    }
    Ok(())
}

/// Checks the relation starting at `i` and returns the index after it and its alias.
fn check_relation_at(lexemes: &[Lexeme], mut i: usize, ctes: &[CteScope], allowlist: &Allowlist) -> Check<usize> {
    while keyword_at(lexemes, i, "LATERAL") || keyword_at(lexemes, i, "ONLY") {
        i += 1;
    }
    let lexeme = match lexemes.get(i) {
        Some(lexeme) => lexeme,
        None => return Ok(i),
    };

    if lexeme.is_string_literal() {
        return Err(format!("{} cannot be used as a relation", render(std::slice::from_ref(lexeme))));
    }

    match &lexeme.token {
        Token::LParen => {
            let close = matching_paren(lexemes, i)?;
            // (a JOIN b): the first member has no FROM/JOIN of its own
            let inner = i + 1;
            if matches!(token_at(lexemes, inner), Some(Token::Word(_)))
                && !starts_query(lexemes, inner)
                && !keyword_at(lexemes, inner, "VALUES")
            {
                check_relation_at(lexemes, inner, ctes, allowlist)?;
            }
            Ok(skip_alias(lexemes, close + 1))
        }
        Token::Word(_) => {
            let (name, next) = dotted_name(lexemes, i);
            if matches!(token_at(lexemes, next), Some(Token::LParen)) {
                check_table_function(lexemes, &name, next)?;
                let close = matching_paren(lexemes, next)?;
                return Ok(skip_alias(lexemes, close + 1));
            }
            let is_cte = !name.contains('.') && ctes.iter().any(|scope| scope.covers(&name, i));
            if !is_cte && !allowlist.permits(&name) {
                return Err(format!("relation '{}' is not in the allowed schema", name));
            }
            Ok(skip_alias(lexemes, next))
        }
        _ => Ok(i),
    }
}

/// `name(...)` used as a relation: a listed row generator, `TABLE(generator(...))`,
/// or a deny-listed function left for the function check to report.
fn check_table_function(lexemes: &[Lexeme], name: &str, open: usize) -> Check<()> {
    let short = name.rsplit('.').next().unwrap_or(name);
    if deny::is_blocked_function(short) || deny::is_permitted_table_function(short) {
        return Ok(());
    }
    if short.eq_ignore_ascii_case("TABLE") && lexemes.get(open + 1).and_then(Lexeme::ident).is_some() {
        let (inner, after) = dotted_name(lexemes, open + 1);
        if matches!(token_at(lexemes, after), Some(Token::LParen)) {
            return check_table_function(lexemes, &inner, after);
        }
    }
    Err(format!("table function '{}' is not allowed as a relation", name))
}

fn dotted_name(lexemes: &[Lexeme], i: usize) -> (String, usize) {
    let mut parts: Vec<&str> = lexemes[i].ident().into_iter().collect();
    let mut next = i + 1;
    while matches!(token_at(lexemes, next), Some(Token::Period)) {
        match lexemes.get(next + 1).and_then(Lexeme::ident) {
            Some(part) => {
                parts.push(part);
                next += 2;
            }
            None => break,
        }
    }
    (parts.join("."), next)
}

fn skip_alias(lexemes: &[Lexeme], mut i: usize) -> usize {
    let mut aliased = false;
    if keyword_at(lexemes, i, "AS") {
        i += 1;
        if lexemes.get(i).and_then(Lexeme::ident).is_some() {
            i += 1;
            aliased = true;
        }
    } else if let Some(Token::Word(w)) = token_at(lexemes, i) {
        let is_clause = w.quote_style.is_none() && CLAUSE_KEYWORDS.contains(&w.value.to_uppercase().as_str());
        if !is_clause {
            i += 1;
            aliased = true;
        }
    }
    // t AS x(a, b)
    if aliased && matches!(token_at(lexemes, i), Some(Token::LParen)) {
        if let Ok(close) = matching_paren(lexemes, i) {
            i = close + 1;
        }
    }
    i
}

fn find_blocked_function(lexemes: &[Lexeme]) -> Option<String> {
    lexemes.windows(2).find_map(|pair| match (&pair[0].token, &pair[1].token) {
        (Token::Word(w), Token::LParen) if deny::is_blocked_function(&w.value) => Some(w.value.clone()),
        _ => None,
    })
}

/// End of a top-level LIMIT expression.
fn clause_end(lexemes: &[Lexeme], from: usize) -> usize {
    lexemes[from..]
        .iter()
        .position(|l| l.depth == 0 && (l.is_keyword("OFFSET") || l.is_keyword("FETCH") || l.is_keyword("FOR")))
        .map_or(lexemes.len(), |offset| from + offset)
}

fn literal_limit(expr: &[Lexeme]) -> Option<u64> {
    match expr {
        [only] => match &only.token {
            Token::Number(value, _) => value.parse::<u64>().ok(),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guardrail() -> Guardrail {
        Guardrail::new(10_000, 1_000)
    }

    fn allow() -> Allowlist {
        Allowlist::new(["main.employees", "main.departments"]).with_reference_patterns(&["seeds.*"])
    }

    fn check(sql: &str) -> ValidationVerdict {
        guardrail().validate(&CandidateQuery::new(sql), &allow())
    }

    fn reason(sql: &str) -> ErrorKind {
        match check(sql) {
            ValidationVerdict::Rejected { reason, .. } => reason,
            allowed => panic!("expected rejection for {}, got {:?}", sql, allowed),
        }
    }

    fn allowed(sql: &str) -> (String, u64) {
        check(sql).into_result().unwrap()
    }

    #[test]
    fn test_headcount_query_gets_default_limit() {
        let (sql, limit) = allowed(
            "SELECT department, COUNT(*) AS headcount FROM main.employees WHERE status = 'active' GROUP BY department",
        );
        assert_eq!(
            sql,
            "SELECT department, COUNT(*) AS headcount FROM main.employees WHERE status = 'active' GROUP BY department LIMIT 1000"
        );
        assert_eq!(limit, 1000);
    }

    #[test]
    fn test_write_statements_are_not_select() {
        assert_eq!(reason("DELETE FROM main.employees"), ErrorKind::NotSelect);
        assert_eq!(reason("UPDATE main.employees SET status = 'x'"), ErrorKind::NotSelect);
        assert_eq!(reason("DROP TABLE main.employees"), ErrorKind::NotSelect);
        assert_eq!(reason("BEGIN"), ErrorKind::NotSelect);
        assert_eq!(reason("SELECT * INTO backup FROM main.employees"), ErrorKind::NotSelect);
    }

    #[test]
    fn test_declared_limits() {
        assert_eq!(allowed("SELECT * FROM main.employees LIMIT 500"), ("SELECT * FROM main.employees LIMIT 500".to_string(), 500));
        assert_eq!(allowed("SELECT * FROM main.employees LIMIT 50000").1, 10_000);
        assert_eq!(allowed("SELECT * FROM main.employees LIMIT ALL").0, "SELECT * FROM main.employees LIMIT 1000");

        let g = guardrail();
        let verdict = g.validate(&CandidateQuery::new("SELECT * FROM main.employees").with_row_limit(20), &allow());
        assert_eq!(verdict.into_result().unwrap().1, 20);
        let verdict = g.validate(&CandidateQuery::new("SELECT * FROM main.employees LIMIT 100").with_row_limit(20_000), &allow());
        assert_eq!(verdict.into_result().unwrap().1, 100);
    }

    #[test]
    fn test_limit_goes_before_offset() {
        assert_eq!(
            allowed("SELECT * FROM main.employees ORDER BY id OFFSET 20").0,
            "SELECT * FROM main.employees ORDER BY id LIMIT 1000 OFFSET 20"
        );
        assert_eq!(
            allowed("SELECT * FROM main.employees ORDER BY id OFFSET 20 LIMIT 5").0,
            "SELECT * FROM main.employees ORDER BY id LIMIT 5 OFFSET 20"
        );
    }

    #[test]
    fn test_fetch_first_becomes_limit() {
        assert_eq!(
            allowed("SELECT * FROM main.employees FETCH FIRST 5 ROWS ONLY"),
            ("SELECT * FROM main.employees LIMIT 5".to_string(), 5)
        );
    }

    #[test]
    fn test_inner_limit_untouched() {
        assert_eq!(
            allowed("SELECT * FROM (SELECT * FROM main.employees LIMIT 5) t").0,
            "SELECT * FROM (SELECT * FROM main.employees LIMIT 5) t LIMIT 1000"
        );
    }

    #[test]
    fn test_empty_and_malformed_input() {
        assert_eq!(reason(""), ErrorKind::NotSelect);
        assert_eq!(reason("   \n "), ErrorKind::NotSelect);
        assert_eq!(reason("SELECT 'unterminated FROM main.employees"), ErrorKind::NotSelect);
    }

    #[test]
    fn test_blocked_functions() {
        assert_eq!(reason("SELECT LOAD_FILE('/etc/passwd') FROM main.employees"), ErrorKind::BlockedFunction);
        assert_eq!(reason("SELECT * FROM read_csv_auto('/tmp/x.csv')"), ErrorKind::BlockedFunction);
        assert_eq!(reason("SELECT pg_catalog.Pg_Read_File('x')"), ErrorKind::BlockedFunction);
    }

    #[test]
    fn test_string_relation_is_schema_violation() {
        assert_eq!(reason("SELECT * FROM 'data.csv'"), ErrorKind::SchemaViolation);
    }

    #[test]
    fn test_union_cte_and_subquery_allowed() {
        assert!(check("SELECT department FROM main.employees UNION SELECT name FROM seeds.departments").is_allowed());
        assert!(check(
            "WITH active AS (SELECT * FROM main.employees WHERE status = 'active') \
             SELECT department, COUNT(*) FROM active GROUP BY department"
        )
        .is_allowed());
        assert!(check(
            "SELECT * FROM (SELECT department FROM main.employees) sub \
             WHERE department IN (SELECT name FROM main.departments)"
        )
        .is_allowed());
        assert!(check("SELECT e.name, d.name FROM main.employees e LEFT JOIN main.departments AS d ON e.dept_id = d.id").is_allowed());
        assert!(check("SELECT a.id FROM main.employees a, main.departments b").is_allowed());
    }

    #[test]
    fn test_function_syntax_from_is_not_a_relation() {
        assert!(check("SELECT EXTRACT(YEAR FROM hire_date) AS y FROM main.employees").is_allowed());
        assert!(check("SELECT * FROM main.employees WHERE a IS DISTINCT FROM b").is_allowed());
    }

    #[test]
    fn test_case_insensitive_keywords() {
        assert!(check("select * from main.employees").is_allowed());
        assert_eq!(reason("SELECT id FROM main.employees FOR update"), ErrorKind::BlockedKeyword);
        assert_eq!(reason("dElEtE FROM main.employees"), ErrorKind::NotSelect);
    }

    #[test]
    fn test_literals_and_quoted_identifiers_do_not_match() {
        let (sql, _) = allowed("SELECT * FROM main.employees WHERE notes = 'please DROP by; DELETE later'");
        assert!(sql.contains("'please DROP by; DELETE later'"));
        assert!(check("SELECT \"delete\" FROM main.employees").is_allowed());
    }

    #[test]
    fn test_comments_are_stripped() {
        assert_eq!(
            allowed("SELECT * FROM main.employees /* ; DROP TABLE x */ -- and more").0,
            "SELECT * FROM main.employees LIMIT 1000"
        );
    }

    #[test]
    fn test_multi_statement_rejected() {
        assert_eq!(reason("SELECT 1 FROM main.employees; DROP TABLE main.employees"), ErrorKind::NotSelect);
        assert!(check("SELECT 1 FROM main.employees;").is_allowed());
    }

    #[test]
    fn test_unlisted_relations() {
        assert_eq!(reason("SELECT * FROM internal.secrets"), ErrorKind::SchemaViolation);
        assert_eq!(reason("SELECT * FROM MAIN.EMPLOYEES"), ErrorKind::SchemaViolation);
        assert_eq!(reason("SELECT * FROM employees"), ErrorKind::SchemaViolation);
        assert_eq!(
            reason("SELECT * FROM main.employees e JOIN internal.secrets s ON e.id = s.id"),
            ErrorKind::SchemaViolation
        );
    }

    #[test]
    fn test_fail_fast_order() {
        assert_eq!(reason("DELETE FROM internal.secrets"), ErrorKind::NotSelect);
        assert_eq!(reason("SELECT load_file('x') FROM internal.secrets"), ErrorKind::SchemaViolation);
        assert_eq!(reason("SELECT load_file('x') FROM main.employees FOR UPDATE"), ErrorKind::BlockedFunction);
    }

    #[test]
    fn test_data_modifying_cte_rejected() {
        assert_eq!(
            reason("WITH gone AS (DELETE FROM main.employees RETURNING *) SELECT * FROM gone"),
            ErrorKind::NotSelect
        );
    }

    #[test]
    fn test_revalidation_is_idempotent() {
        let g = guardrail();
        for sql in [
            "SELECT department, COUNT(*) FROM main.employees GROUP BY department",
            "select  *  from main.employees order by id offset 3",
            "SELECT * FROM main.employees LIMIT 99999",
            "SELECT name FROM main.employees WHERE name = 'O''Brien'",
            "SELECT N'café''s' AS v FROM main.employees",
            r"SELECT E'tab\there\\' AS v FROM main.employees",
            "SELECT $q$it's$q$ AS v FROM main.employees",
            r"SELECT R'\d+', B'0101', X'ff' FROM main.employees",
        ] {
            let first = g.validate(&CandidateQuery::new(sql), &allow());
            let ValidationVerdict::Allowed { normalized_sql, .. } = first.clone() else {
                panic!("expected {} to be allowed", sql);
            };
            let second = g.validate(&CandidateQuery::new(normalized_sql), &allow());
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_every_from_item_is_checked() {
        assert_eq!(
            reason("SELECT * FROM main.employees e JOIN main.departments d ON e.id = d.id, internal.secrets s"),
            ErrorKind::SchemaViolation
        );
        assert_eq!(
            reason("SELECT * FROM main.employees e CROSS JOIN main.departments d, main.departments x, internal.secrets s"),
            ErrorKind::SchemaViolation
        );
        assert!(check(
            "SELECT * FROM main.employees e JOIN main.departments d ON e.id = d.id, seeds.regions r \
             WHERE r.id IN (1, 2) ORDER BY e.id, d.id"
        )
        .is_allowed());
    }

    #[test]
    fn test_cte_names_are_scoped_to_their_query() {
        let g = Guardrail::new(10_000, 1_000);
        let with_secrets = Allowlist::new(["main.employees"]);
        let verdict = g.validate(
            &CandidateQuery::new("SELECT * FROM secrets, (WITH secrets AS (SELECT 1 AS x) SELECT * FROM secrets) q"),
            &with_secrets,
        );
        assert!(matches!(verdict, ValidationVerdict::Rejected { reason: ErrorKind::SchemaViolation, .. }));

        assert_eq!(reason("WITH secrets AS (SELECT * FROM secrets) SELECT * FROM secrets"), ErrorKind::SchemaViolation);
        assert_eq!(
            reason("WITH a AS (SELECT * FROM b), b AS (SELECT * FROM main.employees) SELECT * FROM a"),
            ErrorKind::SchemaViolation
        );
        assert!(check(
            "WITH a AS (SELECT * FROM main.employees), b AS (SELECT * FROM a) SELECT * FROM b"
        )
        .is_allowed());
        assert!(check(
            "WITH RECURSIVE chain AS (SELECT id, manager_id FROM main.employees \
             UNION ALL SELECT c.id, e.manager_id FROM chain c JOIN main.employees e ON e.id = c.manager_id) \
             SELECT * FROM chain"
        )
        .is_allowed());
    }

    #[test]
    fn test_table_functions_in_from() {
        assert_eq!(reason("SELECT * FROM pragma_table_info('secrets')"), ErrorKind::BlockedFunction);
        assert_eq!(reason("SELECT name FROM main.pragma_table_list()"), ErrorKind::BlockedFunction);
        assert_eq!(reason("SELECT * FROM sqlite_dbpage('main')"), ErrorKind::SchemaViolation);
        assert_eq!(reason("SELECT * FROM TABLE(information_schema.query_history())"), ErrorKind::SchemaViolation);
        assert!(check("SELECT * FROM generate_series(1, 10) g").is_allowed());
        assert!(check("SELECT e.id, t FROM main.employees e, UNNEST(e.tags) AS t").is_allowed());
        assert!(check("SELECT * FROM TABLE(SPLIT_TO_TABLE('a,b', ','))").is_allowed());
    }

    #[test]
    fn test_prefixed_literals_stay_literals() {
        assert_eq!(
            allowed("SELECT N'x'' FROM internal.secrets --' AS v FROM main.employees").0,
            "SELECT N'x'' FROM internal.secrets --' AS v FROM main.employees LIMIT 1000"
        );
        assert_eq!(
            allowed(r"SELECT E'a\' FROM internal.secrets --' AS v FROM main.employees").0,
            "SELECT E'a'' FROM internal.secrets --' AS v FROM main.employees LIMIT 1000"
        );
    }

    #[test]
    fn test_backslash_quoted_literals_rejected() {
        assert_eq!(
            reason(r"SELECT 'a\'' FROM internal.secrets --' AS v FROM main.employees"),
            ErrorKind::NotSelect
        );
        assert_eq!(reason(r"SELECT 'dir\' AS v FROM main.employees"), ErrorKind::NotSelect);
        assert!(check(r"SELECT * FROM main.employees WHERE path = 'C:\data\x.csv'").is_allowed());
    }

    #[test]
    fn test_limit_never_exceeds_max() {
        let g = Guardrail::new(50, 1_000);
        assert_eq!(g.default_limit(), 50);
        let (_, limit) = g
            .validate(&CandidateQuery::new("SELECT * FROM main.employees"), &allow())
            .into_result()
            .unwrap();
        assert_eq!(limit, 50);
    }
}
