//! Literal-aware SQL lexing
//!
//! Wraps the `sqlparser` tokenizer: comments and whitespace are dropped (each
//! run remembered as a single separating space), string literals and quoted
//! identifiers stay opaque tokens, and every token records its parenthesis
//! depth and the function or keyword owning its enclosing group.

use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

#[derive(Debug, Clone)]
pub struct Lexeme {
    pub token: Token,
    /// Parenthesis depth; 0 is the statement's top level
    pub depth: usize,
    /// Uppercased word immediately before the innermost open parenthesis
    pub group_owner: Option<String>,
    /// Whitespace or a comment preceded this token in the source
    pub space_before: bool,
}

impl Lexeme {
    /// Uppercased value of an unquoted word.
    pub fn keyword(&self) -> Option<String> {
        match &self.token {
            Token::Word(w) if w.quote_style.is_none() => Some(w.value.to_uppercase()),
            _ => None,
        }
    }

    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.token, Token::Word(w) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case(keyword))
    }

    /// Identifier value of a word, quoted or not.
    pub fn ident(&self) -> Option<&str> {
        match &self.token {
            Token::Word(w) => Some(w.value.as_str()),
            _ => None,
        }
    }

    pub fn is_string_literal(&self) -> bool {
        matches!(
            self.token,
            Token::SingleQuotedString(_)
                | Token::DoubleQuotedString(_)
                | Token::NationalStringLiteral(_)
                | Token::EscapedStringLiteral(_)
                | Token::DollarQuotedString(_)
                | Token::SingleQuotedByteStringLiteral(_)
                | Token::DoubleQuotedByteStringLiteral(_)
                | Token::RawStringLiteral(_)
                | Token::HexStringLiteral(_)
        )
    }
}

#[derive(Debug)]
pub enum LexError {
    Empty,
    Tokenize(String),
    UnbalancedParens,
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LexError::Empty => write!(f, "empty query"),
            LexError::Tokenize(msg) => write!(f, "could not tokenize query: {}", msg),
            LexError::UnbalancedParens => write!(f, "unbalanced parentheses"),
        }
    }
}

/// Tokenize `sql` into significant lexemes. One trailing `;` is dropped.
pub fn lex(sql: &str) -> Result<Vec<Lexeme>, LexError> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| LexError::Tokenize(e.to_string()))?;

    let mut lexemes: Vec<Lexeme> = Vec::with_capacity(tokens.len());
    let mut owners: Vec<Option<String>> = Vec::new();
    let mut pending_space = false;

    for token in tokens {
        match token {
            Token::Whitespace(_) => {
                pending_space = true;
                continue;
            }
            Token::EOF => break,
            _ => {}
        }

        let space_before = pending_space && !lexemes.is_empty();
        pending_space = false;

        match token {
            Token::LParen => {
                let owner = lexemes.last().and_then(|l| match &l.token {
                    Token::Word(w) => Some(w.value.to_uppercase()),
                    _ => None,
                });
                lexemes.push(Lexeme {
                    token: Token::LParen,
                    depth: owners.len(),
                    group_owner: owners.last().cloned().flatten(),
                    space_before,
                });
                owners.push(owner);
            }
            Token::RParen => {
                if owners.pop().is_none() {
                    return Err(LexError::UnbalancedParens);
                }
                lexemes.push(Lexeme {
                    token: Token::RParen,
                    depth: owners.len(),
                    group_owner: owners.last().cloned().flatten(),
                    space_before,
                });
            }
            token => lexemes.push(Lexeme {
                token,
                depth: owners.len(),
                group_owner: owners.last().cloned().flatten(),
                space_before,
            }),
        }
    }

    if !owners.is_empty() {
        return Err(LexError::UnbalancedParens);
    }
    if matches!(lexemes.last().map(|l| &l.token), Some(Token::SemiColon)) {
        lexemes.pop();
    }
    if lexemes.is_empty() {
        return Err(LexError::Empty);
    }
    Ok(lexemes)
}

fn quote_ident(value: &str, quote: char) -> String {
    let close = match quote {
        '[' => ']',
        other => other,
    };
    let escaped = value.replace(close, &format!("{}{}", close, close));
    format!("{}{}{}", quote, escaped, close)
}

/// `'...'` with the quote doubled, behind an optional prefix.
fn quote_literal(prefix: &str, value: &str, quote: char) -> String {
    let escaped = value.replace(quote, &format!("{}{}", quote, quote));
    format!("{}{}{}{}", prefix, quote, escaped, quote)
}

/// E'...' bodies: backslashes and control characters become escapes again.
fn escape_backslashes(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("''"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    format!("E'{}'", out)
}

fn render_token(token: &Token) -> String {
    match token {
        Token::Word(w) => match w.quote_style {
            Some(q) => quote_ident(&w.value, q),
            None => w.value.clone(),
        },
        Token::SingleQuotedString(s) => quote_literal("", s, '\''),
        Token::DoubleQuotedString(s) => quote_literal("", s, '"'),
        Token::NationalStringLiteral(s) => quote_literal("N", s, '\''),
        Token::EscapedStringLiteral(s) => escape_backslashes(s),
        Token::HexStringLiteral(s) => quote_literal("X", s, '\''),
        Token::SingleQuotedByteStringLiteral(s) => quote_literal("B", s, '\''),
        Token::DoubleQuotedByteStringLiteral(s) => quote_literal("B", s, '"'),
        Token::RawStringLiteral(s) => quote_literal("R", s, '\''),
        other => other.to_string(),
    }
}

/// Literal text whose end depends on the dialect's backslash rules.
///
/// Plain literals are read without backslash escapes here, while several
/// warehouses treat `\'` as an escaped quote; such a literal could end at a
/// different place on the backend than it did during validation.
pub fn has_ambiguous_escape(lexeme: &Lexeme) -> bool {
    let (value, quote) = match &lexeme.token {
        Token::SingleQuotedString(s)
        | Token::NationalStringLiteral(s)
        | Token::SingleQuotedByteStringLiteral(s)
        | Token::RawStringLiteral(s) => (s, '\''),
        Token::DoubleQuotedString(s) | Token::DoubleQuotedByteStringLiteral(s) => (s, '"'),
        _ => return false,
    };
    value.contains('\\') && (value.contains(quote) || value.ends_with('\\'))
}

/// Render lexemes back to SQL, one space wherever the source had whitespace or a comment.
pub fn render(lexemes: &[Lexeme]) -> String {
    let mut out = String::new();
    for (i, lexeme) in lexemes.iter().enumerate() {
        if i > 0 && lexeme.space_before {
            out.push(' ');
        }
        out.push_str(&render_token(&lexeme.token));
    }
    out
}
