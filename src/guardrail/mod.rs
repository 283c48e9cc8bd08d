//! Guardrail - literal-aware validation of generated SQL
//!
//! Pure and synchronous. See `validator` for the check order.

pub mod allowlist;
pub mod deny;
pub mod lexer;
pub mod validator;

pub use allowlist::Allowlist;
pub use validator::{CandidateQuery, Guardrail, ValidationVerdict};
