//! Credential scrubbing for warehouse error messages

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref BEARER: Regex = Regex::new(r"(?i)bearer\s+\S+").unwrap();
    static ref SECRET_PAIR: Regex =
        Regex::new(r#"(?i)\b(password|passwd|pwd|token|access_token|api_key|apikey|key|secret)\s*[=:]\s*("[^"]*"|'[^']*'|[^\s&;,]+)"#)
            .unwrap();
}

const MASK: &str = "***";

/// Removes configured secrets and credential-looking fragments from text.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new(secrets: Vec<String>) -> Self {
        // Longest first so a secret containing another is masked whole.
        let mut secrets: Vec<String> = secrets.into_iter().filter(|s| s.len() >= 4).collect();
        secrets.sort();
        secrets.dedup();
        secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        Self { secrets }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            out = out.replace(secret.as_str(), MASK);
        }
        let out = BEARER.replace_all(&out, format!("Bearer {}", MASK).as_str());
        SECRET_PAIR
            .replace_all(&out, |caps: &regex::Captures| format!("{}={}", &caps[1], MASK))
            .into_owned()
    }
}
