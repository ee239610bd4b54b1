//! Best-effort text mining over engine analysis output.
//!
//! The engine returns free text. Severity is bucketed by keyword
//! heuristics and labelled sections (`remediation:`, `exploitation:`,
//! `verification:`) are pulled out by matching the first occurrence of
//! the label and taking the following text up to a blank line. The
//! result is tagged so consumers can tell a confident extraction from a
//! fallback.

use regex::Regex;

use crate::models::Severity;

/// Result of mining one labelled section out of free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    /// The label was found; carries the text that followed it.
    Recognized(String),
    /// No label found; carries the raw input for downstream fallback.
    Unparsed(String),
}

impl Section {
    pub fn is_recognized(&self) -> bool {
        matches!(self, Self::Recognized(_))
    }

    /// The extracted text, or `fallback` when the label was not found.
    pub fn text_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        match self {
            Self::Recognized(text) => text,
            Self::Unparsed(_) => fallback,
        }
    }
}

/// Extract the section following `label:` (case-insensitive, first
/// occurrence), up to the first blank line or end of input.
pub fn extract_section(text: &str, label: &str) -> Section {
    let pattern = format!(r"(?i){}\s*:\s*", regex::escape(label));
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return Section::Unparsed(text.to_string()),
    };

    let Some(m) = re.find(text) else {
        return Section::Unparsed(text.to_string());
    };

    let rest = &text[m.end()..];
    let mut lines = Vec::new();
    for line in rest.lines() {
        if line.trim().is_empty() {
            break;
        }
        lines.push(line.trim());
    }
    let section = lines.join(" ").trim().to_string();
    if section.is_empty() {
        Section::Unparsed(text.to_string())
    } else {
        Section::Recognized(section)
    }
}

/// Keyword buckets checked highest-severity-first. The first bucket with
/// a hit wins; text with no hits is informational.
const CRITICAL_KEYWORDS: &[&str] = &[
    "critical",
    "remote code execution",
    "rce",
    "sql injection",
    "authentication bypass",
    "arbitrary file",
];
const HIGH_KEYWORDS: &[&str] = &[
    "high risk",
    "high severity",
    "exploitable",
    "privilege escalation",
    "exposed credential",
    "directory traversal",
];
const MEDIUM_KEYWORDS: &[&str] = &[
    "medium",
    "misconfiguration",
    "outdated version",
    "weak cipher",
    "missing header",
    "information disclosure",
];
const LOW_KEYWORDS: &[&str] = &["low risk", "low severity", "minor", "best practice"];

/// Classify free-text analysis into a severity bucket.
pub fn classify_severity(analysis: &str) -> Severity {
    let text = analysis.to_lowercase();
    let hit = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));

    if hit(CRITICAL_KEYWORDS) {
        Severity::Critical
    } else if hit(HIGH_KEYWORDS) {
        Severity::High
    } else if hit(MEDIUM_KEYWORDS) {
        Severity::Medium
    } else if hit(LOW_KEYWORDS) {
        Severity::Low
    } else {
        Severity::Info
    }
}

/// Keywords in raw tool output that warrant a standalone finding.
const ALARM_KEYWORDS: &[&str] = &[
    "vulnerable",
    "exploit",
    "cve-",
    "critical",
    "injection",
    "unauthorized",
    "default credential",
    "anonymous login",
];

pub fn contains_alarm(output: &str) -> bool {
    let text = output.to_lowercase();
    ALARM_KEYWORDS.iter().any(|k| text.contains(k))
}
