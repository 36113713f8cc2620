// DETECTION: Threat Pattern Matcher - Known Attack Signature Scanner
//
// Stateless. Scans the serialized body, URL and user agent against a fixed, ordered set
// of case-insensitive signatures. Each field is matched on its own so that no signature
// can be completed across the boundary between two fields. It only reports matches; blocking
// and rejection belong to the caller.

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatPattern {
    ScriptTag,
    IframeTag,
    JavascriptUri,
    VbscriptUri,
    SqlKeyword,
    SqlStatementChain,
}

impl ThreatPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatPattern::ScriptTag => "script_tag",
            ThreatPattern::IframeTag => "iframe_tag",
            ThreatPattern::JavascriptUri => "javascript_uri",
            ThreatPattern::VbscriptUri => "vbscript_uri",
            ThreatPattern::SqlKeyword => "sql_keyword",
            ThreatPattern::SqlStatementChain => "sql_statement_chain",
        }
    }
}

// Order is significant: scan results are reported in this order.
const SIGNATURES: &[(ThreatPattern, &str)] = &[
    (ThreatPattern::ScriptTag, r"(?:<|%3C)\s*/?\s*script\b"),
    (ThreatPattern::IframeTag, r"(?:<|%3C)\s*/?\s*iframe\b"),
    (ThreatPattern::JavascriptUri, r"javascript\s*(?::|%3A)"),
    (ThreatPattern::VbscriptUri, r"vbscript\s*(?::|%3A)"),
    (
        ThreatPattern::SqlKeyword,
        r"\s(?:union|select|insert|update|delete|drop|create|alter)\b",
    ),
    (
        ThreatPattern::SqlStatementChain,
        r"(?:;|%3B)\s*(?:drop|delete|insert|update|alter|create|truncate)\b",
    ),
];

#[derive(Debug)]
pub struct ThreatPatternMatcher {
    signatures: Vec<(ThreatPattern, Regex)>,
}

impl ThreatPatternMatcher {
    pub fn new() -> Result<Self> {
        let signatures = SIGNATURES
            .iter()
            .map(|(pattern, source)| {
                RegexBuilder::new(source)
                    .case_insensitive(true)
                    .build()
                    .map(|regex| (*pattern, regex))
                    .map_err(|e| {
                        Error::config(format!("invalid signature {}: {}", pattern.as_str(), e))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { signatures })
    }

    /// Matched patterns, in signature order.
    pub fn scan(&self, input: &str) -> Vec<ThreatPattern> {
        self.signatures
            .iter()
            .filter(|(_, regex)| regex.is_match(input))
            .map(|(pattern, _)| *pattern)
            .collect()
    }

    /// Scan a request's body, URL and user agent. A signature matches if it matches any
    /// single field; results keep signature order.
    pub fn scan_request(&self, body: &str, url: &str, user_agent: &str) -> Vec<ThreatPattern> {
        let fields = [body, url, user_agent];
        self.signatures
            .iter()
            .filter(|(_, regex)| fields.iter().any(|field| regex.is_match(field)))
            .map(|(pattern, _)| *pattern)
            .collect()
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }
}
