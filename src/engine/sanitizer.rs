//! Text transforms applied to every request before it reaches an engine.
//!
//! The engine treats every line as a statement boundary, so a request with
//! embedded line breaks would be read as several statements and each would
//! print its own prompt. The baseline transform strips them.
//!
//! Chains are built from textual entries so they can come from configuration:
//! `strip_line_breaks`, `trim`, or `replace PATTERN => REPLACEMENT`.

use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Prefix of a pattern replacement entry
pub const REPLACE_PREFIX: &str = "replace ";

/// Separates pattern and replacement in a replacement rule
const REPLACE_ARROW: &str = "=>";

/// Errors building a transform from its configuration entry.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unknown request transform '{0}'")]
    Unknown(String),

    #[error("replacement rule '{0}' has no '=>'")]
    Malformed(String),

    #[error("invalid pattern in '{rule}': {source}")]
    Pattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

/// One total, pure text transform.
pub trait RequestTransform: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, request: String) -> String;
}

/// Removes `\n` and `\r`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StripLineBreaks;

impl RequestTransform for StripLineBreaks {
    fn name(&self) -> &str {
        "strip_line_breaks"
    }

    fn apply(&self, request: String) -> String {
        if request.contains(['\n', '\r']) {
            request.chars().filter(|c| *c != '\n' && *c != '\r').collect()
        } else {
            request
        }
    }
}

/// Trims leading and trailing whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrimWhitespace;

impl RequestTransform for TrimWhitespace {
    fn name(&self) -> &str {
        "trim"
    }

    fn apply(&self, request: String) -> String {
        let trimmed = request.trim();
        if trimmed.len() == request.len() {
            request
        } else {
            trimmed.to_string()
        }
    }
}

/// Replaces every match of a pattern.
#[derive(Debug, Clone)]
pub struct ReplacePattern {
    pattern: Regex,
    replacement: String,
}

impl ReplacePattern {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
        })
    }

    /// Parse `PATTERN => REPLACEMENT`. The first `=>` splits the rule and
    /// both sides are trimmed; the replacement may be empty and may use
    /// `$1`-style group references.
    pub fn parse(rule: &str) -> Result<Self, TransformError> {
        let (pattern, replacement) = rule
            .split_once(REPLACE_ARROW)
            .ok_or_else(|| TransformError::Malformed(rule.to_string()))?;
        Self::new(pattern.trim(), replacement.trim()).map_err(|source| TransformError::Pattern {
            rule: rule.to_string(),
            source,
        })
    }
}

impl RequestTransform for ReplacePattern {
    fn name(&self) -> &str {
        self.pattern.as_str()
    }

    fn apply(&self, request: String) -> String {
        self.pattern
            .replace_all(&request, self.replacement.as_str())
            .into_owned()
    }
}

/// Ordered chain of transforms.
pub struct RequestSanitizer {
    transforms: Vec<Box<dyn RequestTransform>>,
}

impl RequestSanitizer {
    /// A chain with only the baseline line-break stripping.
    pub fn new() -> Self {
        Self {
            transforms: vec![Box::new(StripLineBreaks)],
        }
    }

    /// A chain with no transforms at all.
    pub fn empty() -> Self {
        Self {
            transforms: Vec::new(),
        }
    }

    /// Build from transform entries, applied in the given order.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Result<Self, TransformError> {
        let mut sanitizer = Self::empty();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if let Some(rule) = entry.strip_prefix(REPLACE_PREFIX) {
                sanitizer.push(ReplacePattern::parse(rule)?);
                continue;
            }
            match entry {
                "strip_line_breaks" => sanitizer.push(StripLineBreaks),
                "trim" => sanitizer.push(TrimWhitespace),
                other => return Err(TransformError::Unknown(other.to_string())),
            }
        }
        Ok(sanitizer)
    }

    /// Append a transform to the end of the chain.
    pub fn push(&mut self, transform: impl RequestTransform + 'static) {
        self.transforms.push(Box::new(transform));
    }

    pub fn with(mut self, transform: impl RequestTransform + 'static) -> Self {
        self.push(transform);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    /// Run the request through every transform in order.
    pub fn sanitize(&self, request: &str) -> String {
        self.transforms
            .iter()
            .fold(request.to_string(), |acc, t| t.apply(acc))
    }
}

impl Default for RequestSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestSanitizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSanitizer")
            .field("transforms", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_embedded_newlines() {
        let sanitizer = RequestSanitizer::new();
        assert_eq!(sanitizer.sanitize("2^3;\n"), "2^3;");
        assert_eq!(sanitizer.sanitize("2*\r\n3;"), "2*3;");
        assert_eq!(sanitizer.sanitize("12+12;"), "12+12;");
    }

    #[test]
    fn test_order_is_preserved() {
        let sanitizer = RequestSanitizer::empty()
            .with(ReplacePattern::new("a", "b").unwrap())
            .with(ReplacePattern::new("b", "c").unwrap());
        assert_eq!(sanitizer.sanitize("a"), "c");

        let reversed = RequestSanitizer::empty()
            .with(ReplacePattern::new("b", "c").unwrap())
            .with(ReplacePattern::new("a", "b").unwrap());
        assert_eq!(reversed.sanitize("a"), "b");
    }

    #[test]
    fn test_from_entries() {
        let sanitizer = RequestSanitizer::from_entries(&["strip_line_breaks", "trim"]).unwrap();
        assert_eq!(sanitizer.names(), vec!["strip_line_breaks", "trim"]);
        assert_eq!(sanitizer.sanitize("  x:1;\n  "), "x:1;");

        let err = RequestSanitizer::from_entries(&["shout"]).unwrap_err();
        assert!(matches!(err, TransformError::Unknown(ref name) if name == "shout"));
        assert_eq!(err.to_string(), "unknown request transform 'shout'");
    }

    #[test]
    fn test_replace_entry() {
        let sanitizer = RequestSanitizer::from_entries(&[
            r"replace quit\(\) =>",
            r"replace (\d+)! => factorial($1)",
        ])
        .unwrap();
        assert_eq!(sanitizer.sanitize("quit();"), ";");
        assert_eq!(sanitizer.sanitize("5!;"), "factorial(5);");
    }

    #[test]
    fn test_bad_replace_entries() {
        let err = RequestSanitizer::from_entries(&["replace quit"]).unwrap_err();
        assert!(matches!(err, TransformError::Malformed(_)));

        let err = RequestSanitizer::from_entries(&["replace ( => x"]).unwrap_err();
        assert!(matches!(err, TransformError::Pattern { .. }));
    }

    #[test]
    fn test_empty_chain_is_identity() {
        assert_eq!(RequestSanitizer::empty().sanitize("a\nb"), "a\nb");
    }

    #[test]
    fn test_debug_lists_transform_names() {
        let text = format!("{:?}", RequestSanitizer::new());
        assert!(text.contains("strip_line_breaks"));
    }
}
