//! Diagnostic type for compile errors
//!
//! Every error the compiler reports flows through [`Diagnostic`]. The
//! compiler accumulates them on the parser; hosts render them with
//! [`Diagnostic::to_human_string`] or serialize them as JSON.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity level of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    /// Fatal error; compilation produces no function
    Error,
    /// Advisory only
    Warning,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLevel::Error => write!(f, "error"),
            DiagnosticLevel::Warning => write!(f, "warning"),
        }
    }
}

/// A diagnostic message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Severity level
    pub level: DiagnosticLevel,
    /// Main diagnostic message
    pub message: String,
    /// Module the error was found in
    pub file: String,
    /// Line number (1-based)
    pub line: u32,
    /// The offending token's source text, when it has one
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lexeme: Option<String>,
    /// Whether the error was reported at end of input
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub at_end: bool,
}

impl Diagnostic {
    /// Create a new error diagnostic
    pub fn error(message: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            message: message.into(),
            file: file.into(),
            line,
            lexeme: None,
            at_end: false,
        }
    }

    /// Attach the offending lexeme
    pub fn with_lexeme(mut self, lexeme: impl Into<String>) -> Self {
        self.lexeme = Some(lexeme.into());
        self
    }

    /// Mark the diagnostic as reported at end of input
    pub fn at_end(mut self) -> Self {
        self.at_end = true;
        self
    }

    /// Format as a human-readable string
    ///
    /// ```text
    /// File 'scratch', line 3
    ///     3 | x = 2
    ///     Cannot assign to a constant.
    /// ```
    pub fn to_human_string(&self) -> String {
        let mut output = format!("File '{}', line {}\n", self.file, self.line);

        if self.at_end {
            output.push_str(&format!("    Error at end: {}\n", self.message));
        } else if let Some(lexeme) = &self.lexeme {
            output.push_str(&format!("    {} | {}\n", self.line, lexeme));
            output.push_str(&format!("    {}\n", self.message));
        } else {
            output.push_str(&format!("    Error: {}\n", self.message));
        }

        output
    }

    /// Format as a compact JSON string
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_format_with_lexeme() {
        let diag = Diagnostic::error("Cannot assign to a constant.", "scratch", 3)
            .with_lexeme("x = 2");
        let rendered = diag.to_human_string();
        assert!(rendered.contains("File 'scratch', line 3"));
        assert!(rendered.contains("3 | x = 2"));
        assert!(rendered.contains("Cannot assign to a constant."));
    }

    #[test]
    fn test_human_format_at_end() {
        let diag = Diagnostic::error("Expect ';' after expression.", "scratch", 1).at_end();
        assert!(diag
            .to_human_string()
            .contains("Error at end: Expect ';' after expression."));
    }

    #[test]
    fn test_json_roundtrip() {
        let diag = Diagnostic::error("Expect expression.", "scratch", 7).with_lexeme("+");
        let json = diag.to_json_string().unwrap();
        let back: Diagnostic = serde_json::from_str(&json).unwrap();
        assert_eq!(diag, back);
    }
}
