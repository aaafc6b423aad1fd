//! # Public API
//!
//! The main entry points of the compiler core. Each stage is a pure
//! function from owned input to owned output; diagnostics travel with the
//! results instead of being thrown.
//!
//! ```rust
//! use scorelang::compile;
//!
//! let source = r#"---
//! title: Scale
//! time: 4/4
//! &main:
//!   clef: treble
//! ---
//! &main { C D E F G A B C5 }
//! "#;
//!
//! let output = compile(source);
//! assert!(output.musicxml.is_some());
//! ```

use crate::ast::Score;
use crate::error::{Diagnostic, Severity};
use crate::formatter;
use crate::lexer;
use crate::musicxml;
use crate::parser;
use crate::semantic;

pub use crate::formatter::FormatOptions;
pub use crate::lexer::LexOutput;
pub use crate::musicxml::XmlOptions;
pub use crate::parser::ParseOutput;
pub use crate::semantic::ValidateOutput;

/// Tokenize a source string.
pub fn tokenize(source: &str) -> LexOutput {
    lexer::tokenize(source)
}

/// Parse a source string into a score AST.
pub fn parse(source: &str) -> ParseOutput {
    parser::parse(source)
}

/// Validate a parsed score.
pub fn validate(score: &Score) -> ValidateOutput {
    semantic::validate(score)
}

/// Generate MusicXML with default options.
pub fn to_musicxml(score: &Score) -> String {
    musicxml::to_musicxml(score)
}

/// Generate MusicXML.
pub fn to_musicxml_with_options(score: &Score, options: &XmlOptions) -> String {
    musicxml::to_musicxml_with_options(score, options)
}

/// Reformat a source string with default options.
pub fn format(source: &str) -> String {
    formatter::format(source)
}

/// Reformat a source string.
pub fn format_with_options(source: &str, options: &FormatOptions) -> String {
    formatter::format_with_options(source, options)
}

/// Minify a source string.
pub fn minify(source: &str) -> String {
    formatter::minify(source)
}

/// Result of [`compile`]: the generated document (when parsing and
/// validation produced no error) plus every diagnostic gathered along the
/// pipeline.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub musicxml: Option<String>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Compile a source string to MusicXML: parse, validate, generate.
///
/// Warnings and info diagnostics never block generation; error-severity
/// diagnostics (from the lexer, parser or validator) do.
pub fn compile(source: &str) -> CompileOutput {
    let parsed = parser::parse(source);
    let mut diagnostics = parsed.errors;
    diagnostics.extend(parsed.warnings);

    let Some(score) = parsed.ast else {
        return CompileOutput {
            musicxml: None,
            diagnostics,
        };
    };

    let validation = semantic::validate(&score);
    diagnostics.extend(validation.diagnostics);

    let has_errors = diagnostics.iter().any(|d| d.severity == Severity::Error);
    CompileOutput {
        musicxml: (!has_errors).then(|| musicxml::to_musicxml(&score)),
        diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_valid_source() {
        let out = compile("---\n&m:\n  clef: treble\n---\n&m { C D E F }");
        assert!(out.musicxml.is_some());
        assert!(out.diagnostics.is_empty());
    }

    #[test]
    fn test_compile_with_warnings_still_generates() {
        let out = compile("---\n&m:\n  clef: treble\n---\n&m { C }\n&ghost { D }");
        assert!(out.musicxml.is_some());
        assert!(out
            .diagnostics
            .iter()
            .any(|d| d.severity == Severity::Warning));
    }

    #[test]
    fn test_compile_with_errors_blocks_generation() {
        let out = compile("---\n&m:\n  clef: treble\n---\n&m { C9 }");
        assert!(out.musicxml.is_none());
        assert!(out
            .diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error));
    }
}
