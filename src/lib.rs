//! # Scorelang compiler core
//!
//! A text-based music notation language that compiles to MusicXML.
//!
//! ## Compilation pipeline
//!
//! ```text
//! .score source → Lexer → Parser → Validator → MusicXML generator
//!                    └──────────→ Formatter / Minifier
//! ```
//!
//! 1. **Lexer** ([`lexer`]) - tokenizes source into located tokens with
//!    context-sensitive modes (frontmatter vs. music body)
//! 2. **Parser** ([`parser`]) - builds the [`Score`] AST: frontmatter
//!    decoding, stave bodies, inline functions, annotation blocks and
//!    automatic measure partitioning by time signature
//! 3. **Validator** ([`semantic`]) - purely diagnostic checks (pitch range,
//!    fingering range, enharmonic hints)
//! 4. **MusicXML generator** ([`musicxml`]) - emits partwise MusicXML 4.0
//! 5. **Formatter / Minifier** ([`formatter`]) - token-stream driven
//!    pretty-printer and whitespace elider
//!
//! Every stage is a pure synchronous function; diagnostics are returned,
//! never thrown.
//!
//! ## Quick start
//!
//! ```rust
//! use scorelang::compile;
//!
//! let source = r#"---
//! title: My Tune
//! key: G
//! time: 3/4
//! &melody:
//!   clef: treble
//! ---
//! &melody { G A B D5/2 C5 }
//! "#;
//!
//! let output = compile(source);
//! let xml = output.musicxml.expect("valid source compiles");
//! assert!(xml.contains("<fifths>1</fifths>"));
//! ```
//!
//! ## Language overview
//!
//! - **Context blocks**: `---`-delimited YAML (`title`, `composer`, `key`,
//!   `time`, `tempo`, `octave`, `&name:` stave declarations); a later
//!   block changes key/time mid-score
//! - **Notes**: `C`, `F#4`, `Bb`, with octave modifiers (`+`, `--`),
//!   durations (`/8`, `/2.`, lone `.` = dotted quarter) and fingerings
//!   (`@3`); durations are sticky until changed
//! - **Rests**: `_` with an optional duration
//! - **Chords**: `[C E G]/2`
//! - **Beams**: `=(C/8 D E F)`
//! - **Grace notes**: `` `C ``
//! - **Connectives**: `~` slur, `^` tie, `*` pedal
//! - **Inline functions**: `mf(C D)`, `st(C D)`, `slur(C D E)`, `<(C D)`
//! - **Annotation blocks**: `&m { C D E F } { cresc(1-4) text(2, "dolce") }`

// Core modules
pub mod ast;
pub mod error;
pub mod formatter;
pub mod lexer;
pub mod musicxml;
pub mod parser;
pub mod semantic;

// Public API
pub mod api;

// Re-export core types
pub use ast::*;
pub use error::{Diagnostic, ScoreError, Severity};
pub use lexer::{tokenize, LexOutput, Token, TokenKind};

// Re-export pipeline functions
pub use formatter::{format, format_with_options, minify, FormatOptions};
pub use musicxml::{to_musicxml, to_musicxml_with_options, XmlOptions};
pub use parser::{parse, ParseOutput};
pub use semantic::{validate, ValidateOutput};

// Re-export API conveniences
pub use api::{compile, CompileOutput};
