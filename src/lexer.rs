//! # Lexer
//!
//! Tokenizes Scorelang source into a flat stream of located tokens.
//!
//! The lexer is context sensitive: a `---` line toggles *context mode*, in
//! which each line is captured whole as `YamlContent` for the parser's YAML
//! decoder. In the default (music body) mode it tracks a stave-brace depth
//! and a one-shot `expect_annotation_block` flag so that the `{` opening a
//! stave body and the `{` opening the annotation block that may follow it
//! get distinct token kinds.
//!
//! Whitespace, newlines and comments are real tokens: the formatter and
//! minifier consume the same stream and need them. The parser skips them.
//!
//! The lexer never aborts. Unrecognized bytes become `Unknown` tokens; the
//! only lexical *error* is the note-separation rule (two note-ish tokens
//! with no whitespace or connective between them, outside a chord).

use crate::error::Diagnostic;
use serde::Serialize;

/// Token kinds for the Scorelang language.
///
/// This is a closed set. `ContextKey`/`ContextValue` are reserved members:
/// context-mode lines are currently lexed as whole [`TokenKind::YamlContent`]
/// lines, which is what the YAML decoder consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenKind {
    ContextDelim,
    YamlContent,
    ContextKey,
    ContextValue,
    StaveDecl,
    StaveBodyStart,
    StaveBodyEnd,
    AnnotationBlockStart,
    AnnotationBlockEnd,
    Note,
    Rest,
    Duration,
    OctaveMod,
    Fingering,
    ChordStart,
    ChordEnd,
    BeamStart,
    ParenOpen,
    ParenClose,
    Slur,
    Tie,
    Pedal,
    Function,
    Number,
    Range,
    Comma,
    String,
    RepeatStart,
    RepeatEnd,
    Volta,
    Grace,
    Comment,
    Newline,
    Whitespace,
    Eof,
    Unknown,
}

/// A token with its source text and position. Positions are 1-based
/// line/column plus a half-open byte span into the original source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub column: usize,
    pub byte_start: usize,
    pub byte_end: usize,
}

/// Result of tokenizing: the full token stream plus lexical errors.
#[derive(Debug, Clone)]
pub struct LexOutput {
    pub tokens: Vec<Token>,
    pub errors: Vec<Diagnostic>,
}

/// Which kind of brace block is currently open.
#[derive(Clone, Copy, PartialEq)]
enum BlockKind {
    Stave,
    Annotation,
}

/// Lexer for Scorelang source.
pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    line: usize,
    column: usize,
    in_context: bool,
    stave_depth: usize,
    expect_annotation_block: bool,
    open_blocks: Vec<BlockKind>,
    chord_depth: usize,
    tokens: Vec<Token>,
    errors: Vec<Diagnostic>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            line: 1,
            column: 1,
            in_context: false,
            stave_depth: 0,
            expect_annotation_block: false,
            open_blocks: Vec::new(),
            chord_depth: 0,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn tokenize(mut self) -> LexOutput {
        while self.pos < self.input.len() {
            if self.in_context {
                self.lex_context_mode();
            } else {
                self.lex_default_mode();
            }
        }
        self.push_token(TokenKind::Eof, self.pos, self.line, self.column);

        LexOutput {
            tokens: self.tokens,
            errors: self.errors,
        }
    }

    fn rest(&self) -> &str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    /// True when the current position starts a `---` line (only trailing
    /// whitespace allowed before the newline).
    fn at_context_delim(&self) -> bool {
        if self.column != 1 || !self.rest().starts_with("---") {
            return false;
        }
        self.input[self.pos + 3..]
            .chars()
            .take_while(|&c| c != '\n')
            .all(|c| c == ' ' || c == '\t' || c == '\r')
    }

    fn push_token(&mut self, kind: TokenKind, start: usize, line: usize, column: usize) {
        // The one-shot annotation flag survives trivia and is consumed (or
        // discarded) by the next significant token.
        match kind {
            TokenKind::Whitespace
            | TokenKind::Newline
            | TokenKind::Comment
            | TokenKind::Eof
            | TokenKind::StaveBodyEnd
            | TokenKind::AnnotationBlockEnd => {}
            _ => self.expect_annotation_block = false,
        }
        self.tokens.push(Token {
            kind,
            text: self.input[start..self.pos].to_string(),
            line,
            column,
            byte_start: start,
            byte_end: self.pos,
        });
    }

    fn lex_context_mode(&mut self) {
        let (start, line, column) = (self.pos, self.line, self.column);

        if self.at_context_delim() {
            self.bump();
            self.bump();
            self.bump();
            self.push_token(TokenKind::ContextDelim, start, line, column);
            self.in_context = false;
            return;
        }

        match self.peek() {
            Some('\n') => {
                self.bump();
                self.push_token(TokenKind::Newline, start, line, column);
            }
            Some('\r') if self.peek_at(1) == Some('\n') => {
                self.bump();
                self.push_token(TokenKind::Whitespace, start, line, column);
            }
            Some(_) => {
                while let Some(c) = self.peek() {
                    if c == '\n' || (c == '\r' && self.peek_at(1) == Some('\n')) {
                        break;
                    }
                    self.bump();
                }
                self.push_token(TokenKind::YamlContent, start, line, column);
            }
            None => {}
        }
    }

    fn lex_default_mode(&mut self) {
        let (start, line, column) = (self.pos, self.line, self.column);

        if self.at_context_delim() {
            self.bump();
            self.bump();
            self.bump();
            self.push_token(TokenKind::ContextDelim, start, line, column);
            self.in_context = true;
            return;
        }

        let c = match self.peek() {
            Some(c) => c,
            None => return,
        };

        match c {
            '\n' => {
                self.bump();
                self.push_token(TokenKind::Newline, start, line, column);
            }
            ' ' | '\t' | '\r' => {
                while matches!(self.peek(), Some(' ' | '\t' | '\r')) {
                    self.bump();
                }
                self.push_token(TokenKind::Whitespace, start, line, column);
            }
            'A'..='G' => self.lex_note(start, line, column),
            '_' => {
                self.bump();
                self.push_token(TokenKind::Rest, start, line, column);
                self.lex_duration_postfix();
            }
            '&' => self.lex_stave_decl(start, line, column),
            '{' => {
                self.bump();
                if self.stave_depth == 0 {
                    let kind = if self.expect_annotation_block {
                        self.open_blocks.push(BlockKind::Annotation);
                        TokenKind::AnnotationBlockStart
                    } else {
                        self.open_blocks.push(BlockKind::Stave);
                        TokenKind::StaveBodyStart
                    };
                    self.stave_depth += 1;
                    self.push_token(kind, start, line, column);
                } else {
                    self.push_token(TokenKind::Unknown, start, line, column);
                }
            }
            '}' => {
                self.bump();
                if self.stave_depth > 0 {
                    self.stave_depth -= 1;
                    let kind = match self.open_blocks.pop() {
                        Some(BlockKind::Annotation) => TokenKind::AnnotationBlockEnd,
                        _ => TokenKind::StaveBodyEnd,
                    };
                    self.push_token(kind, start, line, column);
                    if self.stave_depth == 0 {
                        self.expect_annotation_block = true;
                    }
                } else {
                    self.push_token(TokenKind::Unknown, start, line, column);
                }
            }
            '[' => {
                self.bump();
                self.chord_depth += 1;
                self.push_token(TokenKind::ChordStart, start, line, column);
            }
            ']' => {
                self.bump();
                self.chord_depth = self.chord_depth.saturating_sub(1);
                self.push_token(TokenKind::ChordEnd, start, line, column);
                self.lex_duration_postfix();
            }
            '=' => {
                self.bump();
                if self.peek() == Some('(') {
                    self.bump();
                    self.push_token(TokenKind::BeamStart, start, line, column);
                } else {
                    self.push_token(TokenKind::Unknown, start, line, column);
                }
            }
            '(' => {
                self.bump();
                self.push_token(TokenKind::ParenOpen, start, line, column);
            }
            ')' => {
                self.bump();
                self.push_token(TokenKind::ParenClose, start, line, column);
            }
            '~' => {
                self.bump();
                self.push_token(TokenKind::Slur, start, line, column);
            }
            '^' => {
                self.bump();
                self.push_token(TokenKind::Tie, start, line, column);
            }
            '*' => {
                self.bump();
                self.push_token(TokenKind::Pedal, start, line, column);
            }
            '`' => {
                self.bump();
                if self.peek() == Some('`') {
                    self.bump();
                }
                self.push_token(TokenKind::Grace, start, line, column);
            }
            '"' => {
                self.bump();
                while let Some(c) = self.peek() {
                    self.bump();
                    if c == '"' {
                        break;
                    }
                }
                self.push_token(TokenKind::String, start, line, column);
            }
            '/' => match self.peek_at(1) {
                Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    self.push_token(TokenKind::Comment, start, line, column);
                }
                Some('*') => {
                    self.bump();
                    self.bump();
                    // Unclosed block comments consume to EOF.
                    while self.pos < self.input.len() {
                        if self.rest().starts_with("*/") {
                            self.bump();
                            self.bump();
                            break;
                        }
                        self.bump();
                    }
                    self.push_token(TokenKind::Comment, start, line, column);
                }
                _ => {
                    if !self.try_lex_duration() {
                        self.bump();
                        self.push_token(TokenKind::Unknown, start, line, column);
                    }
                }
            },
            '.' => {
                self.bump();
                self.push_token(TokenKind::Duration, start, line, column);
            }
            '0'..='9' => {
                while matches!(self.peek(), Some('0'..='9')) {
                    self.bump();
                }
                let kind = if self.peek() == Some('-')
                    && matches!(self.peek_at(1), Some('0'..='9'))
                {
                    self.bump();
                    while matches!(self.peek(), Some('0'..='9')) {
                        self.bump();
                    }
                    TokenKind::Range
                } else {
                    TokenKind::Number
                };
                self.push_token(kind, start, line, column);
            }
            ',' => {
                self.bump();
                self.push_token(TokenKind::Comma, start, line, column);
            }
            'a'..='z' => {
                self.bump();
                while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric()) {
                    self.bump();
                }
                self.push_token(TokenKind::Function, start, line, column);
            }
            '<' | '>' => {
                self.bump();
                self.push_token(TokenKind::Function, start, line, column);
            }
            '|' => {
                self.bump();
                match self.peek() {
                    Some(':') => {
                        self.bump();
                        self.push_token(TokenKind::RepeatStart, start, line, column);
                    }
                    Some('0'..='9') => {
                        while matches!(self.peek(), Some('0'..='9')) {
                            self.bump();
                        }
                        self.push_token(TokenKind::Volta, start, line, column);
                    }
                    _ => self.push_token(TokenKind::Unknown, start, line, column),
                }
            }
            ':' => {
                self.bump();
                if self.peek() == Some('|') {
                    self.bump();
                    self.push_token(TokenKind::RepeatEnd, start, line, column);
                } else {
                    self.push_token(TokenKind::Unknown, start, line, column);
                }
            }
            _ => {
                self.bump();
                self.push_token(TokenKind::Unknown, start, line, column);
            }
        }
    }

    /// Lex a note atom `[A-G](#{1,2}|b{1,2})?\d?` and the postfix tokens
    /// that may attach to it without intervening whitespace: octave
    /// modifiers, a duration, then a fingering.
    fn lex_note(&mut self, start: usize, line: usize, column: usize) {
        self.bump();
        match self.peek() {
            Some('#') => {
                self.bump();
                if self.peek() == Some('#') {
                    self.bump();
                }
            }
            Some('b') => {
                self.bump();
                if self.peek() == Some('b') {
                    self.bump();
                }
            }
            _ => {}
        }
        if matches!(self.peek(), Some('0'..='9')) {
            self.bump();
        }

        self.check_note_separation(start, line, column);
        self.push_token(TokenKind::Note, start, line, column);

        // Octave modifiers: `+`, `++`, `-`, `--`.
        if let Some(mc @ ('+' | '-')) = self.peek() {
            let (mstart, mline, mcol) = (self.pos, self.line, self.column);
            self.bump();
            if self.peek() == Some(mc) {
                self.bump();
            }
            self.push_token(TokenKind::OctaveMod, mstart, mline, mcol);
        }

        self.lex_duration_postfix();

        // Fingering: `@[1-5]`.
        if self.peek() == Some('@') && matches!(self.peek_at(1), Some('1'..='5')) {
            let (fstart, fline, fcol) = (self.pos, self.line, self.column);
            self.bump();
            self.bump();
            self.push_token(TokenKind::Fingering, fstart, fline, fcol);
        }
    }

    /// Emit a `Duration` token if one starts at the current position.
    fn lex_duration_postfix(&mut self) {
        if self.peek() == Some('.') {
            let (start, line, column) = (self.pos, self.line, self.column);
            self.bump();
            self.push_token(TokenKind::Duration, start, line, column);
        } else {
            self.try_lex_duration();
        }
    }

    /// Try `/(1|2|4|8|16|32)\.{0,2}`; returns false without consuming
    /// anything if the position does not start a duration.
    fn try_lex_duration(&mut self) -> bool {
        if self.peek() != Some('/') {
            return false;
        }
        let digits = match (self.peek_at(1), self.peek_at(2)) {
            (Some('1'), Some('6')) | (Some('3'), Some('2')) => 2,
            (Some('1' | '2' | '4' | '8'), _) => 1,
            _ => return false,
        };
        let (start, line, column) = (self.pos, self.line, self.column);
        self.bump();
        for _ in 0..digits {
            self.bump();
        }
        let mut dots = 0;
        while dots < 2 && self.peek() == Some('.') {
            self.bump();
            dots += 1;
        }
        self.push_token(TokenKind::Duration, start, line, column);
        true
    }

    fn lex_stave_decl(&mut self, start: usize, line: usize, column: usize) {
        self.bump();
        if !matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric()) {
            self.push_token(TokenKind::Unknown, start, line, column);
            return;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric()) {
            self.bump();
        }
        if self.peek() == Some('+') && matches!(self.peek_at(1), Some(c) if c.is_ascii_alphanumeric())
        {
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric()) {
                self.bump();
            }
        }
        self.push_token(TokenKind::StaveDecl, start, line, column);
    }

    /// Outside chord context, a note may not butt directly against a
    /// preceding note-ish token.
    fn check_note_separation(&mut self, note_start: usize, line: usize, column: usize) {
        if self.chord_depth > 0 {
            return;
        }
        if let Some(prev) = self.tokens.last() {
            let adjacent = prev.byte_end == note_start;
            let note_ish = matches!(
                prev.kind,
                TokenKind::Note
                    | TokenKind::Duration
                    | TokenKind::OctaveMod
                    | TokenKind::Fingering
            );
            if adjacent && note_ish {
                self.errors.push(Diagnostic::error(
                    "Notes must be separated by whitespace or connectives",
                    line,
                    column,
                ));
            }
        }
    }
}

/// Tokenize a source string.
pub fn tokenize(source: &str) -> LexOutput {
    Lexer::new(source).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .tokens
            .iter()
            .filter(|t| {
                !matches!(
                    t.kind,
                    TokenKind::Whitespace | TokenKind::Newline | TokenKind::Eof
                )
            })
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_simple_notes() {
        assert_eq!(
            kinds("C D E"),
            vec![TokenKind::Note, TokenKind::Note, TokenKind::Note]
        );
    }

    #[test]
    fn test_note_with_accidental_and_octave() {
        let out = tokenize("C#4 Bb Ebb2");
        let notes: Vec<_> = out
            .tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Note)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(notes, vec!["C#4", "Bb", "Ebb2"]);
        assert!(out.errors.is_empty());
    }

    #[test]
    fn test_note_postfix_order() {
        assert_eq!(
            kinds("C+/8.@3"),
            vec![
                TokenKind::Note,
                TokenKind::OctaveMod,
                TokenKind::Duration,
                TokenKind::Fingering,
            ]
        );
    }

    #[test]
    fn test_lone_dot_duration() {
        let out = tokenize("C.");
        assert_eq!(out.tokens[1].kind, TokenKind::Duration);
        assert_eq!(out.tokens[1].text, ".");
    }

    #[test]
    fn test_rest_with_duration() {
        assert_eq!(kinds("_/2"), vec![TokenKind::Rest, TokenKind::Duration]);
    }

    #[test]
    fn test_context_block() {
        let out = tokenize("---\ntitle: Song\n---\n");
        let k: Vec<_> = out.tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            k,
            vec![
                TokenKind::ContextDelim,
                TokenKind::Newline,
                TokenKind::YamlContent,
                TokenKind::Newline,
                TokenKind::ContextDelim,
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
        assert_eq!(out.tokens[2].text, "title: Song");
    }

    #[test]
    fn test_stave_body_and_annotation_block() {
        assert_eq!(
            kinds("&m { C } { cresc(1-1) }"),
            vec![
                TokenKind::StaveDecl,
                TokenKind::StaveBodyStart,
                TokenKind::Note,
                TokenKind::StaveBodyEnd,
                TokenKind::AnnotationBlockStart,
                TokenKind::Function,
                TokenKind::ParenOpen,
                TokenKind::Range,
                TokenKind::ParenClose,
                TokenKind::AnnotationBlockEnd,
            ]
        );
    }

    #[test]
    fn test_new_stave_resets_annotation_flag() {
        // The `{` after `&b` must open a stave body, not an annotation block.
        assert_eq!(
            kinds("&a { C } &b { D }"),
            vec![
                TokenKind::StaveDecl,
                TokenKind::StaveBodyStart,
                TokenKind::Note,
                TokenKind::StaveBodyEnd,
                TokenKind::StaveDecl,
                TokenKind::StaveBodyStart,
                TokenKind::Note,
                TokenKind::StaveBodyEnd,
            ]
        );
    }

    #[test]
    fn test_chord_tokens() {
        assert_eq!(
            kinds("[C E G]/2"),
            vec![
                TokenKind::ChordStart,
                TokenKind::Note,
                TokenKind::Note,
                TokenKind::Note,
                TokenKind::ChordEnd,
                TokenKind::Duration,
            ]
        );
    }

    #[test]
    fn test_beam_group() {
        assert_eq!(
            kinds("=(C/8 D)"),
            vec![
                TokenKind::BeamStart,
                TokenKind::Note,
                TokenKind::Duration,
                TokenKind::Note,
                TokenKind::ParenClose,
            ]
        );
    }

    #[test]
    fn test_connectives_and_grace() {
        assert_eq!(
            kinds("C~ D^ E* `F"),
            vec![
                TokenKind::Note,
                TokenKind::Slur,
                TokenKind::Note,
                TokenKind::Tie,
                TokenKind::Note,
                TokenKind::Pedal,
                TokenKind::Grace,
                TokenKind::Note,
            ]
        );
    }

    #[test]
    fn test_function_and_args() {
        assert_eq!(
            kinds("text(2, \"dolce\")"),
            vec![
                TokenKind::Function,
                TokenKind::ParenOpen,
                TokenKind::Number,
                TokenKind::Comma,
                TokenKind::String,
                TokenKind::ParenClose,
            ]
        );
    }

    #[test]
    fn test_comments() {
        assert_eq!(kinds("// hi\nC"), vec![TokenKind::Comment, TokenKind::Note]);
        assert_eq!(
            kinds("/* multi\nline */ C"),
            vec![TokenKind::Comment, TokenKind::Note]
        );
    }

    #[test]
    fn test_unclosed_block_comment_consumes_to_eof() {
        let out = tokenize("C /* never closed");
        assert_eq!(out.tokens[2].kind, TokenKind::Comment);
        assert_eq!(out.tokens[3].kind, TokenKind::Eof);
    }

    #[test]
    fn test_repeat_and_volta_markers() {
        assert_eq!(
            kinds("|: C :| |1"),
            vec![
                TokenKind::RepeatStart,
                TokenKind::Note,
                TokenKind::RepeatEnd,
                TokenKind::Volta,
            ]
        );
    }

    #[test]
    fn test_adjacent_notes_error() {
        let out = tokenize("CD");
        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0]
            .message
            .contains("separated by whitespace or connectives"));
    }

    #[test]
    fn test_adjacent_after_duration_error() {
        let out = tokenize("C/8D");
        assert_eq!(out.errors.len(), 1);
    }

    #[test]
    fn test_adjacent_notes_ok_inside_chord() {
        let out = tokenize("[CEG]");
        assert!(out.errors.is_empty());
    }

    #[test]
    fn test_unknown_byte_does_not_abort() {
        let out = tokenize("C ? D");
        assert!(out
            .tokens
            .iter()
            .any(|t| t.kind == TokenKind::Unknown && t.text == "?"));
        assert_eq!(
            out.tokens.iter().filter(|t| t.kind == TokenKind::Note).count(),
            2
        );
    }

    #[test]
    fn test_byte_spans_are_ordered() {
        let out = tokenize("---\nkey: G\n---\n&m { C+/8 D } { slur(1-2) }\n");
        for pair in out.tokens.windows(2) {
            assert!(pair[0].byte_end <= pair[1].byte_start);
        }
    }

    #[test]
    fn test_stave_decl_with_voice() {
        let out = tokenize("&rh+1 { C }");
        assert_eq!(out.tokens[0].kind, TokenKind::StaveDecl);
        assert_eq!(out.tokens[0].text, "&rh+1");
    }
}
