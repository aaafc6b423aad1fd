//! # Formatter and minifier
//!
//! Both consume the token stream directly, so they survive sources the
//! parser would complain about and never change what the lexer sees.
//!
//! The formatter re-dumps context blocks through the YAML decoder with a
//! canonical key order (undecodable blocks are preserved verbatim), renders
//! stave bodies as `&name { … }` with wrapping every `notes_per_line`
//! units, attaches duration/octave/fingering postfixes to their note with
//! no space, and glues connectives to their neighbors unless
//! `space_around_connectives` is set. `format` is idempotent.
//!
//! The minifier elides every bit of whitespace that is not needed to keep
//! the token stream equivalent: newlines survive only around context
//! blocks and stave declarations, and a single space survives where two
//! note-like tokens would otherwise fuse.

use crate::lexer::{tokenize, Token, TokenKind};

/// Formatter options.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub indent_size: usize,
    pub max_line_width: usize,
    pub notes_per_line: usize,
    pub space_around_connectives: bool,
    pub align_context_values: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            indent_size: 2,
            max_line_width: 80,
            notes_per_line: 8,
            space_around_connectives: false,
            align_context_values: true,
        }
    }
}

/// Format a source string with default options.
pub fn format(source: &str) -> String {
    format_with_options(source, &FormatOptions::default())
}

/// Format a source string.
pub fn format_with_options(source: &str, options: &FormatOptions) -> String {
    let lexed = tokenize(source);
    Formatter {
        tokens: &lexed.tokens,
        pos: 0,
        options,
        lines: Vec::new(),
    }
    .run()
}

/// One item of a stave body: a renderable unit or a comment that must
/// keep its own line.
enum BodyItem {
    Unit(String),
    Comment(String),
}

struct Formatter<'a> {
    tokens: &'a [Token],
    pos: usize,
    options: &'a FormatOptions,
    lines: Vec<String>,
}

impl<'a> Formatter<'a> {
    fn run(mut self) -> String {
        loop {
            self.skip_blank();
            match self.kind() {
                TokenKind::Eof => break,
                TokenKind::ContextDelim => self.format_context_block(),
                TokenKind::StaveDecl => self.format_stave_section(),
                TokenKind::Comment => {
                    let text = self.text().to_string();
                    self.lines.push(text);
                    self.advance();
                }
                _ => self.format_stray_line(),
            }
        }

        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }

    fn kind(&self) -> TokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    fn text(&self) -> &str {
        self.tokens.get(self.pos).map(|t| t.text.as_str()).unwrap_or("")
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn skip_blank(&mut self) {
        while matches!(self.kind(), TokenKind::Whitespace | TokenKind::Newline) {
            self.advance();
        }
    }

    // ------------------------------------------------------------------
    // Context blocks
    // ------------------------------------------------------------------

    fn format_context_block(&mut self) {
        self.advance(); // opening ---

        let mut raw: Vec<String> = Vec::new();
        loop {
            match self.kind() {
                TokenKind::ContextDelim => {
                    self.advance();
                    break;
                }
                TokenKind::Eof => break,
                TokenKind::YamlContent => {
                    raw.push(self.text().to_string());
                    self.advance();
                }
                _ => self.advance(),
            }
        }

        self.lines.push("---".to_string());
        let content = raw.join("\n");
        match decode_context(&content) {
            Some(mapping) => self.dump_context(&mapping),
            // Invalid YAML is preserved verbatim.
            None => self.lines.extend(raw),
        }
        self.lines.push("---".to_string());
    }

    fn dump_context(&mut self, mapping: &serde_yaml::Mapping) {
        const CANONICAL: [&str; 6] = ["title", "composer", "key", "time", "tempo", "octave"];

        let mut scalars: Vec<(String, String)> = Vec::new();
        let mut complex: Vec<String> = Vec::new();

        let push_entry =
            |key: &str, value: &serde_yaml::Value, scalars: &mut Vec<(String, String)>, complex: &mut Vec<String>| {
                match scalar_yaml(value) {
                    Some(text) => scalars.push((key.to_string(), text)),
                    None => {
                        let mut single = serde_yaml::Mapping::new();
                        single.insert(serde_yaml::Value::from(key), value.clone());
                        if let Ok(dump) = serde_yaml::to_string(&single) {
                            complex.extend(dump.trim_end().lines().map(str::to_string));
                        }
                    }
                }
            };

        for key in CANONICAL {
            if let Some(value) = mapping_get(mapping, key) {
                push_entry(key, value, &mut scalars, &mut complex);
            }
        }
        for (key, value) in mapping {
            let Some(key) = key.as_str() else { continue };
            if key.starts_with('&') || CANONICAL.contains(&key) {
                continue;
            }
            push_entry(key, value, &mut scalars, &mut complex);
        }

        let width = scalars.iter().map(|(k, _)| k.len() + 1).max().unwrap_or(0);
        for (key, value) in &scalars {
            if self.options.align_context_values {
                self.lines.push(format!("{:<width$} {value}", format!("{key}:")));
            } else {
                self.lines.push(format!("{key}: {value}"));
            }
        }
        self.lines.extend(complex);

        let indent = " ".repeat(self.options.indent_size);
        for (key, value) in mapping {
            let Some(key) = key.as_str() else { continue };
            let Some(name) = key.strip_prefix('&') else {
                continue;
            };
            self.lines.push(format!("&{name}:"));
            match value {
                serde_yaml::Value::Mapping(m) => {
                    if let Some(clef) = mapping_get(m, "clef").and_then(scalar_yaml) {
                        self.lines.push(format!("{indent}clef: {clef}"));
                    }
                    if let Some(voice) = mapping_get(m, "voice").and_then(scalar_yaml) {
                        self.lines.push(format!("{indent}voice: {voice}"));
                    }
                    for (k, v) in m {
                        let Some(k) = k.as_str() else { continue };
                        if k == "clef" || k == "voice" {
                            continue;
                        }
                        if let Some(text) = scalar_yaml(v) {
                            self.lines.push(format!("{indent}{k}: {text}"));
                        }
                    }
                }
                other => {
                    let clef = scalar_yaml(other).unwrap_or_else(|| "treble".to_string());
                    self.lines.push(format!("{indent}clef: {clef}"));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Stave sections
    // ------------------------------------------------------------------

    fn format_stave_section(&mut self) {
        let decl = self.text().to_string();
        self.advance();
        self.skip_blank();

        if self.kind() != TokenKind::StaveBodyStart {
            self.lines.push(decl);
            return;
        }
        self.advance();

        let items = self.collect_items(TokenKind::StaveBodyEnd);
        if self.kind() == TokenKind::StaveBodyEnd {
            self.advance();
        }

        self.skip_blank();
        let mut annotation_units: Vec<String> = Vec::new();
        if self.kind() == TokenKind::AnnotationBlockStart {
            self.advance();
            for item in self.collect_items(TokenKind::AnnotationBlockEnd) {
                if let BodyItem::Unit(unit) = item {
                    annotation_units.push(unit);
                }
            }
            if self.kind() == TokenKind::AnnotationBlockEnd {
                self.advance();
            }
        }

        let suffix = if annotation_units.is_empty() {
            String::new()
        } else {
            format!(" {{ {} }}", annotation_units.join(" "))
        };

        let units: Vec<&String> = items
            .iter()
            .filter_map(|i| match i {
                BodyItem::Unit(u) => Some(u),
                BodyItem::Comment(_) => None,
            })
            .collect();
        let has_comments = units.len() != items.len();

        if !has_comments && units.len() <= self.options.notes_per_line {
            let body = if units.is_empty() {
                String::from(" ")
            } else {
                format!(
                    " {} ",
                    units.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ")
                )
            };
            let line = format!("{decl} {{{body}}}{suffix}");
            if line.len() <= self.options.max_line_width {
                self.lines.push(line);
                return;
            }
        }

        // Wrapped form: notes_per_line units per line at one indent,
        // comments on their own line.
        self.lines.push(format!("{decl} {{"));
        let indent = " ".repeat(self.options.indent_size);
        let mut current: Vec<String> = Vec::new();
        for item in items {
            match item {
                BodyItem::Unit(unit) => {
                    current.push(unit);
                    if current.len() == self.options.notes_per_line {
                        self.lines.push(format!("{indent}{}", current.join(" ")));
                        current.clear();
                    }
                }
                BodyItem::Comment(comment) => {
                    if !current.is_empty() {
                        self.lines.push(format!("{indent}{}", current.join(" ")));
                        current.clear();
                    }
                    self.lines.push(format!("{indent}{comment}"));
                }
            }
        }
        if !current.is_empty() {
            self.lines.push(format!("{indent}{}", current.join(" ")));
        }
        self.lines.push(format!("}}{suffix}"));
    }

    /// Collect renderable units (and comments) until `stop`, which is left
    /// unconsumed.
    fn collect_items(&mut self, stop: TokenKind) -> Vec<BodyItem> {
        let mut items: Vec<BodyItem> = Vec::new();
        let mut glue_next = false;

        loop {
            self.skip_blank();
            let kind = self.kind();
            if kind == stop || kind == TokenKind::Eof {
                break;
            }

            match kind {
                TokenKind::Comment => {
                    items.push(BodyItem::Comment(self.text().to_string()));
                    self.advance();
                    glue_next = false;
                }
                TokenKind::Slur | TokenKind::Tie | TokenKind::Pedal => {
                    let text = self.text().to_string();
                    self.advance();
                    if self.options.space_around_connectives {
                        items.push(BodyItem::Unit(text));
                    } else {
                        match items.last_mut() {
                            Some(BodyItem::Unit(prev)) => {
                                prev.push_str(&text);
                                glue_next = true;
                            }
                            _ => items.push(BodyItem::Unit(text)),
                        }
                    }
                }
                TokenKind::Rest => {
                    let unit = self.build_rest_unit();
                    if !self.options.space_around_connectives {
                        if let Some(BodyItem::Unit(prev)) = items.last_mut() {
                            prev.push_str(&unit);
                            glue_next = false;
                            continue;
                        }
                    }
                    items.push(BodyItem::Unit(unit));
                    glue_next = false;
                }
                TokenKind::Grace => {
                    // A grace mark opens a unit that the next element joins,
                    // keeping token order intact.
                    let text = self.text().to_string();
                    self.advance();
                    if glue_next {
                        if let Some(BodyItem::Unit(prev)) = items.last_mut() {
                            prev.push_str(&text);
                            continue;
                        }
                    }
                    items.push(BodyItem::Unit(text));
                    glue_next = true;
                }
                _ => {
                    let unit = self.build_unit();
                    if glue_next {
                        if let Some(BodyItem::Unit(prev)) = items.last_mut() {
                            prev.push_str(&unit);
                            glue_next = false;
                            continue;
                        }
                    }
                    items.push(BodyItem::Unit(unit));
                    glue_next = false;
                }
            }
        }
        items
    }

    /// Build one unit from the current token.
    fn build_unit(&mut self) -> String {
        match self.kind() {
            TokenKind::Note => self.build_note_unit(),
            TokenKind::ChordStart => self.build_chord_unit(),
            TokenKind::BeamStart => {
                self.advance();
                let inner = self.collect_paren_units();
                format!("=({inner})")
            }
            TokenKind::Function => {
                let name = self.text().to_string();
                self.advance();
                self.skip_blank();
                if self.kind() == TokenKind::ParenOpen {
                    self.advance();
                    let inner = self.collect_paren_units();
                    format!("{name}({inner})")
                } else {
                    name
                }
            }
            _ => {
                let text = self.text().to_string();
                self.advance();
                text
            }
        }
    }

    /// A note and its directly attached postfix tokens.
    fn build_note_unit(&mut self) -> String {
        let mut unit = self.text().to_string();
        self.advance();
        while matches!(
            self.kind(),
            TokenKind::OctaveMod | TokenKind::Duration | TokenKind::Fingering
        ) {
            unit.push_str(self.text());
            self.advance();
        }
        unit
    }

    fn build_rest_unit(&mut self) -> String {
        let mut unit = self.text().to_string();
        self.advance();
        if self.kind() == TokenKind::Duration {
            unit.push_str(self.text());
            self.advance();
        }
        unit
    }

    fn build_chord_unit(&mut self) -> String {
        self.advance(); // [
        let mut pitches: Vec<String> = Vec::new();
        loop {
            self.skip_blank();
            match self.kind() {
                TokenKind::ChordEnd | TokenKind::Eof => break,
                TokenKind::Note => pitches.push(self.build_note_unit()),
                _ => {
                    pitches.push(self.text().to_string());
                    self.advance();
                }
            }
        }
        let mut unit = format!("[{}]", pitches.join(" "));
        if self.kind() == TokenKind::ChordEnd {
            self.advance();
            if self.kind() == TokenKind::Duration {
                unit.push_str(self.text());
                self.advance();
            }
        }
        unit
    }

    /// Units between `(` and `)`, joined with single spaces; commas attach
    /// to the unit before them.
    fn collect_paren_units(&mut self) -> String {
        let mut units: Vec<String> = Vec::new();
        loop {
            self.skip_blank();
            match self.kind() {
                TokenKind::ParenClose => {
                    self.advance();
                    break;
                }
                TokenKind::Eof => break,
                TokenKind::Comma => {
                    if let Some(last) = units.last_mut() {
                        last.push(',');
                    }
                    self.advance();
                }
                TokenKind::Comment => self.advance(),
                _ => {
                    let unit = self.build_unit();
                    units.push(unit);
                }
            }
        }
        units.join(" ")
    }

    /// Stray top-level tokens are kept, space-joined, on their own line.
    fn format_stray_line(&mut self) {
        let mut parts: Vec<String> = Vec::new();
        loop {
            match self.kind() {
                TokenKind::Eof
                | TokenKind::ContextDelim
                | TokenKind::StaveDecl
                | TokenKind::Comment
                | TokenKind::Newline => break,
                TokenKind::Whitespace => self.advance(),
                _ => {
                    parts.push(self.text().to_string());
                    self.advance();
                }
            }
        }
        if !parts.is_empty() {
            self.lines.push(parts.join(" "));
        }
    }
}

fn decode_context(content: &str) -> Option<serde_yaml::Mapping> {
    if content.trim().is_empty() {
        return Some(serde_yaml::Mapping::new());
    }
    let quoted = content
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix('&') {
                if let Some(colon) = rest.find(':') {
                    let indent = &line[..line.len() - trimmed.len()];
                    return format!("{indent}\"&{}\"{}", &rest[..colon], &rest[colon..]);
                }
            }
            line.to_string()
        })
        .collect::<Vec<_>>()
        .join("\n");
    serde_yaml::from_str(&quoted).ok()
}

/// Order-preserving key lookup in a YAML mapping.
fn mapping_get<'a>(
    mapping: &'a serde_yaml::Mapping,
    key: &str,
) -> Option<&'a serde_yaml::Value> {
    mapping
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

/// Render a scalar YAML value on one line, or None for composites.
fn scalar_yaml(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(_) | serde_yaml::Value::Number(_) | serde_yaml::Value::Bool(_) => {
            serde_yaml::to_string(value)
                .ok()
                .map(|s| s.trim_end().to_string())
        }
        _ => None,
    }
}

/// Minify a source string: structure-preserving whitespace elision.
pub fn minify(source: &str) -> String {
    let lexed = tokenize(source);
    let mut out = String::new();
    let mut prev_kind: Option<TokenKind> = None;

    for token in &lexed.tokens {
        match token.kind {
            TokenKind::Whitespace
            | TokenKind::Newline
            | TokenKind::Comment
            | TokenKind::Eof => continue,
            TokenKind::ContextDelim => {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str("---");
                out.push('\n');
            }
            TokenKind::YamlContent => {
                out.push_str(&token.text);
                out.push('\n');
            }
            TokenKind::StaveDecl => {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&token.text);
            }
            kind => {
                let needs_space = matches!(
                    kind,
                    TokenKind::Note | TokenKind::Rest | TokenKind::ChordStart
                ) && matches!(
                    prev_kind,
                    Some(
                        TokenKind::Note
                            | TokenKind::Rest
                            | TokenKind::Duration
                            | TokenKind::OctaveMod
                            | TokenKind::Fingering
                            | TokenKind::ChordEnd
                            | TokenKind::Function
                    )
                );
                if needs_space {
                    out.push(' ');
                }
                out.push_str(&token.text);
            }
        }
        prev_kind = Some(token.kind);
    }

    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}
