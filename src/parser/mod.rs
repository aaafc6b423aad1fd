//! # Parser
//!
//! Parses the token stream into a [`Score`] AST.
//!
//! ## Phases
//!
//! **Context blocks** - each `---`-delimited block is decoded as YAML (after
//! a preprocessing pass that quotes `&`-prefixed stave keys). The first
//! occurrence of `key`/`time` seeds the document metadata; later blocks
//! update the *active* key/time so that subsequent stave bodies pick up the
//! change.
//!
//! **Stave bodies** - `&name { … }` element streams parsed by recursive
//! descent: notes with sticky durations and relative octave arithmetic,
//! rests, chords, beam groups, grace notes, inline function application and
//! connectives (`~` slur, `^` tie, `*` pedal). An optional `{ … }`
//! annotation block after the body applies `fn(range, args…)` calls to the
//! body's elements by 1-based index.
//!
//! **Measure partitioning** - each body's elements are split into measures
//! against the active time signature: a measure closes when it is exactly
//! full, or before an element that would overflow it. A single element is
//! never split. The first measure of a staff carries full attributes;
//! later bodies attach only the key/time fields that changed since the
//! staff's previous body.
//!
//! ## Failure semantics
//! The parser always continues: unknown tokens outside structured positions
//! are skipped without diagnostics, YAML failures become error diagnostics
//! for their block, and any internal failure is converted into a synthetic
//! error diagnostic with `ast = None`.

use crate::ast::*;
use crate::error::{Diagnostic, ScoreError};
use crate::lexer::{tokenize, Token, TokenKind};
use std::collections::HashMap;

/// Tolerance for beat-sum comparisons against the measure boundary.
const BEAT_EPSILON: f64 = 1e-6;

/// Result of parsing: the AST (absent after an internal failure) plus
/// accumulated errors and warnings.
#[derive(Debug, Clone)]
pub struct ParseOutput {
    pub ast: Option<Score>,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

/// Parse a Scorelang source string.
pub fn parse(source: &str) -> ParseOutput {
    let lexed = tokenize(source);
    let mut parser = Parser::new(lexed.tokens);
    parser.errors.extend(lexed.errors);

    match parser.parse_score() {
        Ok(score) => ParseOutput {
            ast: Some(score),
            errors: parser.errors,
            warnings: parser.warnings,
        },
        Err(e) => {
            parser.errors.push(e.into_diagnostic());
            ParseOutput {
                ast: None,
                errors: parser.errors,
                warnings: parser.warnings,
            }
        }
    }
}

/// Key/time a staff saw at its previous body; used to detect mid-score
/// context changes.
#[derive(Clone, PartialEq)]
struct StaffContext {
    key: Option<String>,
    time: TimeSignature,
}

/// An argument in an annotation-block call.
enum CallArg {
    Num(u32),
    Str(String),
}

/// Parser for Scorelang token streams.
pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
    errors: Vec<Diagnostic>,
    warnings: Vec<Diagnostic>,
    metadata: Metadata,
    current_duration: Duration,
    active_key: Option<String>,
    active_time: TimeSignature,
    /// Staves in creation order; reordered on completion.
    staves: Vec<Staff>,
    staff_index: HashMap<String, usize>,
    staff_context: HashMap<String, StaffContext>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            metadata: Metadata::default(),
            current_duration: Duration::quarter(),
            active_key: None,
            active_time: TimeSignature::default(),
            staves: Vec::new(),
            staff_index: HashMap::new(),
            staff_context: HashMap::new(),
        }
    }

    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn kind(&self) -> TokenKind {
        self.current().map(|t| t.kind).unwrap_or(TokenKind::Eof)
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn current_location(&self) -> SourceLocation {
        self.current()
            .map(SourceLocation::from_token)
            .unwrap_or_default()
    }

    fn skip_trivia(&mut self) {
        while matches!(
            self.kind(),
            TokenKind::Whitespace | TokenKind::Newline | TokenKind::Comment
        ) {
            self.advance();
        }
    }

    fn parse_score(&mut self) -> Result<Score, ScoreError> {
        loop {
            self.skip_trivia();
            match self.kind() {
                TokenKind::Eof => break,
                TokenKind::ContextDelim => self.parse_context_block(),
                TokenKind::StaveDecl => self.parse_stave_section()?,
                // Anything else at the top level is skipped silently.
                _ => self.advance(),
            }
        }

        // Declared staves in declaration order, then undeclared staves in
        // first-use order.
        let mut staves: Vec<Staff> = Vec::with_capacity(self.staves.len());
        let mut taken = vec![false; self.staves.len()];
        for decl in &self.metadata.staves {
            let id = stave_identifier(&decl.name, decl.voice.as_deref());
            if let Some(&idx) = self.staff_index.get(&id) {
                if !taken[idx] {
                    taken[idx] = true;
                    staves.push(self.staves[idx].clone());
                }
            }
        }
        for (idx, staff) in self.staves.iter().enumerate() {
            if !taken[idx] {
                staves.push(staff.clone());
            }
        }

        // The last measure of each staff gets a final barline.
        for staff in &mut staves {
            if let Some(last) = staff.measures.last_mut() {
                last.barline = Barline::Final;
            }
        }

        Ok(Score {
            metadata: self.metadata.clone(),
            staves,
        })
    }

    // ------------------------------------------------------------------
    // Context blocks
    // ------------------------------------------------------------------

    fn parse_context_block(&mut self) {
        let block_location = self.current_location();
        self.advance(); // opening ---

        let mut lines: Vec<String> = Vec::new();
        loop {
            match self.kind() {
                TokenKind::ContextDelim => {
                    self.advance();
                    break;
                }
                TokenKind::Eof => break,
                TokenKind::YamlContent => {
                    lines.push(self.current().map(|t| t.text.clone()).unwrap_or_default());
                    self.advance();
                }
                _ => self.advance(),
            }
        }

        let content = lines.join("\n");
        if content.trim().is_empty() {
            return;
        }

        let prepared = quote_stave_keys(&content);
        let mapping: serde_yaml::Mapping = match serde_yaml::from_str(&prepared) {
            Ok(m) => m,
            Err(e) => {
                self.errors.push(Diagnostic::error(
                    format!("YAML error: {e}"),
                    block_location.line,
                    block_location.column,
                ));
                return;
            }
        };

        for (key, value) in &mapping {
            let Some(key) = key.as_str() else { continue };
            if let Some(identifier) = key.strip_prefix('&') {
                self.declare_stave(identifier, value, block_location);
            } else {
                self.apply_context_key(key, value, block_location);
            }
        }
    }

    fn declare_stave(
        &mut self,
        identifier: &str,
        value: &serde_yaml::Value,
        location: SourceLocation,
    ) {
        let (name, suffix_voice) = split_stave_identifier(identifier);

        let (clef, voice) = match value {
            serde_yaml::Value::Mapping(m) => {
                let clef = mapping_get(m, "clef")
                    .and_then(value_to_string)
                    .map(|s| Clef::from_name(&s))
                    .unwrap_or_default();
                let voice = mapping_get(m, "voice")
                    .and_then(value_to_string)
                    .or(suffix_voice);
                (clef, voice)
            }
            other => {
                let clef = value_to_string(other)
                    .map(|s| Clef::from_name(&s))
                    .unwrap_or_default();
                (clef, suffix_voice)
            }
        };

        let id = stave_identifier(&name, voice.as_deref());
        if self
            .metadata
            .staves
            .iter()
            .any(|d| stave_identifier(&d.name, d.voice.as_deref()) == id)
        {
            return;
        }
        self.metadata.staves.push(StaveDecl {
            name: name.clone(),
            clef,
            voice: voice.clone(),
        });

        // A declared stave is a part even if no body ever references it.
        match self.staff_index.get(&id) {
            Some(&idx) => self.staves[idx].clef = clef,
            None => {
                self.staff_index.insert(id, self.staves.len());
                self.staves.push(Staff {
                    name,
                    clef,
                    voice,
                    measures: Vec::new(),
                    location,
                });
            }
        }
    }

    fn apply_context_key(
        &mut self,
        key: &str,
        value: &serde_yaml::Value,
        location: SourceLocation,
    ) {
        match key {
            "title" => self.metadata.title = value_to_string(value),
            "composer" => self.metadata.composer = value_to_string(value),
            "key" => {
                if let Some(k) = value_to_string(value) {
                    if self.metadata.key.is_none() {
                        self.metadata.key = Some(k.clone());
                    }
                    self.active_key = Some(k);
                }
            }
            "time" => {
                let Some(raw) = value_to_string(value) else {
                    return;
                };
                match parse_time_signature(&raw) {
                    Ok(time) => {
                        if self.metadata.time.is_none() {
                            self.metadata.time = Some(time);
                        }
                        self.active_time = time;
                    }
                    Err(e) => self.errors.push(
                        Diagnostic::error(e.to_string(), location.line, location.column),
                    ),
                }
            }
            "tempo" => match value_to_string(value).and_then(|s| s.trim().parse::<u32>().ok()) {
                Some(bpm) if bpm > 0 => self.metadata.tempo = Some(bpm),
                _ => self.errors.push(Diagnostic::error(
                    "Invalid tempo: expected a positive integer",
                    location.line,
                    location.column,
                )),
            },
            "octave" => match value_to_string(value).and_then(|s| s.trim().parse::<u8>().ok()) {
                Some(octave) if octave <= 8 => self.metadata.default_octave = octave,
                _ => self.errors.push(Diagnostic::error(
                    "Invalid octave: expected an integer in 0..=8",
                    location.line,
                    location.column,
                )),
            },
            // Unrecognized metadata keys are ignored.
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Stave bodies
    // ------------------------------------------------------------------

    fn parse_stave_section(&mut self) -> Result<(), ScoreError> {
        let decl = self
            .current()
            .cloned()
            .ok_or_else(|| self.internal_error())?;
        let identifier = decl.text[1..].to_string();
        self.advance();

        self.skip_trivia();
        if self.kind() != TokenKind::StaveBodyStart {
            // A declaration without a body is skipped.
            return Ok(());
        }
        self.advance();

        let mut elements = self.parse_elements_until(TokenKind::StaveBodyEnd)?;
        if self.kind() == TokenKind::StaveBodyEnd {
            self.advance();
        }

        self.skip_trivia();
        if self.kind() == TokenKind::AnnotationBlockStart {
            self.parse_annotation_block(&mut elements)?;
        }

        self.finish_stave_body(&identifier, SourceLocation::from_token(&decl), elements);
        Ok(())
    }

    /// Parse elements until `stop` (or EOF). Used for stave bodies, beam
    /// groups and inline function arguments.
    fn parse_elements_until(&mut self, stop: TokenKind) -> Result<Vec<Element>, ScoreError> {
        let mut elements: Vec<Element> = Vec::new();
        let mut pending_slur_end = false;
        let mut pedal_open = false;

        loop {
            self.skip_trivia();
            let kind = self.kind();
            // An unclosed group still ends at the stave body's `}`.
            if kind == stop || kind == TokenKind::Eof || kind == TokenKind::StaveBodyEnd {
                break;
            }

            match kind {
                TokenKind::Note => {
                    let note = self.parse_note(false)?;
                    self.push_element(&mut elements, note, &mut pending_slur_end);
                }
                TokenKind::Rest => {
                    let rest = self.parse_rest()?;
                    self.push_element(&mut elements, rest, &mut pending_slur_end);
                }
                TokenKind::ChordStart => {
                    let chord = self.parse_chord()?;
                    self.push_element(&mut elements, chord, &mut pending_slur_end);
                }
                TokenKind::Duration => {
                    // A free-standing duration updates the sticky default.
                    let token = self.current().cloned().ok_or_else(|| self.internal_error())?;
                    self.current_duration =
                        parse_duration_text(&token.text, SourceLocation::from_token(&token));
                    self.advance();
                }
                TokenKind::BeamStart => {
                    self.advance();
                    let mut inner = self.parse_elements_until(TokenKind::ParenClose)?;
                    if self.kind() == TokenKind::ParenClose {
                        self.advance();
                    }
                    for element in &mut inner {
                        if let Element::Note(note) = element {
                            note.beamed = true;
                        }
                    }
                    for element in inner {
                        self.push_element(&mut elements, element, &mut pending_slur_end);
                    }
                }
                TokenKind::Grace => {
                    self.advance();
                    self.skip_trivia();
                    if self.kind() == TokenKind::Note {
                        let note = self.parse_note(true)?;
                        self.push_element(&mut elements, note, &mut pending_slur_end);
                    }
                }
                TokenKind::Function => {
                    let token = self.current().cloned().ok_or_else(|| self.internal_error())?;
                    self.advance();
                    self.skip_trivia();
                    if self.kind() != TokenKind::ParenOpen {
                        continue;
                    }
                    self.advance();
                    let mut inner = self.parse_elements_until(TokenKind::ParenClose)?;
                    if self.kind() == TokenKind::ParenClose {
                        self.advance();
                    }
                    self.apply_inline_function(&token, &mut inner);
                    for element in inner {
                        self.push_element(&mut elements, element, &mut pending_slur_end);
                    }
                }
                TokenKind::Slur => {
                    self.advance();
                    if let Some(prev) = elements.last_mut() {
                        if let Some(annotation) = prev.annotation_mut() {
                            annotation.slur_start = true;
                        }
                        pending_slur_end = true;
                    }
                }
                TokenKind::Tie => {
                    self.advance();
                    if let Some(prev) = elements.last_mut() {
                        prev.set_tied();
                    }
                }
                TokenKind::Pedal => {
                    self.advance();
                    if let Some(annotation) =
                        elements.last_mut().and_then(|e| e.annotation_mut())
                    {
                        if pedal_open {
                            annotation.pedal_end = true;
                        } else {
                            annotation.pedal_start = true;
                        }
                        pedal_open = !pedal_open;
                    }
                }
                // Repeat/volta markers, stray numbers and unknown tokens
                // are skipped.
                _ => self.advance(),
            }
        }

        Ok(elements)
    }

    fn push_element(
        &mut self,
        elements: &mut Vec<Element>,
        mut element: Element,
        pending_slur_end: &mut bool,
    ) {
        if *pending_slur_end {
            if let Some(annotation) = element.annotation_mut() {
                annotation.slur_end = true;
            }
            *pending_slur_end = false;
        }
        elements.push(element);
    }

    fn parse_note(&mut self, grace: bool) -> Result<Element, ScoreError> {
        let token = self.current().cloned().ok_or_else(|| self.internal_error())?;
        let start = SourceLocation::from_token(&token);
        self.advance();

        let (name, accidental, explicit_octave) = parse_pitch_text(&token.text);
        let mut octave = explicit_octave.unwrap_or(self.metadata.default_octave);
        let mut end = start;

        if self.kind() == TokenKind::OctaveMod {
            let modifier = self.current().cloned().ok_or_else(|| self.internal_error())?;
            octave = apply_octave_offset(octave, octave_mod_offset(&modifier.text));
            end = SourceLocation::from_token(&modifier);
            self.advance();
        }

        let duration = self.parse_optional_duration(start, &mut end);

        let mut annotation: Option<Annotation> = None;
        if self.kind() == TokenKind::Fingering {
            let fingering = self.current().cloned().ok_or_else(|| self.internal_error())?;
            if let Some(digit) = fingering.text.chars().nth(1).and_then(|c| c.to_digit(10)) {
                annotation
                    .get_or_insert_with(Annotation::default)
                    .fingering = Some(digit as u8);
            }
            end = SourceLocation::from_token(&fingering);
            self.advance();
        }

        let location = start.span_to(end);
        Ok(Element::Note(Note {
            pitch: Pitch {
                name,
                accidental,
                octave,
                location: start,
            },
            duration,
            tied: false,
            beamed: false,
            grace,
            annotation,
            location,
        }))
    }

    fn parse_rest(&mut self) -> Result<Element, ScoreError> {
        let token = self.current().cloned().ok_or_else(|| self.internal_error())?;
        let start = SourceLocation::from_token(&token);
        self.advance();

        let mut end = start;
        let duration = self.parse_optional_duration(start, &mut end);
        Ok(Element::Rest(Rest {
            duration,
            location: start.span_to(end),
        }))
    }

    fn parse_chord(&mut self) -> Result<Element, ScoreError> {
        let open = self.current().cloned().ok_or_else(|| self.internal_error())?;
        let start = SourceLocation::from_token(&open);
        self.advance();

        let mut pitches: Vec<Pitch> = Vec::new();
        loop {
            self.skip_trivia();
            match self.kind() {
                TokenKind::ChordEnd | TokenKind::Eof => break,
                TokenKind::Note => {
                    let token = self.current().cloned().ok_or_else(|| self.internal_error())?;
                    self.advance();
                    let (name, accidental, explicit_octave) = parse_pitch_text(&token.text);
                    let mut octave = explicit_octave.unwrap_or(self.metadata.default_octave);
                    if self.kind() == TokenKind::OctaveMod {
                        let modifier =
                            self.current().cloned().ok_or_else(|| self.internal_error())?;
                        octave = apply_octave_offset(octave, octave_mod_offset(&modifier.text));
                        self.advance();
                    }
                    // Per-pitch durations and fingerings inside a chord are
                    // consumed and ignored; the chord's duration follows `]`.
                    while matches!(self.kind(), TokenKind::Duration | TokenKind::Fingering) {
                        self.advance();
                    }
                    pitches.push(Pitch {
                        name,
                        accidental,
                        octave,
                        location: SourceLocation::from_token(&token),
                    });
                }
                _ => self.advance(),
            }
        }

        let mut end = self.current_location();
        if self.kind() == TokenKind::ChordEnd {
            self.advance();
        }

        let duration = self.parse_optional_duration(start, &mut end);
        Ok(Element::Chord(Chord {
            pitches,
            duration,
            tied: false,
            annotation: None,
            location: start.span_to(end),
        }))
    }

    /// Consume an explicit duration token if present (updating the sticky
    /// default), otherwise inherit the sticky default.
    fn parse_optional_duration(
        &mut self,
        fallback: SourceLocation,
        end: &mut SourceLocation,
    ) -> Duration {
        match self.current().cloned() {
            Some(token) if token.kind == TokenKind::Duration => {
                let duration =
                    parse_duration_text(&token.text, SourceLocation::from_token(&token));
                *end = SourceLocation::from_token(&token);
                self.advance();
                self.current_duration = duration.clone();
                duration
            }
            _ => Duration {
                base: self.current_duration.base,
                dots: self.current_duration.dots,
                location: fallback,
            },
        }
    }

    // ------------------------------------------------------------------
    // Inline functions and annotation blocks
    // ------------------------------------------------------------------

    fn apply_inline_function(&mut self, token: &Token, elements: &mut [Element]) {
        let name = token.text.as_str();

        if let Some(dynamic) = Dynamic::from_name(name) {
            if let Some(first) = first_annotatable(elements) {
                if let Some(a) = elements[first].annotation_mut() {
                    a.dynamic = Some(dynamic);
                }
            }
            return;
        }
        if let Some(articulation) = Articulation::from_name(name) {
            for element in elements.iter_mut() {
                if let Some(a) = element.annotation_mut() {
                    a.articulations.push(articulation);
                }
            }
            return;
        }

        match name {
            "slur" | "legato" => {
                self.mark_span(elements, |a, mark| match mark {
                    WedgeMark::Start => a.slur_start = true,
                    WedgeMark::End => a.slur_end = true,
                });
            }
            "cresc" | "crescendo" | "<" => {
                self.mark_span(elements, |a, mark| a.crescendo = Some(mark));
            }
            "decresc" | "decrescendo" | "dim" | ">" => {
                self.mark_span(elements, |a, mark| a.decrescendo = Some(mark));
            }
            _ => self.warnings.push(Diagnostic::warning(
                format!("unknown annotation function '{name}'"),
                token.line,
                token.column,
            )),
        }
    }

    /// Apply a start mark to the first annotatable element and an end mark
    /// to the last.
    fn mark_span(
        &mut self,
        elements: &mut [Element],
        apply: impl Fn(&mut Annotation, WedgeMark),
    ) {
        let Some(first) = first_annotatable(elements) else {
            return;
        };
        let last = last_annotatable(elements).unwrap_or(first);
        if let Some(a) = elements[first].annotation_mut() {
            apply(a, WedgeMark::Start);
        }
        if let Some(a) = elements[last].annotation_mut() {
            apply(a, WedgeMark::End);
        }
    }

    fn parse_annotation_block(&mut self, elements: &mut [Element]) -> Result<(), ScoreError> {
        self.advance(); // {

        loop {
            self.skip_trivia();
            match self.kind() {
                TokenKind::AnnotationBlockEnd => {
                    self.advance();
                    break;
                }
                TokenKind::Eof => break,
                TokenKind::Function => {
                    let token = self.current().cloned().ok_or_else(|| self.internal_error())?;
                    self.advance();
                    self.skip_trivia();
                    if self.kind() != TokenKind::ParenOpen {
                        continue;
                    }
                    self.advance();

                    let mut range: Option<(usize, usize)> = None;
                    let mut args: Vec<CallArg> = Vec::new();
                    loop {
                        self.skip_trivia();
                        match self.kind() {
                            TokenKind::ParenClose => {
                                self.advance();
                                break;
                            }
                            TokenKind::Eof | TokenKind::AnnotationBlockEnd => break,
                            TokenKind::Number => {
                                let n = self
                                    .current()
                                    .and_then(|t| t.text.parse::<u32>().ok())
                                    .unwrap_or(0);
                                if range.is_none() {
                                    range = Some((n as usize, n as usize));
                                } else {
                                    args.push(CallArg::Num(n));
                                }
                                self.advance();
                            }
                            TokenKind::Range => {
                                let text = self
                                    .current()
                                    .map(|t| t.text.clone())
                                    .unwrap_or_default();
                                if let Some((lo, hi)) = text.split_once('-') {
                                    let lo = lo.parse::<usize>().unwrap_or(0);
                                    let hi = hi.parse::<usize>().unwrap_or(lo);
                                    range = Some((lo, hi));
                                }
                                self.advance();
                            }
                            TokenKind::String => {
                                let raw = self
                                    .current()
                                    .map(|t| t.text.clone())
                                    .unwrap_or_default();
                                args.push(CallArg::Str(
                                    raw.trim_matches('"').to_string(),
                                ));
                                self.advance();
                            }
                            TokenKind::Comma => self.advance(),
                            _ => self.advance(),
                        }
                    }

                    self.apply_annotation_call(&token, range, args, elements);
                }
                _ => self.advance(),
            }
        }
        Ok(())
    }

    fn apply_annotation_call(
        &mut self,
        token: &Token,
        range: Option<(usize, usize)>,
        args: Vec<CallArg>,
        elements: &mut [Element],
    ) {
        let name = token.text.as_str();
        let Some((lo, hi)) = range else {
            self.warnings.push(Diagnostic::warning(
                format!("annotation function '{name}' is missing an index or range"),
                token.line,
                token.column,
            ));
            return;
        };

        if lo < 1 || hi > elements.len() || lo > hi {
            self.warnings.push(Diagnostic::warning(
                format!(
                    "annotation range {lo}-{hi} is out of bounds for {} elements",
                    elements.len()
                ),
                token.line,
                token.column,
            ));
        }
        let lo = lo.max(1);
        let hi = hi.min(elements.len());
        if lo > hi {
            return;
        }
        // Convert to 0-based inclusive bounds.
        let (first, last) = (lo - 1, hi - 1);

        if let Some(dynamic) = Dynamic::from_name(name) {
            for element in &mut elements[first..=last] {
                if let Some(a) = element.annotation_mut() {
                    a.dynamic = Some(dynamic);
                }
            }
            return;
        }
        if let Some(articulation) = Articulation::from_name(name) {
            for element in &mut elements[first..=last] {
                if let Some(a) = element.annotation_mut() {
                    a.articulations.push(articulation);
                }
            }
            return;
        }

        match name {
            "cresc" | "crescendo" | "<" => {
                if let Some(a) = elements[first].annotation_mut() {
                    a.crescendo = Some(WedgeMark::Start);
                }
                if let Some(a) = elements[last].annotation_mut() {
                    a.crescendo = Some(WedgeMark::End);
                }
            }
            "decresc" | "decrescendo" | "dim" | ">" => {
                if let Some(a) = elements[first].annotation_mut() {
                    a.decrescendo = Some(WedgeMark::Start);
                }
                if let Some(a) = elements[last].annotation_mut() {
                    a.decrescendo = Some(WedgeMark::End);
                }
            }
            "slur" => {
                if let Some(a) = elements[first].annotation_mut() {
                    a.slur_start = true;
                }
                if let Some(a) = elements[last].annotation_mut() {
                    a.slur_end = true;
                }
            }
            "tie" => {
                for element in &mut elements[first..=last] {
                    element.set_tied();
                }
            }
            "text" => {
                if let Some(CallArg::Str(s)) = args.into_iter().next() {
                    if let Some(a) = elements[first].annotation_mut() {
                        a.text = Some(s);
                    }
                }
            }
            "finger" => {
                if let Some(CallArg::Num(n)) = args.first() {
                    let n = (*n).min(u8::MAX as u32) as u8;
                    for element in &mut elements[first..=last] {
                        if let Some(a) = element.annotation_mut() {
                            a.fingering = Some(n);
                        }
                    }
                }
            }
            _ => self.warnings.push(Diagnostic::warning(
                format!("unknown annotation function '{name}'"),
                token.line,
                token.column,
            )),
        }
    }

    // ------------------------------------------------------------------
    // Measure partitioning
    // ------------------------------------------------------------------

    fn finish_stave_body(
        &mut self,
        identifier: &str,
        location: SourceLocation,
        elements: Vec<Element>,
    ) {
        let mut measures = partition_measures(elements, self.active_time);

        let first_body = !self.staff_context.contains_key(identifier);
        let attributes = if first_body {
            Some(MeasureAttributes {
                key: self.active_key.clone(),
                time: Some(self.active_time),
                clef: Some(self.clef_for(identifier)),
            })
        } else {
            let previous = &self.staff_context[identifier];
            let key_changed = previous.key != self.active_key;
            let time_changed = previous.time != self.active_time;
            if key_changed || time_changed {
                Some(MeasureAttributes {
                    key: if key_changed {
                        self.active_key.clone()
                    } else {
                        None
                    },
                    time: time_changed.then_some(self.active_time),
                    clef: None,
                })
            } else {
                None
            }
        };
        if let (Some(attrs), Some(first)) = (attributes, measures.first_mut()) {
            first.attributes = Some(attrs);
        }

        self.staff_context.insert(
            identifier.to_string(),
            StaffContext {
                key: self.active_key.clone(),
                time: self.active_time,
            },
        );

        match self.staff_index.get(identifier) {
            Some(&idx) => self.staves[idx].measures.extend(measures),
            None => {
                let (name, voice) = split_stave_identifier(identifier);
                self.staff_index
                    .insert(identifier.to_string(), self.staves.len());
                self.staves.push(Staff {
                    name,
                    clef: Clef::default(),
                    voice,
                    measures,
                    location,
                });
            }
        }
    }

    fn clef_for(&self, identifier: &str) -> Clef {
        self.metadata
            .staves
            .iter()
            .find(|d| stave_identifier(&d.name, d.voice.as_deref()) == identifier)
            .map(|d| d.clef)
            .unwrap_or_default()
    }

    fn internal_error(&self) -> ScoreError {
        let location = self.current_location();
        ScoreError::ParseError {
            line: location.line.max(1),
            column: location.column.max(1),
            message: "Unknown parse error".to_string(),
        }
    }
}

/// Split a body's elements into measures against the time signature.
///
/// A measure closes when its beat sum reaches the capacity, or before an
/// element that would overflow a non-empty measure. Single elements are
/// never split, so an oversized element occupies a measure alone.
fn partition_measures(elements: Vec<Element>, time: TimeSignature) -> Vec<Measure> {
    let capacity = time.beats as f64;
    let mut measures: Vec<Measure> = Vec::new();
    let mut current: Vec<Element> = Vec::new();
    let mut accumulated = 0.0;

    for element in elements {
        let beats = element.beats();
        if !current.is_empty() && accumulated + beats > capacity + BEAT_EPSILON {
            measures.push(Measure {
                elements: std::mem::take(&mut current),
                barline: Barline::Regular,
                attributes: None,
            });
            accumulated = 0.0;
        }
        accumulated += beats;
        current.push(element);
        if accumulated + BEAT_EPSILON >= capacity {
            measures.push(Measure {
                elements: std::mem::take(&mut current),
                barline: Barline::Regular,
                attributes: None,
            });
            accumulated = 0.0;
        }
    }
    if !current.is_empty() {
        measures.push(Measure {
            elements: current,
            barline: Barline::Regular,
            attributes: None,
        });
    }
    measures
}

/// Quote `&`-prefixed keys so the YAML decoder accepts stave declarations.
fn quote_stave_keys(content: &str) -> String {
    content
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
        .join("\n")
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

fn value_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_time_signature(s: &str) -> Result<TimeSignature, ScoreError> {
    let parts: Vec<&str> = s.trim().split('/').collect();
    if parts.len() != 2 {
        return Err(ScoreError::MetadataError(format!(
            "Invalid time signature: {s}"
        )));
    }
    let beats = parts[0]
        .parse::<u32>()
        .ok()
        .filter(|&b| b >= 1)
        .ok_or_else(|| ScoreError::MetadataError(format!("Invalid time signature beats: {s}")))?;
    let beat_type = parts[1]
        .parse::<u32>()
        .ok()
        .filter(|b| matches!(b, 2 | 4 | 8 | 16))
        .ok_or_else(|| {
            ScoreError::MetadataError(format!("Invalid time signature beat type: {s}"))
        })?;
    Ok(TimeSignature { beats, beat_type })
}

/// Decompose a NOTE token's text into name, accidental and explicit octave.
fn parse_pitch_text(text: &str) -> (NoteName, Accidental, Option<u8>) {
    let mut chars = text.chars();
    let name = chars
        .next()
        .and_then(NoteName::from_char)
        .unwrap_or_default();

    let accidental_len = text[1..]
        .chars()
        .take_while(|&c| c == '#' || c == 'b')
        .count();
    let accidental = Accidental::from_str(&text[1..1 + accidental_len]);
    let octave = text[1 + accidental_len..].parse::<u8>().ok();
    (name, accidental, octave)
}

fn octave_mod_offset(text: &str) -> i8 {
    match text {
        "+" => 1,
        "++" => 2,
        "-" => -1,
        "--" => -2,
        _ => 0,
    }
}

/// Relative octave arithmetic saturates into 0..=8.
fn apply_octave_offset(octave: u8, offset: i8) -> u8 {
    (octave as i16 + offset as i16).clamp(0, 8) as u8
}

/// Parse a DURATION token's text (`/N` with optional dots, or a lone `.`
/// meaning dotted quarter).
fn parse_duration_text(text: &str, location: SourceLocation) -> Duration {
    if text == "." {
        return Duration {
            base: DurationBase::Quarter,
            dots: 1,
            location,
        };
    }
    let digits: String = text[1..].chars().take_while(|c| c.is_ascii_digit()).collect();
    let dots = text.chars().rev().take_while(|&c| c == '.').count() as u8;
    let base = digits
        .parse::<u32>()
        .ok()
        .and_then(DurationBase::from_denominator)
        .unwrap_or_default();
    Duration {
        base,
        dots,
        location,
    }
}

fn stave_identifier(name: &str, voice: Option<&str>) -> String {
    match voice {
        Some(v) => format!("{name}+{v}"),
        None => name.to_string(),
    }
}

fn split_stave_identifier(identifier: &str) -> (String, Option<String>) {
    match identifier.split_once('+') {
        Some((name, voice)) => (name.to_string(), Some(voice.to_string())),
        None => (identifier.to_string(), None),
    }
}

fn first_annotatable(elements: &[Element]) -> Option<usize> {
    elements
        .iter()
        .position(|e| matches!(e, Element::Note(_) | Element::Chord(_)))
}

fn last_annotatable(elements: &[Element]) -> Option<usize> {
    elements
        .iter()
        .rposition(|e| matches!(e, Element::Note(_) | Element::Chord(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Score {
        let out = parse(source);
        assert!(out.errors.is_empty(), "unexpected errors: {:?}", out.errors);
        out.ast.expect("expected an AST")
    }

    fn single_staff_elements(score: &Score) -> Vec<Element> {
        score.staves[0]
            .measures
            .iter()
            .flat_map(|m| m.elements.iter().cloned())
            .collect()
    }

    const HEADER: &str = "---\ntime: 4/4\n&m:\n  clef: treble\n---\n";

    #[test]
    fn test_metadata_decoding() {
        let source = "---\ntitle: Air\ncomposer: Anon\nkey: G\ntime: 3/4\ntempo: 96\noctave: 5\n&m:\n  clef: bass\n---\n&m { C }";
        let score = parse_ok(source);
        assert_eq!(score.metadata.title.as_deref(), Some("Air"));
        assert_eq!(score.metadata.composer.as_deref(), Some("Anon"));
        assert_eq!(score.metadata.key.as_deref(), Some("G"));
        assert_eq!(
            score.metadata.time,
            Some(TimeSignature {
                beats: 3,
                beat_type: 4
            })
        );
        assert_eq!(score.metadata.tempo, Some(96));
        assert_eq!(score.metadata.default_octave, 5);
        assert_eq!(score.metadata.staves.len(), 1);
        assert_eq!(score.metadata.staves[0].clef, Clef::Bass);
    }

    #[test]
    fn test_invalid_yaml_reports_error() {
        let out = parse("---\ntitle: [unclosed\n---\n&m { C }");
        assert!(out
            .errors
            .iter()
            .any(|e| e.message.starts_with("YAML error:")));
        // Best-effort: the body still parses.
        assert!(out.ast.is_some());
    }

    #[test]
    fn test_measure_partitioning_4_4() {
        let score = parse_ok(&format!("{HEADER}&m {{ C D E F G A B C }}"));
        let measures = &score.staves[0].measures;
        assert_eq!(measures.len(), 2);
        assert_eq!(measures[0].elements.len(), 4);
        assert_eq!(measures[1].elements.len(), 4);
        assert_eq!(measures[1].barline, Barline::Final);
    }

    #[test]
    fn test_partitioning_closes_before_overflow() {
        // half + half = 4 beats? No: half (2) + half (2) = 4, then quarter
        // starts measure two.
        let score = parse_ok(&format!("{HEADER}&m {{ C/2 D/2 E/4 }}"));
        let measures = &score.staves[0].measures;
        assert_eq!(measures.len(), 2);
        assert_eq!(measures[0].elements.len(), 2);
        assert_eq!(measures[1].elements.len(), 1);
    }

    #[test]
    fn test_oversized_element_is_not_split() {
        let score = parse_ok("---\ntime: 2/4\n&m:\n  clef: treble\n---\n&m { C/1 D }");
        let measures = &score.staves[0].measures;
        assert_eq!(measures.len(), 2);
        assert_eq!(measures[0].elements.len(), 1);
        assert_eq!(measures[0].elements[0].beats(), 4.0);
    }

    #[test]
    fn test_sticky_duration() {
        let score = parse_ok(&format!("{HEADER}&m {{ C/8 D E/4 F }}"));
        let elements = single_staff_elements(&score);
        let bases: Vec<_> = elements.iter().map(|e| e.duration().base).collect();
        assert_eq!(
            bases,
            vec![
                DurationBase::Eighth,
                DurationBase::Eighth,
                DurationBase::Quarter,
                DurationBase::Quarter,
            ]
        );
    }

    #[test]
    fn test_standalone_duration_updates_default() {
        let score = parse_ok(&format!("{HEADER}&m {{ /8 C D }}"));
        let elements = single_staff_elements(&score);
        assert!(elements
            .iter()
            .all(|e| e.duration().base == DurationBase::Eighth));
    }

    #[test]
    fn test_relative_octave_saturates() {
        let score = parse_ok(&format!("{HEADER}&m {{ C8++ C0-- C+ }}"));
        let elements = single_staff_elements(&score);
        let octaves: Vec<u8> = elements
            .iter()
            .map(|e| match e {
                Element::Note(n) => n.pitch.octave,
                _ => panic!("expected notes"),
            })
            .collect();
        assert_eq!(octaves, vec![8, 0, 5]);
    }

    #[test]
    fn test_explicit_octave_with_modifier_is_additive() {
        let score = parse_ok(&format!("{HEADER}&m {{ C3+ }}"));
        match &single_staff_elements(&score)[0] {
            Element::Note(n) => assert_eq!(n.pitch.octave, 4),
            other => panic!("expected note, got {other:?}"),
        }
    }

    #[test]
    fn test_chord_duration_and_pitches() {
        let score = parse_ok(&format!("{HEADER}&m {{ [C E G]/2 }}"));
        match &single_staff_elements(&score)[0] {
            Element::Chord(chord) => {
                assert_eq!(chord.pitches.len(), 3);
                assert_eq!(chord.duration.base, DurationBase::Half);
            }
            other => panic!("expected chord, got {other:?}"),
        }
    }

    #[test]
    fn test_beam_group_flattens() {
        let score = parse_ok(&format!("{HEADER}&m {{ =(C/8 D E F) G }}"));
        let elements = single_staff_elements(&score);
        assert_eq!(elements.len(), 5);
        for element in &elements[..4] {
            match element {
                Element::Note(n) => assert!(n.beamed),
                other => panic!("expected note, got {other:?}"),
            }
        }
        match &elements[4] {
            Element::Note(n) => assert!(!n.beamed),
            other => panic!("expected note, got {other:?}"),
        }
    }

    #[test]
    fn test_grace_note() {
        let score = parse_ok(&format!("{HEADER}&m {{ `C D }}"));
        let elements = single_staff_elements(&score);
        match &elements[0] {
            Element::Note(n) => assert!(n.grace),
            other => panic!("expected note, got {other:?}"),
        }
    }

    #[test]
    fn test_tie_connective() {
        let score = parse_ok(&format!("{HEADER}&m {{ C ^ C }}"));
        let elements = single_staff_elements(&score);
        match &elements[0] {
            Element::Note(n) => assert!(n.tied),
            other => panic!("expected note, got {other:?}"),
        }
    }

    #[test]
    fn test_slur_connective_marks_both_sides() {
        let score = parse_ok(&format!("{HEADER}&m {{ C ~ D }}"));
        let elements = single_staff_elements(&score);
        assert!(elements[0].annotation().is_some_and(|a| a.slur_start));
        assert!(elements[1].annotation().is_some_and(|a| a.slur_end));
    }

    #[test]
    fn test_pedal_connective_toggles() {
        let score = parse_ok(&format!("{HEADER}&m {{ C* D E* }}"));
        let elements = single_staff_elements(&score);
        assert!(elements[0].annotation().is_some_and(|a| a.pedal_start));
        assert!(elements[2].annotation().is_some_and(|a| a.pedal_end));
    }

    #[test]
    fn test_inline_dynamic_applies_to_first_note() {
        let score = parse_ok(&format!("{HEADER}&m {{ mf(C D E) }}"));
        let elements = single_staff_elements(&score);
        assert_eq!(
            elements[0].annotation().and_then(|a| a.dynamic),
            Some(Dynamic::Mf)
        );
        assert!(elements[1].annotation().is_none());
    }

    #[test]
    fn test_inline_articulation_applies_to_all() {
        let score = parse_ok(&format!("{HEADER}&m {{ st(C D) }}"));
        let elements = single_staff_elements(&score);
        for element in &elements {
            assert!(element
                .annotation()
                .is_some_and(|a| a.articulations.contains(&Articulation::Staccato)));
        }
    }

    #[test]
    fn test_inline_slur_and_cresc() {
        let score = parse_ok(&format!("{HEADER}&m {{ slur(C D E) <(F G) }}"));
        let elements = single_staff_elements(&score);
        assert!(elements[0].annotation().is_some_and(|a| a.slur_start));
        assert!(elements[2].annotation().is_some_and(|a| a.slur_end));
        assert_eq!(
            elements[3].annotation().and_then(|a| a.crescendo),
            Some(WedgeMark::Start)
        );
        assert_eq!(
            elements[4].annotation().and_then(|a| a.crescendo),
            Some(WedgeMark::End)
        );
    }

    #[test]
    fn test_unknown_inline_function_warns() {
        let out = parse(&format!("{HEADER}&m {{ wobble(C D) }}"));
        assert!(out
            .warnings
            .iter()
            .any(|w| w.message.contains("unknown annotation function")));
        // The enclosed notes still splice into the stream.
        assert_eq!(
            single_staff_elements(&out.ast.unwrap()).len(),
            2
        );
    }

    #[test]
    fn test_annotation_block_dynamics_and_finger() {
        let score = parse_ok(&format!(
            "{HEADER}&m {{ C D E F }} {{ ff(1-2) finger(3-4, 2) }}"
        ));
        let elements = single_staff_elements(&score);
        assert_eq!(
            elements[0].annotation().and_then(|a| a.dynamic),
            Some(Dynamic::Ff)
        );
        assert_eq!(
            elements[1].annotation().and_then(|a| a.dynamic),
            Some(Dynamic::Ff)
        );
        assert_eq!(
            elements[2].annotation().and_then(|a| a.fingering),
            Some(2)
        );
        assert_eq!(
            elements[3].annotation().and_then(|a| a.fingering),
            Some(2)
        );
    }

    #[test]
    fn test_annotation_block_text_and_tie() {
        let score = parse_ok(&format!(
            "{HEADER}&m {{ C D }} {{ text(1, \"dolce\") tie(1-2) }}"
        ));
        let elements = single_staff_elements(&score);
        assert_eq!(
            elements[0].annotation().and_then(|a| a.text.clone()),
            Some("dolce".to_string())
        );
        for element in &elements {
            match element {
                Element::Note(n) => assert!(n.tied),
                other => panic!("expected note, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_annotation_block_out_of_range_warns() {
        let out = parse(&format!("{HEADER}&m {{ C D }} {{ ff(5-9) }}"));
        assert!(out
            .warnings
            .iter()
            .any(|w| w.message.contains("out of bounds")));
    }

    #[test]
    fn test_undeclared_staves_follow_declared() {
        let source =
            "---\n&right:\n  clef: treble\n---\n&extra { C }\n&right { D }";
        let score = parse_ok(source);
        let names: Vec<_> = score.staves.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["right", "extra"]);
    }

    #[test]
    fn test_undeclared_stave_defaults_to_treble() {
        let score = parse_ok("&solo { C }");
        assert_eq!(score.staves[0].clef, Clef::Treble);
    }

    #[test]
    fn test_mid_score_key_change_sets_attributes() {
        let source = "---\nkey: C\ntime: 4/4\n&m:\n  clef: treble\n---\n&m { C D E F }\n---\nkey: G\n---\n&m { G A B C }";
        let score = parse_ok(source);
        let measures = &score.staves[0].measures;
        assert_eq!(measures.len(), 2);
        let first_attrs = measures[0].attributes.as_ref().expect("first measure attrs");
        assert_eq!(first_attrs.key.as_deref(), Some("C"));
        assert!(first_attrs.time.is_some());
        assert!(first_attrs.clef.is_some());
        let change = measures[1].attributes.as_ref().expect("change attrs");
        assert_eq!(change.key.as_deref(), Some("G"));
        assert!(change.time.is_none());
        assert!(change.clef.is_none());
    }

    #[test]
    fn test_no_attributes_without_change() {
        let source = "---\nkey: C\n&m:\n  clef: treble\n---\n&m { C D E F }\n&m { G A B C }";
        let score = parse_ok(source);
        let measures = &score.staves[0].measures;
        assert_eq!(measures.len(), 2);
        assert!(measures[1].attributes.is_none());
    }

    #[test]
    fn test_declared_but_unused_stave_is_a_part() {
        let source = "---\n&a:\n  clef: treble\n&b:\n  clef: bass\n---\n&a { C }";
        let score = parse_ok(source);
        assert_eq!(score.staves.len(), 2);
        assert!(score.staves[1].measures.is_empty());
    }

    #[test]
    fn test_stave_voice_suffix() {
        let score = parse_ok("---\n&m+1:\n  clef: treble\n---\n&m+1 { C }");
        assert_eq!(score.staves[0].name, "m");
        assert_eq!(score.staves[0].voice.as_deref(), Some("1"));
    }

    #[test]
    fn test_repeat_markers_are_skipped() {
        let score = parse_ok(&format!("{HEADER}&m {{ |: C D :| |1 E F }}"));
        assert_eq!(single_staff_elements(&score).len(), 4);
    }

    #[test]
    fn test_lexer_errors_surface_in_parse() {
        let out = parse(&format!("{HEADER}&m {{ CD }}"));
        assert!(out
            .errors
            .iter()
            .any(|e| e.message.contains("separated by whitespace")));
    }

    #[test]
    fn test_quote_stave_keys() {
        let quoted = quote_stave_keys("title: x\n&main:\n  clef: treble");
        assert!(quoted.contains("\"&main\":"));
        assert!(quoted.contains("title: x"));
    }

    #[test]
    fn test_parse_time_signature_rejects_bad_beat_type() {
        assert!(parse_time_signature("4/3").is_err());
        assert!(parse_time_signature("4").is_err());
        assert!(parse_time_signature("6/8").is_ok());
    }
}
