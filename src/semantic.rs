//! # Semantic validation
//!
//! Validates a parsed [`Score`] and reports diagnostics without ever
//! modifying the AST.
//!
//! ## Rules
//! - **error**: pitch octave outside 0..=8, fingering outside 1..=5, empty
//!   chord
//! - **warning**: a stave used in a body but not declared (when the
//!   metadata declares any stave at all), durations with more than two dots
//! - **info**: unusual enharmonic spellings (Cb, Fb, E#, B#)
//!
//! Beat totals are not checked here: the parser partitions measures by the
//! time signature and is the source of truth for measure contents.

use crate::ast::*;
use crate::error::{Diagnostic, Severity};

/// Result of validation. `valid` is true when no error-severity
/// diagnostic was produced.
#[derive(Debug, Clone)]
pub struct ValidateOutput {
    pub valid: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// Validate a score.
pub fn validate(score: &Score) -> ValidateOutput {
    let mut diagnostics = Vec::new();

    let any_declared = !score.metadata.staves.is_empty();
    for staff in &score.staves {
        if any_declared && !is_declared(&score.metadata, staff) {
            diagnostics.push(Diagnostic::warning(
                format!("stave '{}' is used but not declared", staff.name),
                staff.location.line.max(1),
                staff.location.column.max(1),
            ));
        }
        for measure in &staff.measures {
            for element in &measure.elements {
                validate_element(element, &mut diagnostics);
            }
        }
    }

    let valid = !diagnostics.iter().any(|d| d.severity == Severity::Error);
    ValidateOutput { valid, diagnostics }
}

fn is_declared(metadata: &Metadata, staff: &Staff) -> bool {
    metadata
        .staves
        .iter()
        .any(|d| d.name == staff.name && d.voice == staff.voice)
}

fn validate_element(element: &Element, diagnostics: &mut Vec<Diagnostic>) {
    match element {
        Element::Note(note) => {
            validate_pitch(&note.pitch, diagnostics);
            validate_duration(&note.duration, diagnostics);
            validate_annotation(note.annotation.as_ref(), note.location, diagnostics);
        }
        Element::Rest(rest) => {
            validate_duration(&rest.duration, diagnostics);
        }
        Element::Chord(chord) => {
            if chord.pitches.is_empty() {
                diagnostics.push(Diagnostic::error(
                    "empty chord",
                    chord.location.line,
                    chord.location.column,
                ));
            }
            for pitch in &chord.pitches {
                validate_pitch(pitch, diagnostics);
            }
            validate_duration(&chord.duration, diagnostics);
            validate_annotation(chord.annotation.as_ref(), chord.location, diagnostics);
        }
    }
}

fn validate_pitch(pitch: &Pitch, diagnostics: &mut Vec<Diagnostic>) {
    if pitch.octave > 8 {
        diagnostics.push(Diagnostic::error(
            format!(
                "octave {} is out of range for {}{} (expected 0..=8)",
                pitch.octave,
                pitch.name.as_str(),
                pitch.accidental.as_str()
            ),
            pitch.location.line,
            pitch.location.column,
        ));
    }

    let enharmonic = match (pitch.name, pitch.accidental) {
        (NoteName::C, Accidental::Flat) => Some("B"),
        (NoteName::F, Accidental::Flat) => Some("E"),
        (NoteName::E, Accidental::Sharp) => Some("F"),
        (NoteName::B, Accidental::Sharp) => Some("C"),
        _ => None,
    };
    if let Some(equivalent) = enharmonic {
        diagnostics.push(Diagnostic::info(
            format!(
                "{}{} is enharmonic with {}",
                pitch.name.as_str(),
                pitch.accidental.as_str(),
                equivalent
            ),
            pitch.location.line,
            pitch.location.column,
        ));
    }
}

fn validate_duration(duration: &Duration, diagnostics: &mut Vec<Diagnostic>) {
    if duration.dots > 2 {
        diagnostics.push(Diagnostic::warning(
            format!("duration with {} dots", duration.dots),
            duration.location.line.max(1),
            duration.location.column.max(1),
        ));
    }
}

fn validate_annotation(
    annotation: Option<&Annotation>,
    location: SourceLocation,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if let Some(fingering) = annotation.and_then(|a| a.fingering) {
        if !(1..=5).contains(&fingering) {
            diagnostics.push(Diagnostic::error(
                format!("fingering {fingering} is out of range (expected 1..=5)"),
                location.line,
                location.column,
            ));
        }
    }
}
