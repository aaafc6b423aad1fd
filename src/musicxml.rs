//! # MusicXML generation
//!
//! Generates a partwise MusicXML 4.0 document from a [`Score`] AST.
//!
//! Every staff becomes a `<part>`; when the score has more than one staff
//! the part list is wrapped in a bracketed `<part-group>`. Parts are padded
//! to a common measure count with whole-bar rests so the document stays
//! rectangular.
//!
//! Durations are expressed with `divisions = 4` per quarter note, computed
//! as `round(beats × 4)` from the same beat table the parser partitions
//! with. Key signatures are encoded on the circle of fifths; dynamics and
//! hairpins are emitted as `<direction>` elements immediately before the
//! note that carries them.

use crate::ast::*;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;

/// Output options for the generator.
#[derive(Debug, Clone, Copy)]
pub struct XmlOptions {
    pub include_xml_declaration: bool,
    pub pretty_print: bool,
}

impl Default for XmlOptions {
    fn default() -> Self {
        Self {
            include_xml_declaration: true,
            pretty_print: false,
        }
    }
}

/// MusicXML divisions per quarter note.
const DIVISIONS: u32 = 4;

/// Convert a score to MusicXML with default options.
pub fn to_musicxml(score: &Score) -> String {
    to_musicxml_with_options(score, &XmlOptions::default())
}

/// Convert a score to MusicXML.
pub fn to_musicxml_with_options(score: &Score, options: &XmlOptions) -> String {
    let cursor = Cursor::new(Vec::new());
    let mut writer = if options.pretty_print {
        Writer::new_with_indent(cursor, b' ', 2)
    } else {
        Writer::new(cursor)
    };

    if options.include_xml_declaration {
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .unwrap();
        // quick-xml has no doctype event; write it through the inner buffer.
        writer.get_mut().get_mut().extend_from_slice(
            b"<!DOCTYPE score-partwise PUBLIC \"-//Recordare//DTD MusicXML 4.0 Partwise//EN\" \"http://www.musicxml.org/dtds/partwise.dtd\">",
        );
    }

    let mut root = BytesStart::new("score-partwise");
    root.push_attribute(("version", "4.0"));
    writer.write_event(Event::Start(root)).unwrap();

    if let Some(title) = &score.metadata.title {
        writer
            .write_event(Event::Start(BytesStart::new("work")))
            .unwrap();
        write_text_element(&mut writer, "work-title", title);
        writer
            .write_event(Event::End(BytesEnd::new("work")))
            .unwrap();
    }

    if let Some(composer) = &score.metadata.composer {
        writer
            .write_event(Event::Start(BytesStart::new("identification")))
            .unwrap();
        let mut creator = BytesStart::new("creator");
        creator.push_attribute(("type", "composer"));
        writer.write_event(Event::Start(creator)).unwrap();
        writer
            .write_event(Event::Text(BytesText::new(composer)))
            .unwrap();
        writer
            .write_event(Event::End(BytesEnd::new("creator")))
            .unwrap();
        writer
            .write_event(Event::End(BytesEnd::new("identification")))
            .unwrap();
    }

    let bracketed = score.staves.len() > 1;
    writer
        .write_event(Event::Start(BytesStart::new("part-list")))
        .unwrap();
    if bracketed {
        let mut group = BytesStart::new("part-group");
        group.push_attribute(("type", "start"));
        group.push_attribute(("number", "1"));
        writer.write_event(Event::Start(group)).unwrap();
        write_text_element(&mut writer, "group-symbol", "bracket");
        writer
            .write_event(Event::End(BytesEnd::new("part-group")))
            .unwrap();
    }
    for (index, staff) in score.staves.iter().enumerate() {
        let mut part = BytesStart::new("score-part");
        let id = format!("P{}", index + 1);
        part.push_attribute(("id", id.as_str()));
        writer.write_event(Event::Start(part)).unwrap();
        write_text_element(&mut writer, "part-name", &staff.name);
        writer
            .write_event(Event::End(BytesEnd::new("score-part")))
            .unwrap();
    }
    if bracketed {
        let mut group = BytesStart::new("part-group");
        group.push_attribute(("type", "stop"));
        group.push_attribute(("number", "1"));
        writer.write_event(Event::Empty(group)).unwrap();
    }
    writer
        .write_event(Event::End(BytesEnd::new("part-list")))
        .unwrap();

    let max_measures = score
        .staves
        .iter()
        .map(|s| s.measures.len())
        .max()
        .unwrap_or(0);

    for (index, staff) in score.staves.iter().enumerate() {
        let mut part = BytesStart::new("part");
        let id = format!("P{}", index + 1);
        part.push_attribute(("id", id.as_str()));
        writer.write_event(Event::Start(part)).unwrap();
        write_part_measures(&mut writer, score, staff, max_measures, index == 0);
        writer
            .write_event(Event::End(BytesEnd::new("part")))
            .unwrap();
    }

    writer
        .write_event(Event::End(BytesEnd::new("score-partwise")))
        .unwrap();

    String::from_utf8(writer.into_inner().into_inner()).unwrap()
}

fn write_part_measures<W: std::io::Write>(
    writer: &mut Writer<W>,
    score: &Score,
    staff: &Staff,
    max_measures: usize,
    is_first_part: bool,
) {
    // The prevailing key and time, updated by mid-score attribute changes,
    // size the padding rests and seed the first-measure attributes.
    let mut key = score.metadata.key.clone();
    let mut time = score.metadata.time.unwrap_or_default();

    for index in 0..max_measures.max(1) {
        let mut measure_elem = BytesStart::new("measure");
        let number = (index + 1).to_string();
        measure_elem.push_attribute(("number", number.as_str()));
        writer.write_event(Event::Start(measure_elem)).unwrap();

        let measure = staff.measures.get(index);
        if let Some(measure) = measure {
            if let Some(attrs) = &measure.attributes {
                if let Some(k) = &attrs.key {
                    key = Some(k.clone());
                }
                if let Some(t) = attrs.time {
                    time = t;
                }
            }
        }

        if index == 0 {
            write_attributes(writer, true, key.as_deref(), Some(time), Some(staff.clef));
            if is_first_part {
                if let Some(tempo) = score.metadata.tempo {
                    write_tempo_direction(writer, tempo);
                }
            }
        } else if let Some(measure) = measure {
            if let Some(attrs) = &measure.attributes {
                if !attrs.is_empty() {
                    write_attributes(
                        writer,
                        false,
                        attrs.key.as_deref(),
                        attrs.time,
                        attrs.clef,
                    );
                }
            }
        }

        match measure {
            Some(measure) => {
                let states = beam_states(&measure.elements);
                for (element, state) in measure.elements.iter().zip(states.iter()) {
                    write_element(writer, element, *state);
                }
                if measure.barline == Barline::Final {
                    write_final_barline(writer);
                }
            }
            None => write_whole_measure_rest(writer, time),
        }

        writer
            .write_event(Event::End(BytesEnd::new("measure")))
            .unwrap();
    }
}

/// Helper to write `<name>text</name>`.
fn write_text_element<W: std::io::Write>(writer: &mut Writer<W>, name: &str, text: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .unwrap();
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .unwrap();
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .unwrap();
}

fn write_attributes<W: std::io::Write>(
    writer: &mut Writer<W>,
    with_divisions: bool,
    key: Option<&str>,
    time: Option<TimeSignature>,
    clef: Option<Clef>,
) {
    writer
        .write_event(Event::Start(BytesStart::new("attributes")))
        .unwrap();

    if with_divisions {
        write_text_element(writer, "divisions", &DIVISIONS.to_string());
    }

    if with_divisions || key.is_some() {
        let (fifths, minor) = key_fifths(key.unwrap_or(""));
        writer
            .write_event(Event::Start(BytesStart::new("key")))
            .unwrap();
        write_text_element(writer, "fifths", &fifths.to_string());
        write_text_element(writer, "mode", if minor { "minor" } else { "major" });
        writer
            .write_event(Event::End(BytesEnd::new("key")))
            .unwrap();
    }

    if let Some(time) = time {
        writer
            .write_event(Event::Start(BytesStart::new("time")))
            .unwrap();
        write_text_element(writer, "beats", &time.beats.to_string());
        write_text_element(writer, "beat-type", &time.beat_type.to_string());
        writer
            .write_event(Event::End(BytesEnd::new("time")))
            .unwrap();
    }

    if let Some(clef) = clef {
        let (sign, line) = clef.sign_and_line();
        writer
            .write_event(Event::Start(BytesStart::new("clef")))
            .unwrap();
        write_text_element(writer, "sign", sign);
        write_text_element(writer, "line", &line.to_string());
        if clef.octave_change() != 0 {
            write_text_element(
                writer,
                "clef-octave-change",
                &clef.octave_change().to_string(),
            );
        }
        writer
            .write_event(Event::End(BytesEnd::new("clef")))
            .unwrap();
    }

    writer
        .write_event(Event::End(BytesEnd::new("attributes")))
        .unwrap();
}

fn write_tempo_direction<W: std::io::Write>(writer: &mut Writer<W>, bpm: u32) {
    writer
        .write_event(Event::Start(BytesStart::new("direction")))
        .unwrap();
    writer
        .write_event(Event::Start(BytesStart::new("direction-type")))
        .unwrap();
    writer
        .write_event(Event::Start(BytesStart::new("metronome")))
        .unwrap();
    write_text_element(writer, "beat-unit", "quarter");
    write_text_element(writer, "per-minute", &bpm.to_string());
    writer
        .write_event(Event::End(BytesEnd::new("metronome")))
        .unwrap();
    writer
        .write_event(Event::End(BytesEnd::new("direction-type")))
        .unwrap();
    let mut sound = BytesStart::new("sound");
    let tempo = bpm.to_string();
    sound.push_attribute(("tempo", tempo.as_str()));
    writer.write_event(Event::Empty(sound)).unwrap();
    writer
        .write_event(Event::End(BytesEnd::new("direction")))
        .unwrap();
}

/// Beam state for a note within a measure.
#[derive(Clone, Copy, PartialEq)]
enum BeamState {
    None,
    Begin,
    Continue,
    End,
}

impl BeamState {
    fn as_str(&self) -> &'static str {
        match self {
            BeamState::Begin => "begin",
            BeamState::Continue => "continue",
            BeamState::End => "end",
            BeamState::None => "",
        }
    }
}

fn is_beamed_note(element: &Element) -> bool {
    matches!(element, Element::Note(note) if note.beamed)
}

/// Neighbor-based beam states: a run of beamed notes renders as
/// `begin (continue)* end`; an isolated beamed note gets no beam tag.
fn beam_states(elements: &[Element]) -> Vec<BeamState> {
    let mut states = vec![BeamState::None; elements.len()];
    for (i, element) in elements.iter().enumerate() {
        if !is_beamed_note(element) {
            continue;
        }
        let prev = i > 0 && is_beamed_note(&elements[i - 1]);
        let next = i + 1 < elements.len() && is_beamed_note(&elements[i + 1]);
        states[i] = match (prev, next) {
            (false, true) => BeamState::Begin,
            (true, true) => BeamState::Continue,
            (true, false) => BeamState::End,
            (false, false) => BeamState::None,
        };
    }
    states
}

/// MusicXML duration in divisions.
fn duration_divisions(duration: &Duration) -> u32 {
    (duration.beats() * DIVISIONS as f64).round() as u32
}

fn write_element<W: std::io::Write>(writer: &mut Writer<W>, element: &Element, beam: BeamState) {
    match element {
        Element::Note(note) => {
            write_directions(writer, note.annotation.as_ref());
            write_note(writer, note, beam);
        }
        Element::Rest(rest) => write_rest(writer, rest),
        Element::Chord(chord) => {
            write_directions(writer, chord.annotation.as_ref());
            write_chord(writer, chord);
        }
    }
}

/// Dynamics, wedges, pedal marks and text go in `<direction>` elements
/// immediately before the note that carries them.
fn write_directions<W: std::io::Write>(writer: &mut Writer<W>, annotation: Option<&Annotation>) {
    let Some(annotation) = annotation else { return };

    if let Some(text) = &annotation.text {
        write_direction(writer, |w| {
            write_text_element(w, "words", text);
        });
    }
    if let Some(dynamic) = annotation.dynamic {
        write_direction(writer, |w| {
            w.write_event(Event::Start(BytesStart::new("dynamics")))
                .unwrap();
            w.write_event(Event::Empty(BytesStart::new(dynamic.as_str())))
                .unwrap();
            w.write_event(Event::End(BytesEnd::new("dynamics"))).unwrap();
        });
    }
    if let Some(mark) = annotation.crescendo {
        let kind = match mark {
            WedgeMark::Start => "crescendo",
            WedgeMark::End => "stop",
        };
        write_direction(writer, |w| {
            let mut wedge = BytesStart::new("wedge");
            wedge.push_attribute(("type", kind));
            w.write_event(Event::Empty(wedge)).unwrap();
        });
    }
    if let Some(mark) = annotation.decrescendo {
        let kind = match mark {
            WedgeMark::Start => "diminuendo",
            WedgeMark::End => "stop",
        };
        write_direction(writer, |w| {
            let mut wedge = BytesStart::new("wedge");
            wedge.push_attribute(("type", kind));
            w.write_event(Event::Empty(wedge)).unwrap();
        });
    }
    if annotation.pedal_start {
        write_direction(writer, |w| {
            let mut pedal = BytesStart::new("pedal");
            pedal.push_attribute(("type", "start"));
            w.write_event(Event::Empty(pedal)).unwrap();
        });
    }
    if annotation.pedal_end {
        write_direction(writer, |w| {
            let mut pedal = BytesStart::new("pedal");
            pedal.push_attribute(("type", "stop"));
            w.write_event(Event::Empty(pedal)).unwrap();
        });
    }
}

fn write_direction<W: std::io::Write>(
    writer: &mut Writer<W>,
    body: impl FnOnce(&mut Writer<W>),
) {
    writer
        .write_event(Event::Start(BytesStart::new("direction")))
        .unwrap();
    writer
        .write_event(Event::Start(BytesStart::new("direction-type")))
        .unwrap();
    body(writer);
    writer
        .write_event(Event::End(BytesEnd::new("direction-type")))
        .unwrap();
    writer
        .write_event(Event::End(BytesEnd::new("direction")))
        .unwrap();
}

fn write_pitch<W: std::io::Write>(writer: &mut Writer<W>, pitch: &Pitch) {
    writer
        .write_event(Event::Start(BytesStart::new("pitch")))
        .unwrap();
    write_text_element(writer, "step", pitch.name.as_str());
    if pitch.accidental.alter() != 0 {
        write_text_element(writer, "alter", &pitch.accidental.alter().to_string());
    }
    write_text_element(writer, "octave", &pitch.octave.to_string());
    writer
        .write_event(Event::End(BytesEnd::new("pitch")))
        .unwrap();
}

fn write_note<W: std::io::Write>(writer: &mut Writer<W>, note: &Note, beam: BeamState) {
    writer
        .write_event(Event::Start(BytesStart::new("note")))
        .unwrap();

    if note.grace {
        writer
            .write_event(Event::Empty(BytesStart::new("grace")))
            .unwrap();
    }

    write_pitch(writer, &note.pitch);
    write_text_element(
        writer,
        "duration",
        &duration_divisions(&note.duration).to_string(),
    );

    if note.tied {
        let mut tie = BytesStart::new("tie");
        tie.push_attribute(("type", "start"));
        writer.write_event(Event::Empty(tie)).unwrap();
    }

    write_text_element(writer, "type", note.duration.base.musicxml_type());
    for _ in 0..note.duration.dots {
        writer
            .write_event(Event::Empty(BytesStart::new("dot")))
            .unwrap();
    }

    if let Some(label) = note.pitch.accidental.musicxml_name() {
        write_text_element(writer, "accidental", label);
    }

    if beam != BeamState::None {
        let mut beam_elem = BytesStart::new("beam");
        beam_elem.push_attribute(("number", "1"));
        writer.write_event(Event::Start(beam_elem)).unwrap();
        writer
            .write_event(Event::Text(BytesText::new(beam.as_str())))
            .unwrap();
        writer
            .write_event(Event::End(BytesEnd::new("beam")))
            .unwrap();
    }

    write_notations(writer, note.tied, note.annotation.as_ref());

    writer
        .write_event(Event::End(BytesEnd::new("note")))
        .unwrap();
}

fn write_rest<W: std::io::Write>(writer: &mut Writer<W>, rest: &Rest) {
    writer
        .write_event(Event::Start(BytesStart::new("note")))
        .unwrap();
    writer
        .write_event(Event::Empty(BytesStart::new("rest")))
        .unwrap();
    write_text_element(
        writer,
        "duration",
        &duration_divisions(&rest.duration).to_string(),
    );
    write_text_element(writer, "type", rest.duration.base.musicxml_type());
    for _ in 0..rest.duration.dots {
        writer
            .write_event(Event::Empty(BytesStart::new("dot")))
            .unwrap();
    }
    writer
        .write_event(Event::End(BytesEnd::new("note")))
        .unwrap();
}

/// A whole-bar rest sized to the prevailing time signature, used to pad
/// staves that are shorter than the longest part.
fn write_whole_measure_rest<W: std::io::Write>(writer: &mut Writer<W>, time: TimeSignature) {
    writer
        .write_event(Event::Start(BytesStart::new("note")))
        .unwrap();
    writer
        .write_event(Event::Empty(BytesStart::new("rest")))
        .unwrap();
    let divisions = time.beats * DIVISIONS;
    write_text_element(writer, "duration", &divisions.to_string());
    writer
        .write_event(Event::End(BytesEnd::new("note")))
        .unwrap();
}

/// First pitch as a plain note; the rest carry `<chord/>` and no beam.
fn write_chord<W: std::io::Write>(writer: &mut Writer<W>, chord: &Chord) {
    let divisions = duration_divisions(&chord.duration).to_string();
    for (index, pitch) in chord.pitches.iter().enumerate() {
        writer
            .write_event(Event::Start(BytesStart::new("note")))
            .unwrap();
        if index > 0 {
            writer
                .write_event(Event::Empty(BytesStart::new("chord")))
                .unwrap();
        }
        write_pitch(writer, pitch);
        write_text_element(writer, "duration", &divisions);
        if chord.tied && index == 0 {
            let mut tie = BytesStart::new("tie");
            tie.push_attribute(("type", "start"));
            writer.write_event(Event::Empty(tie)).unwrap();
        }
        write_text_element(writer, "type", chord.duration.base.musicxml_type());
        for _ in 0..chord.duration.dots {
            writer
                .write_event(Event::Empty(BytesStart::new("dot")))
                .unwrap();
        }
        if let Some(label) = pitch.accidental.musicxml_name() {
            write_text_element(writer, "accidental", label);
        }
        if index == 0 {
            write_notations(writer, chord.tied, chord.annotation.as_ref());
        }
        writer
            .write_event(Event::End(BytesEnd::new("note")))
            .unwrap();
    }
}

fn write_notations<W: std::io::Write>(
    writer: &mut Writer<W>,
    tied: bool,
    annotation: Option<&Annotation>,
) {
    let slur_start = annotation.is_some_and(|a| a.slur_start);
    let slur_end = annotation.is_some_and(|a| a.slur_end);
    let articulations: Vec<Articulation> = annotation
        .map(|a| {
            a.articulations
                .iter()
                .copied()
                .filter(|art| *art != Articulation::Trill)
                .collect()
        })
        .unwrap_or_default();
    let trill = annotation
        .is_some_and(|a| a.articulations.contains(&Articulation::Trill));
    let fingering = annotation.and_then(|a| a.fingering);

    if !tied && !slur_start && !slur_end && articulations.is_empty() && !trill && fingering.is_none()
    {
        return;
    }

    writer
        .write_event(Event::Start(BytesStart::new("notations")))
        .unwrap();

    if tied {
        let mut t = BytesStart::new("tied");
        t.push_attribute(("type", "start"));
        writer.write_event(Event::Empty(t)).unwrap();
    }
    if slur_start {
        let mut slur = BytesStart::new("slur");
        slur.push_attribute(("type", "start"));
        slur.push_attribute(("number", "1"));
        writer.write_event(Event::Empty(slur)).unwrap();
    }
    if slur_end {
        let mut slur = BytesStart::new("slur");
        slur.push_attribute(("type", "stop"));
        slur.push_attribute(("number", "1"));
        writer.write_event(Event::Empty(slur)).unwrap();
    }
    if !articulations.is_empty() {
        writer
            .write_event(Event::Start(BytesStart::new("articulations")))
            .unwrap();
        for articulation in &articulations {
            writer
                .write_event(Event::Empty(BytesStart::new(articulation.musicxml_name())))
                .unwrap();
        }
        writer
            .write_event(Event::End(BytesEnd::new("articulations")))
            .unwrap();
    }
    if trill {
        writer
            .write_event(Event::Start(BytesStart::new("ornaments")))
            .unwrap();
        writer
            .write_event(Event::Empty(BytesStart::new("trill-mark")))
            .unwrap();
        writer
            .write_event(Event::End(BytesEnd::new("ornaments")))
            .unwrap();
    }
    if let Some(fingering) = fingering {
        writer
            .write_event(Event::Start(BytesStart::new("technical")))
            .unwrap();
        write_text_element(writer, "fingering", &fingering.to_string());
        writer
            .write_event(Event::End(BytesEnd::new("technical")))
            .unwrap();
    }

    writer
        .write_event(Event::End(BytesEnd::new("notations")))
        .unwrap();
}

fn write_final_barline<W: std::io::Write>(writer: &mut Writer<W>) {
    let mut barline = BytesStart::new("barline");
    barline.push_attribute(("location", "right"));
    writer.write_event(Event::Start(barline)).unwrap();
    write_text_element(writer, "bar-style", "light-heavy");
    writer
        .write_event(Event::End(BytesEnd::new("barline")))
        .unwrap();
}

/// Normalize a key name: strip `" major"`/`"maj"`, collapse `" minor"`/
/// `"min"` to a trailing `m`, uppercase the tonic letter.
fn normalize_key(raw: &str) -> String {
    let mut s = raw.trim().to_string();
    let lower = s.to_lowercase();
    if let Some(stripped) = lower.strip_suffix("major") {
        s.truncate(stripped.trim_end().len());
    } else if let Some(stripped) = lower.strip_suffix("maj") {
        s.truncate(stripped.trim_end().len());
    } else if let Some(stripped) = lower.strip_suffix("minor") {
        s.truncate(stripped.trim_end().len());
        s.push('m');
    } else if let Some(stripped) = lower.strip_suffix("min") {
        s.truncate(stripped.trim_end().len());
        s.push('m');
    }
    let mut chars = s.trim().chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Circle-of-fifths encoding for a key name. Unknown keys fall back to
/// C major.
fn key_fifths(raw: &str) -> (i8, bool) {
    let normalized = normalize_key(raw);
    let minor = normalized.ends_with('m');

    if minor {
        let fifths = match normalized.trim_end_matches('m') {
            "A" => 0,
            "E" => 1,
            "B" => 2,
            "F#" => 3,
            "C#" => 4,
            "G#" => 5,
            "D#" => 6,
            "D" => -1,
            "G" => -2,
            "C" => -3,
            "F" => -4,
            "Bb" => -5,
            "Eb" => -6,
            _ => 0,
        };
        (fifths, true)
    } else {
        let fifths = match normalized.as_str() {
            "C" => 0,
            "G" => 1,
            "D" => 2,
            "A" => 3,
            "E" => 4,
            "B" => 5,
            "F#" => 6,
            "F" => -1,
            "Bb" => -2,
            "Eb" => -3,
            "Ab" => -4,
            "Db" => -5,
            "Gb" => -6,
            _ => 0,
        };
        (fifths, false)
    }
}
