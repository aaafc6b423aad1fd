//! # Abstract Syntax Tree types
//!
//! All type structures for the Scorelang AST.
//!
//! ```text
//! Score
//!   ├── Metadata (title, composer, key, time, tempo, default octave,
//!   │             declared staves)
//!   └── Vec<Staff>
//!         ├── name, clef, voice
//!         └── Vec<Measure>
//!               ├── Vec<Element> (Note | Rest | Chord)
//!               ├── barline
//!               └── attributes (key/time/clef, only at context changes)
//! ```
//!
//! Every node carries a [`SourceLocation`]; composite nodes span from their
//! first to their last child. Values are immutable once `parse` returns.
//!
//! ## Beat arithmetic
//! Durations are measured in quarter-note beats: whole = 4, half = 2,
//! quarter = 1, eighth = 1/2, 16th = 1/4, 32nd = 1/8. Dots extend by the
//! literal sequence `base + base/2 + base/4`, truncated at the dot count.
//! Measure partitioning and MusicXML divisions both build on this table.

use crate::lexer::Token;

/// A half-open byte span with 1-based line/column of its start.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
    pub byte_start: usize,
    pub byte_end: usize,
}

impl SourceLocation {
    pub fn from_token(token: &Token) -> Self {
        Self {
            line: token.line,
            column: token.column,
            byte_start: token.byte_start,
            byte_end: token.byte_end,
        }
    }

    /// Span from the start of `self` to the end of `other`.
    pub fn span_to(self, other: SourceLocation) -> Self {
        Self {
            line: self.line,
            column: self.column,
            byte_start: self.byte_start,
            byte_end: other.byte_end,
        }
    }
}

/// Note names C through B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoteName {
    #[default]
    C,
    D,
    E,
    F,
    G,
    A,
    B,
}

impl NoteName {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'C' => Some(NoteName::C),
            'D' => Some(NoteName::D),
            'E' => Some(NoteName::E),
            'F' => Some(NoteName::F),
            'G' => Some(NoteName::G),
            'A' => Some(NoteName::A),
            'B' => Some(NoteName::B),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NoteName::C => "C",
            NoteName::D => "D",
            NoteName::E => "E",
            NoteName::F => "F",
            NoteName::G => "G",
            NoteName::A => "A",
            NoteName::B => "B",
        }
    }
}

/// Accidentals up to double sharps and double flats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Accidental {
    #[default]
    Natural,
    Sharp,
    DoubleSharp,
    Flat,
    DoubleFlat,
}

impl Accidental {
    pub fn from_str(s: &str) -> Self {
        match s {
            "#" => Accidental::Sharp,
            "##" => Accidental::DoubleSharp,
            "b" => Accidental::Flat,
            "bb" => Accidental::DoubleFlat,
            _ => Accidental::Natural,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Accidental::Natural => "",
            Accidental::Sharp => "#",
            Accidental::DoubleSharp => "##",
            Accidental::Flat => "b",
            Accidental::DoubleFlat => "bb",
        }
    }

    /// MusicXML `<alter>` value.
    pub fn alter(&self) -> i8 {
        match self {
            Accidental::Natural => 0,
            Accidental::Sharp => 1,
            Accidental::DoubleSharp => 2,
            Accidental::Flat => -1,
            Accidental::DoubleFlat => -2,
        }
    }

    /// MusicXML `<accidental>` label, absent for naturals.
    pub fn musicxml_name(&self) -> Option<&'static str> {
        match self {
            Accidental::Natural => None,
            Accidental::Sharp => Some("sharp"),
            Accidental::DoubleSharp => Some("double-sharp"),
            Accidental::Flat => Some("flat"),
            Accidental::DoubleFlat => Some("flat-flat"),
        }
    }
}

/// A concrete pitch: name, accidental, octave 0..=8.
#[derive(Debug, Clone, PartialEq)]
pub struct Pitch {
    pub name: NoteName,
    pub accidental: Accidental,
    pub octave: u8,
    pub location: SourceLocation,
}

/// Duration bases from whole to 32nd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurationBase {
    Whole,
    Half,
    #[default]
    Quarter,
    Eighth,
    Sixteenth,
    ThirtySecond,
}

impl DurationBase {
    /// Maps the `/N` denominator to a base.
    pub fn from_denominator(n: u32) -> Option<Self> {
        match n {
            1 => Some(DurationBase::Whole),
            2 => Some(DurationBase::Half),
            4 => Some(DurationBase::Quarter),
            8 => Some(DurationBase::Eighth),
            16 => Some(DurationBase::Sixteenth),
            32 => Some(DurationBase::ThirtySecond),
            _ => None,
        }
    }

    /// Quarter-note beats for this base.
    pub fn beats(&self) -> f64 {
        match self {
            DurationBase::Whole => 4.0,
            DurationBase::Half => 2.0,
            DurationBase::Quarter => 1.0,
            DurationBase::Eighth => 0.5,
            DurationBase::Sixteenth => 0.25,
            DurationBase::ThirtySecond => 0.125,
        }
    }

    /// MusicXML `<type>` name.
    pub fn musicxml_type(&self) -> &'static str {
        match self {
            DurationBase::Whole => "whole",
            DurationBase::Half => "half",
            DurationBase::Quarter => "quarter",
            DurationBase::Eighth => "eighth",
            DurationBase::Sixteenth => "16th",
            DurationBase::ThirtySecond => "32nd",
        }
    }

    /// Source denominator for the formatter (`/1` .. `/32`).
    pub fn denominator(&self) -> u32 {
        match self {
            DurationBase::Whole => 1,
            DurationBase::Half => 2,
            DurationBase::Quarter => 4,
            DurationBase::Eighth => 8,
            DurationBase::Sixteenth => 16,
            DurationBase::ThirtySecond => 32,
        }
    }
}

/// A duration: base plus dot count.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Duration {
    pub base: DurationBase,
    pub dots: u8,
    pub location: SourceLocation,
}

impl Duration {
    pub fn quarter() -> Self {
        Self::default()
    }

    /// Quarter-note beats including dot extension: `b + b/2 + b/4`
    /// truncated at the dot count.
    pub fn beats(&self) -> f64 {
        let base = self.base.beats();
        let mut total = base;
        let mut extension = base;
        for _ in 0..self.dots {
            extension /= 2.0;
            total += extension;
        }
        total
    }
}

/// The fixed dynamic set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dynamic {
    Ppp,
    Pp,
    P,
    Mp,
    Mf,
    F,
    Ff,
    Fff,
    Fp,
    Sfz,
}

impl Dynamic {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ppp" => Some(Dynamic::Ppp),
            "pp" => Some(Dynamic::Pp),
            "p" => Some(Dynamic::P),
            "mp" => Some(Dynamic::Mp),
            "mf" => Some(Dynamic::Mf),
            "f" => Some(Dynamic::F),
            "ff" => Some(Dynamic::Ff),
            "fff" => Some(Dynamic::Fff),
            "fp" => Some(Dynamic::Fp),
            "sfz" => Some(Dynamic::Sfz),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dynamic::Ppp => "ppp",
            Dynamic::Pp => "pp",
            Dynamic::P => "p",
            Dynamic::Mp => "mp",
            Dynamic::Mf => "mf",
            Dynamic::F => "f",
            Dynamic::Ff => "ff",
            Dynamic::Fff => "fff",
            Dynamic::Fp => "fp",
            Dynamic::Sfz => "sfz",
        }
    }
}

/// Articulations and the trill ornament.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Articulation {
    Staccato,
    Tenuto,
    Accent,
    Marcato,
    Fermata,
    Trill,
}

impl Articulation {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "st" => Some(Articulation::Staccato),
            "tn" => Some(Articulation::Tenuto),
            "ac" => Some(Articulation::Accent),
            "mc" => Some(Articulation::Marcato),
            "fm" => Some(Articulation::Fermata),
            "tr" => Some(Articulation::Trill),
            _ => None,
        }
    }

    /// MusicXML element inside `<articulations>`; the trill lives in
    /// `<ornaments>` instead.
    pub fn musicxml_name(&self) -> &'static str {
        match self {
            Articulation::Staccato => "staccato",
            Articulation::Tenuto => "tenuto",
            Articulation::Accent => "accent",
            Articulation::Marcato => "strong-accent",
            Articulation::Fermata => "fermata",
            Articulation::Trill => "trill-mark",
        }
    }
}

/// Start or end of a hairpin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WedgeMark {
    Start,
    End,
}

/// Performance annotations attached to a note or chord.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Annotation {
    pub dynamic: Option<Dynamic>,
    pub articulations: Vec<Articulation>,
    pub fingering: Option<u8>,
    pub text: Option<String>,
    pub crescendo: Option<WedgeMark>,
    pub decrescendo: Option<WedgeMark>,
    pub slur_start: bool,
    pub slur_end: bool,
    pub pedal_start: bool,
    pub pedal_end: bool,
}

impl Annotation {
    pub fn is_empty(&self) -> bool {
        self.dynamic.is_none()
            && self.articulations.is_empty()
            && self.fingering.is_none()
            && self.text.is_none()
            && self.crescendo.is_none()
            && self.decrescendo.is_none()
            && !self.slur_start
            && !self.slur_end
            && !self.pedal_start
            && !self.pedal_end
    }
}

/// A single note.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub pitch: Pitch,
    pub duration: Duration,
    pub tied: bool,
    pub beamed: bool,
    pub grace: bool,
    pub annotation: Option<Annotation>,
    pub location: SourceLocation,
}

/// A rest.
#[derive(Debug, Clone, PartialEq)]
pub struct Rest {
    pub duration: Duration,
    pub location: SourceLocation,
}

/// A chord of simultaneous pitches sharing one duration.
#[derive(Debug, Clone, PartialEq)]
pub struct Chord {
    pub pitches: Vec<Pitch>,
    pub duration: Duration,
    pub tied: bool,
    pub annotation: Option<Annotation>,
    pub location: SourceLocation,
}

/// An element in a stave body.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Note(Note),
    Rest(Rest),
    Chord(Chord),
}

impl Element {
    pub fn location(&self) -> SourceLocation {
        match self {
            Element::Note(n) => n.location,
            Element::Rest(r) => r.location,
            Element::Chord(c) => c.location,
        }
    }

    pub fn duration(&self) -> &Duration {
        match self {
            Element::Note(n) => &n.duration,
            Element::Rest(r) => &r.duration,
            Element::Chord(c) => &c.duration,
        }
    }

    /// Quarter-note beats this element occupies in a measure.
    pub fn beats(&self) -> f64 {
        self.duration().beats()
    }

    pub fn annotation(&self) -> Option<&Annotation> {
        match self {
            Element::Note(n) => n.annotation.as_ref(),
            Element::Chord(c) => c.annotation.as_ref(),
            Element::Rest(_) => None,
        }
    }

    /// The annotation slot, created on demand. Rests have none.
    pub fn annotation_mut(&mut self) -> Option<&mut Annotation> {
        match self {
            Element::Note(n) => Some(n.annotation.get_or_insert_with(Annotation::default)),
            Element::Chord(c) => Some(c.annotation.get_or_insert_with(Annotation::default)),
            Element::Rest(_) => None,
        }
    }

    /// Mark the element tied; rests cannot tie.
    pub fn set_tied(&mut self) {
        match self {
            Element::Note(n) => n.tied = true,
            Element::Chord(c) => c.tied = true,
            Element::Rest(_) => {}
        }
    }
}

/// Barline at the end of a measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Barline {
    #[default]
    Regular,
    Final,
}

/// Key/time/clef attributes attached to a measure at a context change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeasureAttributes {
    pub key: Option<String>,
    pub time: Option<TimeSignature>,
    pub clef: Option<Clef>,
}

impl MeasureAttributes {
    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.time.is_none() && self.clef.is_none()
    }
}

/// A measure: elements partitioned by the active time signature.
#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    pub elements: Vec<Element>,
    pub barline: Barline,
    pub attributes: Option<MeasureAttributes>,
}

/// Clefs supported by stave declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Clef {
    #[default]
    Treble,
    Bass,
    Alto,
    Tenor,
    Treble8,
    Bass8,
}

impl Clef {
    /// Unknown clef names fall back to treble.
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "bass" => Clef::Bass,
            "alto" => Clef::Alto,
            "tenor" => Clef::Tenor,
            "treble-8" => Clef::Treble8,
            "bass-8" => Clef::Bass8,
            _ => Clef::Treble,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Clef::Treble => "treble",
            Clef::Bass => "bass",
            Clef::Alto => "alto",
            Clef::Tenor => "tenor",
            Clef::Treble8 => "treble-8",
            Clef::Bass8 => "bass-8",
        }
    }

    /// MusicXML `<sign>` / `<line>`.
    pub fn sign_and_line(&self) -> (&'static str, u8) {
        match self {
            Clef::Treble | Clef::Treble8 => ("G", 2),
            Clef::Bass | Clef::Bass8 => ("F", 4),
            Clef::Alto => ("C", 3),
            Clef::Tenor => ("C", 4),
        }
    }

    /// `<clef-octave-change>` for the `-8` variants.
    pub fn octave_change(&self) -> i8 {
        match self {
            Clef::Treble8 | Clef::Bass8 => -1,
            _ => 0,
        }
    }
}

/// Time signature, e.g. 4/4, 3/4, 6/8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSignature {
    pub beats: u32,
    pub beat_type: u32,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            beats: 4,
            beat_type: 4,
        }
    }
}

/// A stave declared in a context block.
#[derive(Debug, Clone, PartialEq)]
pub struct StaveDecl {
    pub name: String,
    pub clef: Clef,
    pub voice: Option<String>,
}

/// Document metadata gathered from context blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub title: Option<String>,
    pub composer: Option<String>,
    pub key: Option<String>,
    pub time: Option<TimeSignature>,
    pub tempo: Option<u32>,
    pub default_octave: u8,
    pub staves: Vec<StaveDecl>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            title: None,
            composer: None,
            key: None,
            time: None,
            tempo: None,
            default_octave: 4,
            staves: Vec::new(),
        }
    }
}

/// One staff: a named part holding partitioned measures.
#[derive(Debug, Clone, PartialEq)]
pub struct Staff {
    pub name: String,
    pub clef: Clef,
    pub voice: Option<String>,
    pub measures: Vec<Measure>,
    pub location: SourceLocation,
}

/// A complete parsed score.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub metadata: Metadata,
    pub staves: Vec<Staff>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_beats() {
        let q = Duration::quarter();
        assert_eq!(q.beats(), 1.0);

        let half = Duration {
            base: DurationBase::Half,
            dots: 0,
            location: SourceLocation::default(),
        };
        assert_eq!(half.beats(), 2.0);
    }

    #[test]
    fn test_dotted_beats() {
        let dotted_quarter = Duration {
            base: DurationBase::Quarter,
            dots: 1,
            location: SourceLocation::default(),
        };
        assert_eq!(dotted_quarter.beats(), 1.5);

        let double_dotted_half = Duration {
            base: DurationBase::Half,
            dots: 2,
            location: SourceLocation::default(),
        };
        assert_eq!(double_dotted_half.beats(), 3.5);
    }

    #[test]
    fn test_accidental_alter() {
        assert_eq!(Accidental::from_str("##").alter(), 2);
        assert_eq!(Accidental::from_str("bb").alter(), -2);
        assert_eq!(Accidental::from_str("").alter(), 0);
    }

    #[test]
    fn test_clef_tables() {
        assert_eq!(Clef::from_name("bass").sign_and_line(), ("F", 4));
        assert_eq!(Clef::from_name("alto").sign_and_line(), ("C", 3));
        assert_eq!(Clef::from_name("nonsense"), Clef::Treble);
        assert_eq!(Clef::from_name("treble-8").octave_change(), -1);
    }

    #[test]
    fn test_annotation_is_empty() {
        let mut a = Annotation::default();
        assert!(a.is_empty());
        a.slur_start = true;
        assert!(!a.is_empty());
    }
}
