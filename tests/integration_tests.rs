//! Integration tests for the Scorelang compiler
//!
//! Exercises the full pipeline from source text to MusicXML, plus the
//! formatter/minifier round-trip guarantees.

use scorelang::{
    format, minify, parse, to_musicxml, tokenize, validate, Element, Severity, TokenKind,
};

fn parse_xml(source: &str) -> String {
    let out = parse(source);
    assert!(out.errors.is_empty(), "unexpected errors: {:?}", out.errors);
    to_musicxml(&out.ast.expect("expected an AST"))
}

#[test]
fn test_scale_splits_into_two_measures() {
    let source = "---\ntime: 4/4\n&main:\n  clef: treble\n---\n&main { C D E F G A B C }";
    let xml = parse_xml(source);

    assert_eq!(xml.matches("<measure number=\"1\">").count(), 1);
    assert_eq!(xml.matches("<measure number=\"2\">").count(), 1);
    assert_eq!(xml.matches("<note>").count(), 8);
    assert!(xml.contains("<fifths>0</fifths>"));
    assert!(xml.contains("<beats>4</beats>"));
    assert!(xml.contains("<sign>G</sign>"));
    assert!(xml.contains("<line>2</line>"));

    let ast = parse(source).ast.unwrap();
    assert_eq!(ast.staves[0].measures.len(), 2);
    assert_eq!(ast.staves[0].measures[0].elements.len(), 4);
    assert_eq!(ast.staves[0].measures[1].elements.len(), 4);
}

#[test]
fn test_accidentals_emit_alters_and_labels() {
    let source = "---\n&m:\n  clef: treble\n---\n&m { C# Bb F## Ebb }";
    let xml = parse_xml(source);

    for alter in ["1", "-1", "2", "-2"] {
        assert!(
            xml.contains(&format!("<alter>{alter}</alter>")),
            "missing alter {alter} in:\n{xml}"
        );
    }
    for label in ["sharp", "flat", "double-sharp", "flat-flat"] {
        assert!(
            xml.contains(&format!("<accidental>{label}</accidental>")),
            "missing accidental {label}"
        );
    }
}

#[test]
fn test_crescendo_wedge_wraps_range() {
    let source = "---\n&m:\n  clef: treble\n---\n&m { C D E F } { cresc(1-4) }";
    let xml = parse_xml(source);

    assert_eq!(xml.matches("<wedge type=\"crescendo\"/>").count(), 1);
    assert_eq!(xml.matches("<wedge type=\"stop\"/>").count(), 1);
    let start = xml.find("<wedge type=\"crescendo\"/>").unwrap();
    let stop = xml.find("<wedge type=\"stop\"/>").unwrap();
    let first_note = xml.find("<note>").unwrap();
    assert!(start < first_note);
    assert!(start < stop);
}

#[test]
fn test_slur_annotation_block() {
    let source = "---\n&m:\n  clef: treble\n---\n&m { C D E F } { slur(1-4) }";
    let xml = parse_xml(source);

    assert_eq!(xml.matches("<slur type=\"start\" number=\"1\"/>").count(), 1);
    assert_eq!(xml.matches("<slur type=\"stop\" number=\"1\"/>").count(), 1);
    let start = xml.find("<slur type=\"start\"").unwrap();
    let stop = xml.find("<slur type=\"stop\"").unwrap();
    assert!(start < stop);
}

#[test]
fn test_chord_half_note() {
    let source = "---\n&m:\n  clef: treble\n---\n&m { [C E G]/2 }";
    let xml = parse_xml(source);

    assert_eq!(xml.matches("<note>").count(), 3);
    assert_eq!(xml.matches("<type>half</type>").count(), 3);
    assert_eq!(xml.matches("<duration>8</duration>").count(), 3);
    assert_eq!(xml.matches("<chord/>").count(), 2);

    // The first chord note carries no <chord/>.
    let first_note_end = xml.find("</note>").unwrap();
    assert!(!xml[..first_note_end].contains("<chord/>"));
}

#[test]
fn test_two_staves_bracketed_parts() {
    let source = "---\n&r:\n  clef: treble\n&l:\n  clef: bass\n---\n&r { C }\n&l { C }";
    let xml = parse_xml(source);

    assert!(xml.contains("<part-group type=\"start\" number=\"1\">"));
    assert!(xml.contains("<group-symbol>bracket</group-symbol>"));
    assert!(xml.contains("<score-part id=\"P1\"><part-name>r</part-name></score-part>"));
    assert!(xml.contains("<score-part id=\"P2\"><part-name>l</part-name></score-part>"));
    assert!(xml.contains("<sign>G</sign><line>2</line>"));
    assert!(xml.contains("<sign>F</sign><line>4</line>"));
}

#[test]
fn test_tokenize_is_deterministic_and_ordered() {
    let source = "---\ntime: 4/4\n&m:\n  clef: treble\n---\n&m { C+/8 [D F A]/2 _ } { ff(1-2) }\n";
    let first = tokenize(source);
    let second = tokenize(source);
    assert_eq!(first.tokens, second.tokens);

    for pair in first.tokens.windows(2) {
        assert!(
            pair[0].byte_end <= pair[1].byte_start,
            "overlapping tokens: {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn test_stave_order_declared_then_first_use() {
    let source = "---\n&alpha:\n  clef: treble\n&beta:\n  clef: bass\n---\n&gamma { C }\n&beta { D }\n&alpha { E }";
    let ast = parse(source).ast.unwrap();
    let names: Vec<_> = ast.staves.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta", "gamma"]);
}

#[test]
fn test_measures_never_overflow() {
    let source = "---\ntime: 3/4\n&m:\n  clef: treble\n---\n&m { C/2 D E/8 F/8 G A/2. B C5 D5 E5/16 F5/16 G5 }";
    let ast = parse(source).ast.unwrap();
    let measures = &ast.staves[0].measures;
    assert!(measures.len() > 1);
    for measure in &measures[..measures.len() - 1] {
        let beats: f64 = measure.elements.iter().map(Element::beats).sum();
        assert!(beats <= 3.0 + 1e-6, "measure overflows: {beats}");
    }
}

#[test]
fn test_format_is_idempotent() {
    let sources = [
        "---\ntime: 4/4\ntitle: Demo\n&m:\n  clef: treble\n---\n&m { C D E F G A B C5 D E }  { cresc(1-4) }\n",
        "&solo { C+ /8 D@3 [C E G]/2 _ }\n",
        "---\nkey: Dm\n&a:\n  clef: alto\n---\n&a { `C =(D/8 E F G) }\n// trailing comment\n",
    ];
    for source in sources {
        let once = format(source);
        let twice = format(&once);
        assert_eq!(once, twice, "format not idempotent for {source:?}");
    }
}

#[test]
fn test_format_preserves_semantics() {
    let source = "---\ntime: 4/4\nkey: G\n&m:\n  clef: treble\n---\n&m { mf(C D) =(E/8 F G A) [B D5]/2 _ } { slur(1-2) text(3, \"dolce\") }\n";
    let before = parse(source).ast.unwrap();
    let after = parse(&format(source)).ast.unwrap();

    assert_eq!(before.staves.len(), after.staves.len());
    for (a, b) in before.staves.iter().zip(after.staves.iter()) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.measures.len(), b.measures.len());
        for (ma, mb) in a.measures.iter().zip(b.measures.iter()) {
            assert_eq!(ma.elements.len(), mb.elements.len());
        }
    }
    assert_eq!(to_musicxml(&before), to_musicxml(&after));
}

#[test]
fn test_minify_preserves_semantics() {
    let source = "---\ntime: 4/4\n&m:\n  clef: treble\n---\n&m { C D E F }  { cresc(1-4) }\n";
    let minified = minify(source);
    assert!(minified.len() < source.len());

    let before = parse(source).ast.unwrap();
    let after = parse(&minified).ast.unwrap();
    assert_eq!(to_musicxml(&before), to_musicxml(&after));
}

#[test]
fn test_rectangular_document() {
    let source = "---\ntime: 4/4\n&r:\n  clef: treble\n&l:\n  clef: bass\n---\n&r { C D E F G A B C5 }\n&l { C }";
    let xml = parse_xml(source);

    assert_eq!(xml.matches("<score-partwise").count(), 1);
    assert_eq!(xml.matches("<part id=").count(), 2);
    // Both parts carry two measures; the short one is padded.
    assert_eq!(xml.matches("<measure number=\"1\">").count(), 2);
    assert_eq!(xml.matches("<measure number=\"2\">").count(), 2);
}

#[test]
fn test_beam_states_form_closed_runs() {
    let source = "---\n&m:\n  clef: treble\n---\n&m { =(C/8 D E) F =(G/8 A) }";
    let xml = parse_xml(source);

    let begins = xml.matches(">begin<").count();
    let ends = xml.matches(">end<").count();
    assert_eq!(begins, 2);
    assert_eq!(ends, 2);
    assert_eq!(xml.matches(">continue<").count(), 1);
}

#[test]
fn test_octave_modifier_with_duration() {
    // `C+/8` is note + octave-up + duration; arithmetic saturates at 0..=8.
    let source = "---\noctave: 8\n&m:\n  clef: treble\n---\n&m { C+/8 }";
    let ast = parse(source).ast.unwrap();
    match &ast.staves[0].measures[0].elements[0] {
        Element::Note(note) => {
            assert_eq!(note.pitch.octave, 8);
            assert_eq!(note.duration.beats(), 0.5);
        }
        other => panic!("expected note, got {other:?}"),
    }
}

#[test]
fn test_unknown_annotation_function_is_noop_with_warning() {
    let source = "---\n&m:\n  clef: treble\n---\n&m { C D } { sparkle(1-2) }";
    let out = parse(source);
    assert!(out.errors.is_empty());
    assert!(out
        .warnings
        .iter()
        .any(|w| w.message.contains("unknown annotation function")));
    let xml = to_musicxml(&out.ast.unwrap());
    assert_eq!(xml.matches("<note>").count(), 2);
}

#[test]
fn test_mid_score_time_change() {
    let source = "---\ntime: 4/4\n&m:\n  clef: treble\n---\n&m { C D E F }\n---\ntime: 3/4\n---\n&m { G A B }";
    let ast = parse(source).ast.unwrap();
    let measures = &ast.staves[0].measures;
    assert_eq!(measures.len(), 2);
    let change = measures[1].attributes.as_ref().expect("time change attrs");
    assert_eq!(change.time.map(|t| t.beats), Some(3));
    assert!(change.key.is_none());

    let xml = to_musicxml(&ast);
    let measure2 = &xml[xml.find("<measure number=\"2\">").unwrap()..];
    assert!(measure2.contains("<beats>3</beats>"));
}

#[test]
fn test_validation_pipeline() {
    let source = "---\n&m:\n  clef: treble\n---\n&m { Cb E# C9 [] }";
    let out = parse(source);
    let validation = validate(&out.ast.unwrap());
    assert!(!validation.valid);

    let severities: Vec<Severity> = validation.diagnostics.iter().map(|d| d.severity).collect();
    assert!(severities.contains(&Severity::Error));
    assert!(severities.contains(&Severity::Info));
}

#[test]
fn test_lexical_error_carries_location() {
    let source = "---\n&m:\n  clef: treble\n---\n&m { C/8D }";
    let out = parse(source);
    let error = out
        .errors
        .iter()
        .find(|e| e.message.contains("separated by whitespace"))
        .expect("expected separation error");
    assert_eq!(error.line, 5);
    assert!(error.column > 1);
}

#[test]
fn test_comment_kinds_are_trivia() {
    let source = "&m { C /* block */ D // line\nE }";
    let lexed = tokenize(source);
    assert_eq!(
        lexed
            .tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Comment)
            .count(),
        2
    );
    let ast = parse(source).ast.unwrap();
    assert_eq!(ast.staves[0].measures[0].elements.len(), 3);
}

#[test]
fn test_empty_source() {
    let out = parse("");
    let ast = out.ast.unwrap();
    assert!(ast.staves.is_empty());
    assert_eq!(format(""), "\n");
}

#[test]
fn test_dotted_durations_partition() {
    // Dotted half (3) + quarter (1) fills a 4/4 measure; the explicit /4
    // also resets the sticky duration for the rest of the body.
    let source = "---\ntime: 4/4\n&m:\n  clef: treble\n---\n&m { C/2. D/4 E F G }";
    let ast = parse(source).ast.unwrap();
    let measures = &ast.staves[0].measures;
    assert_eq!(measures.len(), 2);
    assert_eq!(measures[0].elements.len(), 2);
    assert_eq!(measures[1].elements.len(), 3);
}
