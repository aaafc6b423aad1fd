use scorelang::Severity;
use std::env;
use std::fs;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut mode = Mode::Compile;
    let mut no_validate = false;
    let mut pretty = false;
    let mut paths: Vec<&String> = Vec::new();

    for arg in &args[1..] {
        match arg.as_str() {
            "--format" => mode = Mode::Format,
            "--minify" => mode = Mode::Minify,
            "--tokens" => mode = Mode::Tokens,
            "--no-validate" => no_validate = true,
            "--pretty" => pretty = true,
            _ => paths.push(arg),
        }
    }

    if paths.is_empty() {
        eprintln!("Usage: scorelang [--format|--minify|--tokens] [--no-validate] [--pretty] <input.score> [output]");
        process::exit(1);
    }

    let input_path = paths[0];
    let output_path = paths.get(1);

    let source = match fs::read_to_string(input_path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Error reading file '{}': {}", input_path, e);
            process::exit(1);
        }
    };

    let output = match mode {
        Mode::Format => scorelang::format(&source),
        Mode::Minify => scorelang::minify(&source),
        Mode::Tokens => {
            let lexed = scorelang::tokenize(&source);
            report(&lexed.errors);
            match serde_json::to_string_pretty(&lexed.tokens) {
                Ok(json) => json,
                Err(e) => {
                    eprintln!("Error serializing tokens: {}", e);
                    process::exit(1);
                }
            }
        }
        Mode::Compile => {
            let parsed = scorelang::parse(&source);
            report(&parsed.errors);
            report(&parsed.warnings);

            let Some(score) = parsed.ast else {
                process::exit(1);
            };

            let mut failed = parsed
                .errors
                .iter()
                .any(|d| d.severity == Severity::Error);
            if !no_validate {
                let validation = scorelang::validate(&score);
                report(&validation.diagnostics);
                failed = failed || !validation.valid;
            }
            if failed {
                process::exit(1);
            }

            let options = scorelang::XmlOptions {
                include_xml_declaration: true,
                pretty_print: pretty,
            };
            scorelang::to_musicxml_with_options(&score, &options)
        }
    };

    match output_path {
        Some(path) => {
            if let Err(e) = fs::write(path, &output) {
                eprintln!("Error writing to '{}': {}", path, e);
                process::exit(1);
            }
            eprintln!("Wrote {}", path);
        }
        None => println!("{}", output),
    }
}

enum Mode {
    Compile,
    Format,
    Minify,
    Tokens,
}

fn report(diagnostics: &[scorelang::Diagnostic]) {
    for diagnostic in diagnostics {
        eprintln!("{}", diagnostic);
    }
}
