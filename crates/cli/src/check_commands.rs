use std::path::Path;

use anyhow::Result;

use threadrelay_config::{Diagnostic, Severity, validate, validate_config};

use crate::relay;

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Categories reported against the raw file rather than the merged config.
const FILE_CATEGORIES: &[&str] = &["syntax", "unknown-field", "type-error", "file-ref"];

pub fn check(path: Option<&Path>, verbose: bool) -> Result<()> {
    let file = validate(path);

    if let Some(ref path) = file.config_path {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found; checking defaults and environment.\n");
    }

    let mut diagnostics: Vec<Diagnostic> = file
        .diagnostics
        .into_iter()
        .filter(|d| FILE_CATEGORIES.contains(&d.category))
        .collect();

    // Semantic checks run on what `run` would see: file plus environment.
    let file_ok = !diagnostics.iter().any(|d| d.severity == Severity::Error);
    if file_ok {
        let config = relay::load(path)?;
        diagnostics.extend(validate_config(&config).diagnostics);
    }

    let mut shown = 0;
    for d in &diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
            Severity::Info => (CYAN, "info"),
        };

        if d.path.is_empty() {
            eprintln!("  {BOLD}{color}{label}{RESET} {}", d.message);
        } else {
            eprintln!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message);
        }
        shown += 1;
    }

    let count = |severity| diagnostics.iter().filter(|d| d.severity == severity).count();
    let errors = count(Severity::Error);
    let warnings = count(Severity::Warning);

    if shown > 0 {
        eprintln!();
    }

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }

    Ok(())
}
