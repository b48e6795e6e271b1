//! Fixed-width directives manifest.
//!
//! Each meaningful line holds the directive text in its first
//! [`DIRECTIVE_FIELD_WIDTH`] characters and a free-text description after it.

use std::path::Path;

use anyhow::{Context, Result};

pub const DIRECTIVE_FIELD_WIDTH: usize = 86;
pub const MIN_LINE_CHARS: usize = 10;
pub const COMMENT_MARKER: &str = "--";

/// Manifest compiled into the binary, used when no external file is configured.
pub const EMBEDDED_MANIFEST: &str = include_str!("../core_directives.txt");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveLine {
    pub directive: String,
    pub description: String,
}

pub fn parse_manifest(manifest: &str) -> Vec<DirectiveLine> {
    manifest.lines().filter_map(parse_line).collect()
}

fn parse_line(raw: &str) -> Option<DirectiveLine> {
    let line = raw.trim_end_matches('\r');
    if line.contains(COMMENT_MARKER) || line.chars().count() < MIN_LINE_CHARS {
        return None;
    }

    let (directive, description) = match line.char_indices().nth(DIRECTIVE_FIELD_WIDTH) {
        Some((split, _)) => (&line[..split], &line[split..]),
        None => (line, ""),
    };

    let directive = directive.trim();
    if directive.is_empty() {
        return None;
    }
    Some(DirectiveLine {
        directive: directive.to_string(),
        description: description.trim().to_string(),
    })
}

/// Read the configured manifest, or fall back to the embedded one.
pub fn load_manifest(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read directives manifest {:?}", path)),
        None => Ok(EMBEDDED_MANIFEST.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::JournalStore;

    #[test]
    fn splits_fixed_width_line() {
        let line = format!(
            "{:<width$}{}",
            "\"Do no harm\" ..........",
            "Never cause irreversible damage",
            width = DIRECTIVE_FIELD_WIDTH
        );
        let parsed = parse_manifest(&line);
        assert_eq!(
            parsed,
            vec![DirectiveLine {
                directive: "\"Do no harm\" ..........".to_string(),
                description: "Never cause irreversible damage".to_string(),
            }]
        );
    }

    #[test]
    fn skips_comments_and_short_lines() {
        let manifest = "-- header comment\n\nshort\n   \nKeep the journal append-only\r\n";
        let parsed = parse_manifest(manifest);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].directive, "Keep the journal append-only");
        assert_eq!(parsed[0].description, "");
    }

    #[test]
    fn split_counts_characters_not_bytes() {
        let directive = "Ne nuis pas à l'opérateur";
        let line = format!(
            "{:<width$}décrit en détail",
            directive,
            width = DIRECTIVE_FIELD_WIDTH
        );
        let parsed = parse_manifest(&line);
        assert_eq!(parsed[0].directive, directive);
        assert_eq!(parsed[0].description, "décrit en détail");
    }

    #[test]
    fn embedded_manifest_has_directives() {
        let parsed = parse_manifest(EMBEDDED_MANIFEST);
        assert!(!parsed.is_empty());
        assert!(parsed.iter().all(|line| !line.directive.is_empty()));
    }

    #[test]
    fn loading_twice_is_idempotent() {
        let store = JournalStore::open_in_memory().unwrap();
        let first = store.load_directives_from(EMBEDDED_MANIFEST).unwrap();
        let after_first = store.get_directives(1000).unwrap();

        let second = store.load_directives_from(EMBEDDED_MANIFEST).unwrap();
        let after_second = store.get_directives(1000).unwrap();

        assert_eq!(first.inserted, first.parsed);
        assert_eq!(second.parsed, first.parsed);
        assert_eq!(second.inserted, 0);
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn missing_external_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_manifest(Some(&dir.path().join("nope.txt"))).unwrap_err();
        assert!(err.to_string().contains("directives manifest"));
        assert_eq!(load_manifest(None).unwrap(), EMBEDDED_MANIFEST);
    }
}
