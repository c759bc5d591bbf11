//! # INFO Reply Parsing
//!
//! `INFO` answers with `# Section` headers followed by `field:value` lines.

use std::collections::HashMap;

/// Flattens an INFO reply into one map. The `section` entry holds the name
/// of the last section header seen.
pub fn parse_info(text: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in info_lines(text) {
        match line {
            InfoLine::Section(name) => {
                fields.insert("section".to_string(), name.to_string());
            }
            InfoLine::Field(key, value) => {
                fields.insert(key.to_string(), value.to_string());
            }
        }
    }
    fields
}

/// Groups INFO fields by section. Fields before any header land under the
/// empty section name.
pub fn parse_info_sections(text: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current = String::new();
    for line in info_lines(text) {
        match line {
            InfoLine::Section(name) => {
                current = name.to_string();
                sections.entry(current.clone()).or_default();
            }
            InfoLine::Field(key, value) => {
                sections
                    .entry(current.clone())
                    .or_default()
                    .insert(key.to_string(), value.to_string());
            }
        }
    }
    sections
}

enum InfoLine<'a> {
    Section(&'a str),
    Field(&'a str, &'a str),
}

// Lines that are neither a header nor `field:value` are skipped.
fn info_lines(text: &str) -> impl Iterator<Item = InfoLine<'_>> {
    text.lines().filter_map(|line| {
        let line = line.trim();
        if let Some(name) = line.strip_prefix('#') {
            return Some(InfoLine::Section(name.trim()));
        }
        line.split_once(':')
            .map(|(key, value)| InfoLine::Field(key, value))
    })
}
