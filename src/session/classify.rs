//! Intent classification for inbound utterances.

use crate::schema::SchemaDescriptor;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref COMMAND: Regex = Regex::new(r"(?is)^\s*/([a-z]+)\b\s*(.*)$").expect("command pattern");
    static ref WORD: Regex = Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("word pattern");
}

const ROSTER_NOUNS: &[&str] = &[
    "client", "clients", "athlete", "athletes", "player", "players", "recruit", "recruits",
    "student", "students", "roster",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Query(String),
    Chat(String),
    Help,
}

pub fn classify(text: &str, schema: &SchemaDescriptor) -> Intent {
    if let Some(caps) = COMMAND.captures(text) {
        let rest = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
        return match caps[1].to_lowercase().as_str() {
            "sql" if !rest.is_empty() => Intent::Query(rest),
            "ai" if !rest.is_empty() => Intent::Chat(rest),
            _ => Intent::Help,
        };
    }

    let text = text.trim();
    if text.is_empty() {
        return Intent::Help;
    }
    if mentions_data(text, schema) {
        Intent::Query(text.to_string())
    } else {
        Intent::Chat(text.to_string())
    }
}

/// True when the text names a table, a column (either `snake_case` or spaced out) or a
/// roster noun.
fn mentions_data(text: &str, schema: &SchemaDescriptor) -> bool {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = WORD.find_iter(&lowered).map(|m| m.as_str()).collect();

    if words.iter().any(|w| ROSTER_NOUNS.contains(w)) {
        return true;
    }
    schema.tables().iter().any(|table| {
        words.iter().any(|w| table.name.eq_ignore_ascii_case(w))
            || table.columns.iter().any(|column| {
                let name = column.name.to_lowercase();
                words.iter().any(|w| *w == name)
                    || (name.contains('_') && lowered.contains(&name.replace('_', " ")))
            })
    })
}

pub const HELP_TEXT: &str = "Ask about your athletes in plain English, for example \
\"linebackers in Illinois with a GPA above 3.5\".\n\
/sql <question>  always search the database\n\
/ai <message>    chat with the assistant without touching the database\n\
/help            show this message";
