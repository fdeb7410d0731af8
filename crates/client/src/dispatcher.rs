//! Command parsing and outcomes.
//!
//! Lines are classified here; the [`Client`](crate::client::Client) decides
//! what each command does given the session state.

use serde_json::Value;

/// One classified input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// `#...`; never reaches the server.
    Comment,
    /// `exit`, `quit` or `q`.
    Quit,
    /// `login [name]`.
    Login { name: Option<&'a str> },
    Logout,
    /// `reload init`.
    ReloadInit,
    /// Everything else, passed through verbatim.
    Raw(&'a str),
}

impl<'a> Command<'a> {
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.starts_with('#') {
            return Command::Comment;
        }

        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("exit" | "quit" | "q"), _, _) => Command::Quit,
            (Some("login"), name, _) => Command::Login { name },
            (Some("logout"), None, _) => Command::Logout,
            (Some("reload"), Some("init"), None) => Command::ReloadInit,
            _ => Command::Raw(line),
        }
    }
}

/// Result of one command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: Option<String>,
    pub data: Option<Value>,
    /// Set by the quit path; the read loop stops after it.
    pub exit: bool,
}

impl CommandOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn exit() -> Self {
        Self {
            success: true,
            exit: true,
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Change to the init script implied by a successful command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEdit {
    /// Replace the line starting with `tokens`, or append `line`.
    Upsert { tokens: Vec<String>, line: String },
    /// Remove the line starting with `tokens`.
    Delete { tokens: Vec<String> },
}

impl ScriptEdit {
    pub fn tokens(&self) -> &[String] {
        match self {
            ScriptEdit::Upsert { tokens, .. } | ScriptEdit::Delete { tokens } => tokens,
        }
    }

    pub fn line(&self) -> Option<&str> {
        match self {
            ScriptEdit::Upsert { line, .. } => Some(line),
            ScriptEdit::Delete { .. } => None,
        }
    }
}

/// Name token with a trailing `:` removed.
fn name_token(word: &str) -> String {
    word.trim_end_matches(':').to_string()
}

/// Persistent effect of `cmd`, given the currently focused instrument.
pub fn script_edit(cmd: &str, instrument: Option<&str>) -> Option<ScriptEdit> {
    let words: Vec<&str> = cmd.split_whitespace().collect();
    let line = words.join(" ");
    let upsert = |tokens: Vec<String>| Some(ScriptEdit::Upsert { tokens, line: line.clone() });

    match words.as_slice() {
        [verb @ ("alias" | "replace"), name, _, ..] => {
            upsert(vec![verb.to_string(), name_token(name)])
        }
        ["fatfinger", _, ..] if instrument.is_some() => upsert(vec!["fatfinger".to_string()]),
        ["set", key, _value] if key.chars().any(|c| c.is_ascii_alphabetic()) => {
            upsert(vec!["set".to_string(), key.to_string()])
        }
        ["unalias", name, ..] => Some(ScriptEdit::Delete {
            tokens: vec!["alias".to_string(), name_token(name)],
        }),
        ["unreplace", name, ..] => Some(ScriptEdit::Delete {
            tokens: vec!["replace".to_string(), name_token(name)],
        }),
        _ => None,
    }
}
