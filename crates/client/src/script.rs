//! Per-exchange init scripts.
//!
//! The init script is replayed by the server on every `hello`. Commands that
//! define persistent state (aliases, settings) are written back here after
//! the server accepted them.
//!
//! File format (`<data_dir>/initrun-<exchange>.txt`):
//!
//! ```text
//! set timeout 30          <- global block: everything before the first
//! alias hi: buy 1             `instrument` line
//! instrument BTC-PERP
//! alias lo: sell 1        <- BTC-PERP block
//! fatfinger 5
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use protocol::{scope_label, Exchange, ALL_SYM};

use crate::storage::StorageResult;

/// Lines replayed during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitScript {
    pub init_lines: Vec<String>,
}

/// Storage of init scripts.
pub trait ScriptStore: Send + Sync {
    /// Non-empty, non-comment lines for `exchange`.
    fn read(&self, exchange: Exchange) -> StorageResult<InitScript>;

    /// Replaces the first line of the `scope` block whose leading words match
    /// `match_tokens` with `line`, appending it when nothing matches.
    /// `None` deletes the matching line instead.
    fn write(
        &self,
        exchange: Exchange,
        scope: &str,
        match_tokens: &[String],
        line: Option<&str>,
    ) -> StorageResult<()>;
}

/// [`ScriptStore`] backed by one text file per exchange.
#[derive(Debug, Clone)]
pub struct InitFileStore {
    dir: PathBuf,
}

impl InitFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, exchange: Exchange) -> PathBuf {
        self.dir.join(format!("initrun-{}.txt", exchange.as_str()))
    }
}

fn read_lines(path: &Path) -> StorageResult<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(fs::read_to_string(path)?
        .lines()
        .map(|l| l.trim().to_string())
        .collect())
}

impl ScriptStore for InitFileStore {
    fn read(&self, exchange: Exchange) -> StorageResult<InitScript> {
        let path = self.path_for(exchange);
        if !path.exists() {
            tracing::info!(path = %path.display(), "no init script yet");
        }
        let init_lines = read_lines(&path)?
            .into_iter()
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        Ok(InitScript { init_lines })
    }

    fn write(
        &self,
        exchange: Exchange,
        scope: &str,
        match_tokens: &[String],
        line: Option<&str>,
    ) -> StorageResult<()> {
        let path = self.path_for(exchange);
        let mut blocks = split_blocks(read_lines(&path)?);
        let scope = normalize_scope(scope);

        let index = match blocks.iter().position(|b| b.symbol == scope) {
            Some(index) => index,
            None if line.is_none() => return Ok(()),
            None => {
                blocks.push(Block {
                    lines: vec![
                        format!("instrument {scope}"),
                        format!("### {} commands", scope_label(Some(scope.as_str()))),
                    ],
                    symbol: scope,
                });
                blocks.len() - 1
            }
        };

        let block = &mut blocks[index];
        let existing = block
            .lines
            .iter()
            .position(|l| line_matches(l, match_tokens));

        match (existing, line) {
            (Some(i), Some(line)) => block.lines[i] = normalize_line(line),
            (None, Some(line)) => block.lines.push(normalize_line(line)),
            (Some(i), None) => {
                block.lines.remove(i);
            }
            (None, None) => return Ok(()),
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents: Vec<&str> = blocks
            .iter()
            .flat_map(|b| b.lines.iter().map(String::as_str))
            .collect();
        fs::write(&path, contents.join("\n"))?;
        tracing::debug!(path = %path.display(), ?match_tokens, "init script updated");
        Ok(())
    }
}

#[derive(Debug)]
struct Block {
    symbol: String,
    lines: Vec<String>,
}

fn normalize_scope(scope: &str) -> String {
    if scope == ALL_SYM {
        ALL_SYM.to_string()
    } else {
        scope.to_uppercase()
    }
}

fn normalize_line(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Splits into instrument blocks. The first block is global and may be empty.
fn split_blocks(lines: Vec<String>) -> Vec<Block> {
    let mut blocks = vec![Block {
        symbol: ALL_SYM.to_string(),
        lines: Vec::new(),
    }];

    for line in lines {
        let mut words = line.split_whitespace();
        if let (Some("instrument"), Some(symbol)) = (words.next(), words.next()) {
            let symbol = normalize_scope(symbol);
            let current = blocks.last().map(|b| b.symbol.as_str());
            if current != Some(symbol.as_str()) {
                blocks.push(Block {
                    symbol,
                    lines: Vec::new(),
                });
            }
        }
        if let Some(block) = blocks.last_mut() {
            block.lines.push(line);
        }
    }

    blocks
}

/// Case-insensitive prefix match on words; `:` in a line word is ignored.
fn line_matches(line: &str, tokens: &[String]) -> bool {
    let words: Vec<&str> = line.split_whitespace().collect();
    if tokens.is_empty() || words.len() < tokens.len() {
        return false;
    }
    tokens.iter().zip(&words).all(|(token, word)| {
        token.eq_ignore_ascii_case(&word.replace(':', ""))
    })
}
