//! Star text format reader and writer.
//!
//! Only the first `data_` block of a file is read. Both `loop_` blocks and
//! plain `_label value` pairs (read as a single-row table) are accepted.

use super::table::{StarValue, Table};
use super::StarError;
use log::debug;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

impl Table {
    /// Reads the first data block of a star file.
    ///
    /// # Errors
    /// - `MissingFile` when `path` does not exist.
    /// - `Malformed` when the block is absent or rows disagree with the header.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, StarError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(StarError::MissingFile(path.to_path_buf()));
        }
        let text = fs::read_to_string(path).map_err(|source| StarError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table = parse_star(&text).map_err(|(line, message)| StarError::Malformed {
            path: path.to_path_buf(),
            line,
            message,
        })?;
        debug!(
            "event=star_read module=star status=ok path={} rows={} columns={}",
            path.display(),
            table.len(),
            table.column_names().len()
        );
        Ok(table)
    }

    /// Writes this table as a single `data_` block with a `loop_`.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), StarError> {
        let path = path.as_ref();
        fs::write(path, self.to_star_string()).map_err(|source| StarError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(
            "event=star_write module=star status=ok path={} rows={}",
            path.display(),
            self.len()
        );
        Ok(())
    }

    /// Renders the table in star text format.
    pub fn to_star_string(&self) -> String {
        let mut out = String::from("\ndata_\n\nloop_\n");
        for (index, column) in self.column_names().iter().enumerate() {
            let _ = writeln!(out, "_{column} #{}", index + 1);
        }
        for row in self.iter() {
            let line = row
                .values()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            out.push_str(&line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

type ParseFailure = (usize, String);

fn parse_star(text: &str) -> Result<Table, ParseFailure> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .peekable();

    loop {
        match lines.next() {
            Some((_, line)) if line.starts_with("data_") => break,
            Some(_) => continue,
            None => return Err((0, "no data_ block found".to_string())),
        }
    }

    let is_loop = matches!(lines.peek(), Some((_, line)) if *line == "loop_");
    if is_loop {
        lines.next();
    }

    let mut columns = Vec::new();
    let mut pairs = Vec::new();
    while let Some((line_no, line)) = lines.peek().copied() {
        if !line.starts_with('_') {
            break;
        }
        lines.next();
        let tokens = tokenize(line).map_err(|message| (line_no, message))?;
        let label = tokens[0].trim_start_matches('_').to_string();
        if label.is_empty() {
            return Err((line_no, "empty column label".to_string()));
        }
        if is_loop {
            columns.push(label);
        } else {
            let value = tokens
                .get(1)
                .ok_or_else(|| (line_no, format!("label `{label}` has no value")))?;
            columns.push(label);
            pairs.push(StarValue::parse(value));
        }
    }

    if columns.is_empty() {
        return Err((0, "data block declares no columns".to_string()));
    }

    let mut table = Table::new(columns.iter().cloned());
    if table.column_names().len() != columns.len() {
        return Err((0, "duplicate column label".to_string()));
    }

    if !is_loop {
        table
            .add_row(pairs)
            .map_err(|err| (0, err.to_string()))?;
        return Ok(table);
    }

    for (line_no, line) in lines {
        if line.starts_with("data_") {
            break;
        }
        let tokens = tokenize(line).map_err(|message| (line_no, message))?;
        if tokens.len() != columns.len() {
            return Err((
                line_no,
                format!(
                    "row has {} values but {} columns are declared",
                    tokens.len(),
                    columns.len()
                ),
            ));
        }
        table
            .add_row(tokens.iter().map(|token| StarValue::parse(token)).collect())
            .map_err(|err| (line_no, err.to_string()))?;
    }

    Ok(table)
}

/// Splits one line on whitespace, keeping quoted tokens together.
fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' || c == '\'' {
            chars.next();
            let mut token = String::new();
            let mut closed = false;
            for next in chars.by_ref() {
                if next == c {
                    closed = true;
                    break;
                }
                token.push(next);
            }
            if !closed {
                return Err(format!("unterminated quote in `{line}`"));
            }
            tokens.push(token);
            continue;
        }
        let mut token = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_whitespace() {
                break;
            }
            token.push(next);
            chars.next();
        }
        tokens.push(token);
    }
    Ok(tokens)
}
