use std::fs::File;
use std::io::{BufReader, Read};

use camino::Utf8Path;
use flate2::read::GzDecoder;
use tracing::{debug, warn};

use crate::domain::{Delimiter, columns};
use crate::error::IngestError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    names: Vec<String>,
}

impl Headers {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.iter().all(|name| name.is_empty())
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|header| header == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Every required column absent from the header line, in canonical order.
    pub fn missing_required(&self) -> Vec<String> {
        columns::REQUIRED
            .iter()
            .filter(|name| !self.contains(name))
            .map(|name| name.to_string())
            .collect()
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.is_empty() {
            return Err(IngestError::EmptyHeaders);
        }
        let missing = self.missing_required();
        if !missing.is_empty() {
            return Err(IngestError::MissingHeaders(missing));
        }
        Ok(())
    }
}

/// One data line keyed by header name.
#[derive(Debug, Clone)]
pub struct RowRecord<'a> {
    line: usize,
    headers: &'a Headers,
    values: Vec<String>,
}

impl<'a> RowRecord<'a> {
    pub fn line(&self) -> usize {
        self.line
    }

    pub fn headers(&self) -> &'a Headers {
        self.headers
    }

    /// Raw cell for `column`; `None` when the column is not in the header.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.headers
            .position(column)
            .and_then(|index| self.values.get(index))
            .map(String::as_str)
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }
}

/// A parsed metadata file: header line plus the raw, non-blank data lines.
#[derive(Debug, Clone)]
pub struct Table {
    headers: Headers,
    delimiter: Delimiter,
    lines: Vec<(usize, String)>,
}

impl Table {
    pub fn read_path(path: &Utf8Path, delimiter: Option<Delimiter>) -> Result<Self, IngestError> {
        let file = File::open(path.as_std_path())
            .map_err(|err| IngestError::Filesystem(format!("open {path}: {err}")))?;
        if path.extension() == Some("gz") {
            Self::from_reader(GzDecoder::new(BufReader::new(file)), delimiter)
        } else {
            Self::from_reader(BufReader::new(file), delimiter)
        }
    }

    pub fn from_reader<R: Read>(
        mut reader: R,
        delimiter: Option<Delimiter>,
    ) -> Result<Self, IngestError> {
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        Ok(Self::parse(&text, delimiter))
    }

    /// Splits `text` into headers and data lines. Header validation is left to
    /// [`Headers::validate`] so callers decide when to reject.
    pub fn parse(text: &str, delimiter: Option<Delimiter>) -> Self {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut lines = text.lines().enumerate();
        let header_line = lines.next().map(|(_, line)| line).unwrap_or("");
        let delimiter = delimiter.unwrap_or_else(|| Delimiter::detect(header_line));
        let names = if header_line.trim().is_empty() {
            Vec::new()
        } else {
            header_line
                .split(delimiter.as_char())
                .map(|name| name.trim().to_string())
                .collect()
        };
        let lines = lines
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| (index + 1, line.to_string()))
            .collect::<Vec<_>>();
        debug!(
            columns = names.len(),
            rows = lines.len(),
            %delimiter,
            "parsed metadata table"
        );
        Self {
            headers: Headers::new(names),
            delimiter,
            lines,
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn delimiter(&self) -> Delimiter {
        self.delimiter
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Two-pass split: plain delimiter first, quote-aware parse on a field
    /// count mismatch. `None` when neither matches the header width.
    pub fn split_line(&self, line: &str) -> Option<Vec<String>> {
        let plain = line
            .split(self.delimiter.as_char())
            .map(str::to_string)
            .collect::<Vec<_>>();
        if plain.len() == self.headers.len() {
            return Some(plain);
        }
        let quoted = split_quoted(line, self.delimiter.as_char());
        (quoted.len() == self.headers.len()).then_some(quoted)
    }

    /// Data lines used for sample grouping: marker lines are excluded.
    pub fn grouping_lines(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        self.lines
            .iter()
            .filter(|(_, line)| !is_marker_line(line))
            .map(|(number, line)| (*number, line.as_str()))
    }

    /// Row records for graph building, in file order. A leading `TYPE`
    /// annotation row is dropped and rows that fail both splits are skipped.
    pub fn records(&self) -> impl Iterator<Item = RowRecord<'_>> + '_ {
        let mut first = true;
        self.lines.iter().filter_map(move |(number, line)| {
            let Some(values) = self.split_line(line) else {
                warn!(line = number, "skipping row with mismatched field count");
                return None;
            };
            let leading = std::mem::replace(&mut first, false);
            if leading
                && values
                    .first()
                    .is_some_and(|cell| cell.trim().eq_ignore_ascii_case("TYPE"))
            {
                debug!(line = number, "dropping TYPE annotation row");
                return None;
            }
            Some(RowRecord {
                line: *number,
                headers: &self.headers,
                values,
            })
        })
    }
}

/// Lines carrying `type` or `group` anywhere are annotation markers, not data.
pub fn is_marker_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("type") || lower.contains("group")
}

fn split_quoted(line: &str, delimiter: char) -> Vec<String> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in line.chars() {
        if ch == '"' {
            in_quotes = !in_quotes;
        } else if ch == delimiter && !in_quotes {
            values.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(ch);
        }
    }
    values.push(current.trim().to_string());
    values
}
