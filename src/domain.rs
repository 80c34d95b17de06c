use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IngestError;

pub mod columns {
    pub const CELLULAR_RESOLUTION: &str = "cellularResolution";
    pub const SEQUENCE_TYPE: &str = "sequenceType";
    pub const STANDARDIZED_SPECIES: &str = "standardized_species";
    pub const SAMPLE_ID: &str = "sample_id";
    pub const ORGAN: &str = "organ";
    pub const DISORDER: &str = "disorder";
    pub const PROTOCOL: &str = "protocol";
    pub const GENDER: &str = "gender";
    pub const PATIENT_ID: &str = "patient_id";
    pub const AGE: &str = "age";
    pub const BATCH: &str = "batch";
    pub const CELL_NUMBER: &str = "cellNumber";

    pub const REQUIRED: [&str; 6] = [
        CELLULAR_RESOLUTION,
        SEQUENCE_TYPE,
        STANDARDIZED_SPECIES,
        SAMPLE_ID,
        ORGAN,
        DISORDER,
    ];
}

/// Cell value marking a subject or sample as not recorded.
pub const UNKNOWN: &str = "Unknown";

pub const DEFAULT_BATCH: &str = "Default_Batch";

pub const SINGLE_CELL: &str = "Single Cell";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delimiter(char);

impl Delimiter {
    pub const TAB: Delimiter = Delimiter('\t');
    pub const COMMA: Delimiter = Delimiter(',');

    pub fn as_char(self) -> char {
        self.0
    }

    /// Picks the most frequent candidate separator in a header line; tab wins ties.
    pub fn detect(header_line: &str) -> Self {
        let candidates = ['\t', ',', ';', '|'];
        let mut best = ('\t', 0usize);
        for candidate in candidates {
            let count = header_line.matches(candidate).count();
            if count > best.1 {
                best = (candidate, count);
            }
        }
        Delimiter(best.0)
    }
}

impl Default for Delimiter {
    fn default() -> Self {
        Delimiter::TAB
    }
}

impl fmt::Display for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            '\t' => write!(f, "tab"),
            ',' => write!(f, "comma"),
            ';' => write!(f, "semicolon"),
            '|' => write!(f, "pipe"),
            other => write!(f, "{other}"),
        }
    }
}

impl FromStr for Delimiter {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "tab" | "\\t" | "\t" => Ok(Delimiter('\t')),
            "comma" | "," => Ok(Delimiter(',')),
            "semicolon" | ";" => Ok(Delimiter(';')),
            "pipe" | "|" => Ok(Delimiter('|')),
            _ => {
                let mut chars = value.chars();
                match (chars.next(), chars.next()) {
                    (Some(ch), None) if ch != '"' && !ch.is_alphanumeric() => Ok(Delimiter(ch)),
                    _ => Err(IngestError::InvalidDelimiter(value.to_string())),
                }
            }
        }
    }
}

/// Name of an uploaded metadata file; doubles as the ACCESSION key of every
/// resource created from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadFilename(String);

impl UploadFilename {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadFilename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UploadFilename {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let name = trimmed
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(trimmed)
            .to_string();
        let name = match name.strip_suffix(".gz") {
            Some(stripped) => stripped.to_string(),
            None => name,
        };
        let lower = name.to_ascii_lowercase();
        let has_stem = name.len() > 4;
        if !has_stem || !(lower.ends_with(".csv") || lower.ends_with(".tsv")) {
            return Err(IngestError::InvalidFilename(value.to_string()));
        }
        Ok(Self(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
    Unknown,
}

impl Gender {
    /// Maps a free-text cell; `None` for an empty cell.
    pub fn from_cell(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        let gender = match value.to_ascii_lowercase().as_str() {
            "male" | "m" => Gender::Male,
            "female" | "f" => Gender::Female,
            "other" | "o" => Gender::Other,
            _ => Gender::Unknown,
        };
        Some(gender)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "dropseq")]
    DropSeq,
    #[serde(rename = "10XV1")]
    TenXV1,
    #[serde(rename = "10XV2")]
    TenXV2,
    #[serde(rename = "10XV3")]
    TenXV3,
    #[serde(rename = "10XV4")]
    TenXV4,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::DropSeq => "dropseq",
            Protocol::TenXV1 => "10XV1",
            Protocol::TenXV2 => "10XV2",
            Protocol::TenXV3 => "10XV3",
            Protocol::TenXV4 => "10XV4",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let all = [
            Protocol::DropSeq,
            Protocol::TenXV1,
            Protocol::TenXV2,
            Protocol::TenXV3,
            Protocol::TenXV4,
        ];
        all.into_iter()
            .find(|protocol| protocol.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| IngestError::InvalidProtocol(value.to_string()))
    }
}
