use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::IngestError;
use crate::grouper::SampleBatchRecord;

/// Tab-separated rendering of stored records. The header row is taken from
/// the first record's columns.
pub fn export_tsv(records: &[SampleBatchRecord]) -> Result<String, IngestError> {
    let Some(first) = records.first() else {
        return Ok(String::new());
    };
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(Vec::new());
    let header = first
        .source_columns
        .fields()
        .into_iter()
        .map(|(name, _)| name)
        .collect::<Vec<_>>();
    writer
        .write_record(&header)
        .map_err(render_error)?;
    for record in records {
        let values = record
            .source_columns
            .fields()
            .into_iter()
            .map(|(_, value)| value)
            .collect::<Vec<_>>();
        writer
            .write_record(&values)
            .map_err(render_error)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| render_error(err.error()))?;
    String::from_utf8(bytes).map_err(render_error)
}

fn render_error(err: impl std::fmt::Display) -> IngestError {
    IngestError::Export(err.to_string())
}

/// Per-upload overview of the stored records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileSummary {
    pub filename: String,
    pub created_at: Option<String>,
    pub samples: usize,
    pub cells: usize,
    pub species: Vec<String>,
    pub sequence_types: Vec<String>,
    pub cellular_resolutions: Vec<String>,
    pub protocols: Vec<String>,
    pub organs: Vec<String>,
    pub disorders: Vec<String>,
}

pub fn summarize(filename: &str, records: &[SampleBatchRecord]) -> FileSummary {
    fn distinct<'a>(values: impl Iterator<Item = &'a Option<String>>) -> Vec<String> {
        values
            .flatten()
            .filter(|value| !value.is_empty())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    let columns = || records.iter().map(|record| &record.source_columns);
    FileSummary {
        filename: filename.to_string(),
        created_at: records
            .iter()
            .map(|record| record.meta.created_at.clone())
            .min(),
        samples: records.len(),
        cells: records.iter().map(SampleBatchRecord::cell_count).sum(),
        species: distinct(columns().map(|c| &c.standardized_species)),
        sequence_types: distinct(columns().map(|c| &c.sequence_type)),
        cellular_resolutions: distinct(columns().map(|c| &c.cellular_resolution)),
        protocols: distinct(columns().map(|c| &c.protocol)),
        organs: distinct(columns().map(|c| &c.organ)),
        disorders: distinct(columns().map(|c| &c.disorder)),
    }
}
