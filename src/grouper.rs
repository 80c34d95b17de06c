use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{Protocol, SINGLE_CELL, UploadFilename, columns};
use crate::error::IngestError;
use crate::row_store::RowStore;
use crate::table::Table;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub filename: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// Representative cell values of one sample. Absent columns stay `null` so
/// every stored document has the same key set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceColumns {
    #[serde(default)]
    pub organ: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    pub sample_id: String,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub standardized_species: Option<String>,
    #[serde(rename = "cellularResolution", default)]
    pub cellular_resolution: Option<String>,
    #[serde(default)]
    pub disorder: Option<String>,
    #[serde(default)]
    pub age: Option<String>,
    #[serde(rename = "sequenceType", default)]
    pub sequence_type: Option<String>,
    #[serde(default)]
    pub batch: Option<String>,
    #[serde(rename = "cellNumber", default)]
    pub cell_number: usize,
}

impl SourceColumns {
    /// Column name and rendered value, in stored-document order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        let text = |value: &Option<String>| value.clone().unwrap_or_default();
        vec![
            (columns::ORGAN, text(&self.organ)),
            (columns::GENDER, text(&self.gender)),
            (columns::SAMPLE_ID, self.sample_id.clone()),
            (columns::PATIENT_ID, text(&self.patient_id)),
            (columns::PROTOCOL, text(&self.protocol)),
            (columns::STANDARDIZED_SPECIES, text(&self.standardized_species)),
            (columns::CELLULAR_RESOLUTION, text(&self.cellular_resolution)),
            (columns::DISORDER, text(&self.disorder)),
            (columns::AGE, text(&self.age)),
            (columns::SEQUENCE_TYPE, text(&self.sequence_type)),
            (columns::BATCH, text(&self.batch)),
            (columns::CELL_NUMBER, self.cell_number.to_string()),
        ]
    }
}

/// One stored document per distinct sample id of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleBatchRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub meta: RecordMeta,
    #[serde(rename = "sourceColumns")]
    pub source_columns: SourceColumns,
}

impl SampleBatchRecord {
    pub fn filename(&self) -> &str {
        &self.meta.filename
    }

    pub fn sample_id(&self) -> &str {
        &self.source_columns.sample_id
    }

    pub fn cell_count(&self) -> usize {
        self.source_columns.cell_number
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupingReport {
    pub filename: String,
    pub records: usize,
    pub cells: usize,
    pub skipped_rows: usize,
    pub chunks_written: usize,
}

#[derive(Debug, Clone)]
pub struct GroupedUpload {
    pub records: Vec<SampleBatchRecord>,
    pub report: GroupingReport,
}

#[derive(Debug, Clone, Copy)]
pub struct SampleGrouper {
    chunk_size: usize,
}

impl Default for SampleGrouper {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl SampleGrouper {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Collapses data rows into one record per sample id. Nothing is written;
    /// every validation error surfaces before [`SampleGrouper::persist`].
    pub fn group(
        &self,
        table: &Table,
        filename: &UploadFilename,
        created_at: &str,
    ) -> Result<GroupedUpload, IngestError> {
        let headers = table.headers();
        headers.validate()?;
        let sample_index = headers
            .position(columns::SAMPLE_ID)
            .ok_or_else(|| IngestError::MissingHeaders(vec![columns::SAMPLE_ID.to_string()]))?;
        let resolution_index = headers.position(columns::CELLULAR_RESOLUTION);
        let has_protocol = headers.contains(columns::PROTOCOL);

        // first-seen order, representative row, count
        let mut groups: Vec<(Vec<String>, usize)> = Vec::new();
        let mut by_sample: HashMap<String, usize> = HashMap::new();
        let mut skipped_rows = 0usize;

        for (line, text) in table.grouping_lines() {
            let Some(values) = table.split_line(text) else {
                warn!(line, "skipping row with mismatched field count");
                skipped_rows += 1;
                continue;
            };
            let sample_id = values[sample_index].trim();
            if sample_id.is_empty() {
                return Err(IngestError::MissingSampleId { line });
            }
            let single_cell = resolution_index
                .and_then(|index| values.get(index))
                .is_some_and(|value| value.trim() == SINGLE_CELL);
            if single_cell && !has_protocol {
                return Err(IngestError::MissingProtocol);
            }
            match by_sample.get(sample_id) {
                Some(&slot) => groups[slot].1 += 1,
                None => {
                    by_sample.insert(sample_id.to_string(), groups.len());
                    groups.push((values, 1));
                }
            }
        }

        if groups.is_empty() {
            return Err(IngestError::NoValidRecords);
        }

        let mut records = Vec::with_capacity(groups.len());
        let mut cells = 0usize;
        for (values, count) in groups {
            cells += count;
            let cell = |column: &str| {
                headers
                    .position(column)
                    .and_then(|index| values.get(index))
                    .map(|value| value.trim().to_string())
            };
            let protocol = match cell(columns::PROTOCOL).filter(|value| !value.is_empty()) {
                Some(value) => Some(value.parse::<Protocol>()?.as_str().to_string()),
                None => None,
            };
            records.push(SampleBatchRecord {
                id: None,
                rev: None,
                meta: RecordMeta {
                    filename: filename.to_string(),
                    created_at: created_at.to_string(),
                },
                source_columns: SourceColumns {
                    organ: cell(columns::ORGAN),
                    gender: cell(columns::GENDER),
                    sample_id: values[sample_index].trim().to_string(),
                    patient_id: cell(columns::PATIENT_ID),
                    protocol,
                    standardized_species: cell(columns::STANDARDIZED_SPECIES),
                    cellular_resolution: cell(columns::CELLULAR_RESOLUTION),
                    disorder: cell(columns::DISORDER),
                    age: cell(columns::AGE),
                    sequence_type: cell(columns::SEQUENCE_TYPE),
                    batch: cell(columns::BATCH),
                    cell_number: count,
                },
            });
        }

        debug!(
            records = records.len(),
            cells,
            skipped_rows,
            "grouped samples"
        );
        Ok(GroupedUpload {
            report: GroupingReport {
                filename: filename.to_string(),
                records: records.len(),
                cells,
                skipped_rows,
                chunks_written: 0,
            },
            records,
        })
    }

    /// Writes records in chunks; returns the number of chunks sent.
    pub fn persist<S: RowStore + ?Sized>(
        &self,
        store: &S,
        records: &[SampleBatchRecord],
    ) -> Result<usize, IngestError> {
        let mut chunks = 0usize;
        for chunk in records.chunks(self.chunk_size) {
            store.bulk_add(chunk)?;
            chunks += 1;
        }
        info!(records = records.len(), chunks, "stored sample records");
        Ok(chunks)
    }
}
