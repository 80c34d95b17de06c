use std::sync::Mutex;

use assert_matches::assert_matches;

use kira_sample_graph::domain::UploadFilename;
use kira_sample_graph::error::IngestError;
use kira_sample_graph::grouper::{SampleBatchRecord, SampleGrouper};
use kira_sample_graph::row_store::RowStore;
use kira_sample_graph::table::Table;

const CREATED_AT: &str = "2024-05-01T10:00:00.000Z";

#[derive(Default)]
struct RecordingStore {
    chunks: Mutex<Vec<usize>>,
}

impl RowStore for RecordingStore {
    fn bulk_add(&self, records: &[SampleBatchRecord]) -> Result<(), IngestError> {
        self.chunks.lock().unwrap().push(records.len());
        Ok(())
    }

    fn find_by_filename(&self, _filename: &str) -> Result<Vec<SampleBatchRecord>, IngestError> {
        Ok(Vec::new())
    }

    fn delete_by_filename(&self, _filename: &str) -> Result<usize, IngestError> {
        Ok(0)
    }

    fn filenames(&self) -> Result<Vec<String>, IngestError> {
        Ok(Vec::new())
    }
}

fn filename() -> UploadFilename {
    "f.csv".parse().unwrap()
}

fn sheet(columns: &str, rows: &[&str]) -> Table {
    let mut text = columns.replace(',', "\t");
    text.push('\n');
    for row in rows {
        text.push_str(&row.replace(',', "\t"));
        text.push('\n');
    }
    Table::parse(&text, None)
}

const BASE: &str = "sample_id,organ,sequenceType,batch,cellularResolution,standardized_species,disorder";

#[test]
fn rows_of_one_sample_collapse_into_one_record() {
    let table = sheet(
        BASE,
        &[
            "S1,liver,RNA,B1,Bulk,Homo sapiens,healthy",
            "S1,liver,RNA,B1,Bulk,Homo sapiens,healthy",
            "S2,lung,RNA,B1,Bulk,Homo sapiens,asthma",
            "S1,liver,RNA,B1,Bulk,Homo sapiens,healthy",
        ],
    );
    let grouped = SampleGrouper::default()
        .group(&table, &filename(), CREATED_AT)
        .unwrap();

    assert_eq!(grouped.records.len(), 2);
    assert_eq!(grouped.records[0].sample_id(), "S1");
    assert_eq!(grouped.records[0].cell_count(), 3);
    assert_eq!(grouped.records[1].sample_id(), "S2");
    assert_eq!(grouped.records[1].cell_count(), 1);
    assert_eq!(grouped.records[1].source_columns.organ.as_deref(), Some("lung"));
    assert!(grouped.records[0].source_columns.patient_id.is_none());
    assert!(
        grouped
            .records
            .iter()
            .all(|record| record.meta.created_at == CREATED_AT && record.filename() == "f.csv")
    );
    assert_eq!(grouped.report.cells, 4);
}

#[test]
fn two_identical_rows_count_two_cells() {
    let table = sheet(
        BASE,
        &[
            "S1,liver,RNA,B1,Bulk,Homo sapiens,healthy",
            "S1,liver,RNA,B1,Bulk,Homo sapiens,healthy",
        ],
    );
    let grouped = SampleGrouper::default()
        .group(&table, &filename(), CREATED_AT)
        .unwrap();
    assert_eq!(grouped.records.len(), 1);
    assert_eq!(grouped.records[0].cell_count(), 2);
}

#[test]
fn marker_lines_do_not_count_as_cells() {
    let table = sheet(
        BASE,
        &[
            "TYPE,group,group,group,group,group,group",
            "S1,liver,RNA,B1,Bulk,Homo sapiens,healthy",
        ],
    );
    let grouped = SampleGrouper::default()
        .group(&table, &filename(), CREATED_AT)
        .unwrap();
    assert_eq!(grouped.records.len(), 1);
    assert_eq!(grouped.records[0].cell_count(), 1);
}

#[test]
fn missing_organ_header_fails_before_grouping() {
    let table = sheet(
        "sample_id,sequenceType,batch,cellularResolution,standardized_species,disorder",
        &["S1,RNA,B1,Bulk,Homo sapiens,healthy"],
    );
    let err = SampleGrouper::default()
        .group(&table, &filename(), CREATED_AT)
        .unwrap_err();
    assert_matches!(err, IngestError::MissingHeaders(missing) if missing == vec!["organ".to_string()]);
}

#[test]
fn single_cell_rows_require_protocol_column() {
    let table = sheet(BASE, &["S1,liver,RNA,B1,Single Cell,Homo sapiens,healthy"]);
    let err = SampleGrouper::default()
        .group(&table, &filename(), CREATED_AT)
        .unwrap_err();
    assert_matches!(err, IngestError::MissingProtocol);
}

#[test]
fn bulk_rows_may_omit_protocol() {
    let table = sheet(BASE, &["S1,liver,RNA,B1,Bulk,Homo sapiens,healthy"]);
    let grouped = SampleGrouper::default()
        .group(&table, &filename(), CREATED_AT)
        .unwrap();
    assert!(grouped.records[0].source_columns.protocol.is_none());
}

#[test]
fn protocol_values_are_normalized() {
    let columns = format!("{BASE},protocol");
    let table = sheet(
        &columns,
        &[
            "S1,liver,RNA,B1,Single Cell,Homo sapiens,healthy,10xv3",
            "S2,liver,RNA,B1,Single Cell,Homo sapiens,healthy,DROPSEQ",
        ],
    );
    let grouped = SampleGrouper::default()
        .group(&table, &filename(), CREATED_AT)
        .unwrap();
    assert_eq!(grouped.records[0].source_columns.protocol.as_deref(), Some("10XV3"));
    assert_eq!(grouped.records[1].source_columns.protocol.as_deref(), Some("dropseq"));

    let bad = sheet(&columns, &["S1,liver,RNA,B1,Single Cell,Homo sapiens,healthy,smartseq"]);
    assert_matches!(
        SampleGrouper::default().group(&bad, &filename(), CREATED_AT),
        Err(IngestError::InvalidProtocol(value)) if value == "smartseq"
    );
}

#[test]
fn empty_sample_id_names_the_line() {
    let table = sheet(
        BASE,
        &[
            "S1,liver,RNA,B1,Bulk,Homo sapiens,healthy",
            ",liver,RNA,B1,Bulk,Homo sapiens,healthy",
        ],
    );
    assert_matches!(
        SampleGrouper::default().group(&table, &filename(), CREATED_AT),
        Err(IngestError::MissingSampleId { line: 3 })
    );
}

#[test]
fn header_only_file_has_no_valid_records() {
    let table = sheet(BASE, &[]);
    assert_matches!(
        SampleGrouper::default().group(&table, &filename(), CREATED_AT),
        Err(IngestError::NoValidRecords)
    );
}

#[test]
fn persist_writes_in_chunks() {
    let rows = (0..5)
        .map(|index| format!("S{index},liver,RNA,B1,Bulk,Homo sapiens,healthy"))
        .collect::<Vec<_>>();
    let rows = rows.iter().map(String::as_str).collect::<Vec<_>>();
    let table = sheet(BASE, &rows);
    let grouper = SampleGrouper::new(2);
    let grouped = grouper.group(&table, &filename(), CREATED_AT).unwrap();

    let store = RecordingStore::default();
    let chunks = grouper.persist(&store, &grouped.records).unwrap();
    assert_eq!(chunks, 3);
    assert_eq!(*store.chunks.lock().unwrap(), vec![2, 2, 1]);
}
