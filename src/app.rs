use std::time::{Duration, Instant};

use camino::Utf8Path;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::config::IngestSettings;
use crate::domain::{Delimiter, UploadFilename};
use crate::error::IngestError;
use crate::export::{FileSummary, export_tsv, summarize};
use crate::graph::{GraphBuilder, GraphReport};
use crate::grouper::{GroupingReport, SampleGrouper};
use crate::registry::Registry;
use crate::row_store::RowStore;
use crate::table::Table;

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub delimiter: Option<Delimiter>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub filename: String,
    pub dry_run: bool,
    pub grouping: GroupingReport,
    pub graph: GraphReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub filename: String,
    pub records: usize,
    pub tsv: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub uploads: Vec<FileSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResult {
    pub filename: String,
    pub deleted: usize,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Both pipeline stages plus the stored-metadata views, wired to one registry
/// and one row store.
pub struct App<R: Registry, S: RowStore> {
    registry: R,
    store: S,
    settings: IngestSettings,
    cache_lookups: bool,
}

impl<R: Registry, S: RowStore> App<R, S> {
    pub fn new(registry: R, store: S, settings: IngestSettings, cache_lookups: bool) -> Self {
        Self {
            registry,
            store,
            settings,
            cache_lookups,
        }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Groups and stores the sample records, then builds the resource graph.
    pub fn upload(
        &self,
        path: &Utf8Path,
        options: &UploadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<UploadResult, IngestError> {
        let (filename, table) = self.read(path, options, sink)?;
        let grouping = self.group_table(&table, &filename, options, sink)?;
        let graph = self.graph_table(&table, &filename, sink)?;
        Ok(UploadResult {
            filename: filename.to_string(),
            dry_run: options.dry_run,
            grouping,
            graph,
        })
    }

    pub fn group(
        &self,
        path: &Utf8Path,
        options: &UploadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<GroupingReport, IngestError> {
        let (filename, table) = self.read(path, options, sink)?;
        self.group_table(&table, &filename, options, sink)
    }

    pub fn graph(
        &self,
        path: &Utf8Path,
        options: &UploadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<GraphReport, IngestError> {
        let (filename, table) = self.read(path, options, sink)?;
        self.graph_table(&table, &filename, sink)
    }

    pub fn export(&self, filename: &str, sink: &dyn ProgressSink) -> Result<ExportResult, IngestError> {
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; loading records for {filename}"),
            elapsed: None,
        });
        let records = self.store.find_by_filename(filename)?;
        if records.is_empty() {
            return Err(IngestError::MetadataNotFound(filename.to_string()));
        }
        Ok(ExportResult {
            filename: filename.to_string(),
            records: records.len(),
            tsv: export_tsv(&records)?,
        })
    }

    pub fn list(&self, sink: &dyn ProgressSink) -> Result<ListResult, IngestError> {
        sink.event(ProgressEvent {
            message: "phase=Resolve; scanning row store".to_string(),
            elapsed: None,
        });
        let mut uploads = Vec::new();
        for filename in self.store.filenames()? {
            let records = self.store.find_by_filename(&filename)?;
            uploads.push(summarize(&filename, &records));
        }
        Ok(ListResult { uploads })
    }

    pub fn info(&self, filename: &str, sink: &dyn ProgressSink) -> Result<FileSummary, IngestError> {
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; looking up {filename}"),
            elapsed: None,
        });
        let records = self.store.find_by_filename(filename)?;
        if records.is_empty() {
            return Err(IngestError::MetadataNotFound(filename.to_string()));
        }
        Ok(summarize(filename, &records))
    }

    pub fn delete(&self, filename: &str, sink: &dyn ProgressSink) -> Result<DeleteResult, IngestError> {
        sink.event(ProgressEvent {
            message: format!("phase=Store; deleting records for {filename}"),
            elapsed: None,
        });
        let deleted = self.store.delete_by_filename(filename)?;
        if deleted == 0 {
            return Err(IngestError::MetadataNotFound(filename.to_string()));
        }
        Ok(DeleteResult {
            filename: filename.to_string(),
            deleted,
        })
    }

    fn read(
        &self,
        path: &Utf8Path,
        options: &UploadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<(UploadFilename, Table), IngestError> {
        let filename: UploadFilename = path.as_str().parse()?;
        let started = Instant::now();
        let table = Table::read_path(path, options.delimiter.or(self.settings.delimiter))?;
        table.headers().validate()?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Parse; {filename}: {} rows, {} columns, {} separated",
                table.line_count(),
                table.headers().len(),
                table.delimiter()
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok((filename, table))
    }

    fn group_table(
        &self,
        table: &Table,
        filename: &UploadFilename,
        options: &UploadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<GroupingReport, IngestError> {
        let started = Instant::now();
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let grouper = SampleGrouper::new(self.settings.chunk_size);
        let grouped = grouper.group(table, filename, &created_at)?;
        let mut report = grouped.report;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Group; {} samples, {} cells",
                report.records, report.cells
            ),
            elapsed: Some(started.elapsed()),
        });
        if options.dry_run {
            return Ok(report);
        }
        let started = Instant::now();
        report.chunks_written = grouper.persist(&self.store, &grouped.records)?;
        sink.event(ProgressEvent {
            message: format!("phase=Store; {} chunk(s) written", report.chunks_written),
            elapsed: Some(started.elapsed()),
        });
        Ok(report)
    }

    fn graph_table(
        &self,
        table: &Table,
        filename: &UploadFilename,
        sink: &dyn ProgressSink,
    ) -> Result<GraphReport, IngestError> {
        let started = Instant::now();
        let report = GraphBuilder::new(&self.registry, self.cache_lookups)
            .with_default_batch(self.settings.default_batch.clone())
            .build(table, filename)?;
        let message = if report.already_ingested {
            format!("phase=Graph; {filename} already ingested")
        } else {
            format!(
                "phase=Graph; {} specimens, {} subjects, {} sequencing",
                report.specimens.created, report.subjects.created, report.sequencing.created
            )
        };
        sink.event(ProgressEvent {
            message,
            elapsed: Some(started.elapsed()),
        });
        Ok(report)
    }
}
