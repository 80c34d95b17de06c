use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::app::{DeleteResult, ExportResult, ListResult, ProgressEvent, ProgressSink, UploadResult};
use crate::export::FileSummary;
use crate::graph::GraphReport;
use crate::grouper::GroupingReport;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_upload(result: &UploadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_grouping(result: &GroupingReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_graph(result: &GraphReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_export(result: &ExportResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_info(result: &FileSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_delete(result: &DeleteResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress reported through `tracing` for interactive runs.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
