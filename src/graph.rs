//! Builds the Subject / Specimen / Batch / Sequencing graph of one upload
//! and submits it through the identity resolver.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{DEFAULT_BATCH, Gender, UNKNOWN, UploadFilename, columns};
use crate::error::IngestError;
use crate::registry::Registry;
use crate::resolver::{IdentityResolver, Resolution, Upsert};
use crate::resource::{
    AGE_EXTENSION_URL, BATCH_EXTENSION_URL, Batch, CELLULAR_RESOLUTION_EXTENSION_URL,
    CodeableConcept, Extension, Identifier, IdentifierKind, Reference, Resource, ResourceKind,
    SPECIES_EXTENSION_URL, SequencingResource, Specimen, SpecimenCollection, Subject,
    identifier_value, sequence_type_code,
};
use crate::sanitize::sanitize_id;
use crate::table::{Headers, RowRecord, Table};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub created: usize,
    pub existing: usize,
}

impl KindCounts {
    fn record(&mut self, resolution: &Resolution) {
        match resolution {
            Resolution::Created(_) => self.created += 1,
            Resolution::Existing(_) => self.existing += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub created: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphReport {
    pub filename: String,
    pub already_ingested: bool,
    pub rows: usize,
    pub skipped_rows: usize,
    pub subjects: KindCounts,
    pub specimens: KindCounts,
    pub batches: BatchCounts,
    pub sequencing: KindCounts,
    pub organs: Vec<String>,
}

/// Why a row did not yield a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchSkip {
    AlreadyMember,
    /// The specimen was enrolled in another batch on an earlier row.
    InOtherBatch(String),
}

/// Per-upload working set. Nothing here outlives one call to
/// [`GraphBuilder::build`].
#[derive(Debug)]
pub struct UploadContext {
    filename: UploadFilename,
    headers: Headers,
    subjects: Vec<Subject>,
    specimens: Vec<Specimen>,
    batches: Vec<Batch>,
    batch_of: HashMap<String, usize>,
    sequencing: Vec<SequencingResource>,
    sequencing_ids: HashSet<String>,
    organs: Vec<String>,
    report: GraphReport,
}

impl UploadContext {
    pub fn new(filename: UploadFilename, headers: Headers) -> Self {
        let report = GraphReport {
            filename: filename.to_string(),
            ..GraphReport::default()
        };
        Self {
            filename,
            headers,
            subjects: Vec::new(),
            specimens: Vec::new(),
            batches: Vec::new(),
            batch_of: HashMap::new(),
            sequencing: Vec::new(),
            sequencing_ids: HashSet::new(),
            organs: Vec::new(),
            report,
        }
    }

    pub fn filename(&self) -> &UploadFilename {
        &self.filename
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    pub fn specimens(&self) -> &[Specimen] {
        &self.specimens
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn sequencing(&self) -> &[SequencingResource] {
        &self.sequencing
    }

    pub fn organs(&self) -> &[String] {
        &self.organs
    }

    fn add_subject(&mut self, subject: &Subject) {
        let official = official_of(&subject.identifier);
        if official.is_none_or(str::is_empty) {
            return;
        }
        if self
            .subjects
            .iter()
            .any(|known| official_of(&known.identifier) == official)
        {
            return;
        }
        self.subjects.push(subject.clone());
    }

    fn add_specimen(&mut self, specimen: Specimen) {
        let official = official_of(&specimen.identifier);
        if self
            .specimens
            .iter()
            .any(|known| official_of(&known.identifier) == official)
        {
            debug!(specimen = ?official, "specimen already accumulated");
            return;
        }
        self.specimens.push(specimen);
    }

    fn add_organ(&mut self, organ: &str) {
        if !self.organs.iter().any(|known| known == organ) {
            self.organs.push(organ.to_string());
        }
    }

    /// Finds or opens the batch for `key` and enrolls the specimen. Returns the
    /// batch's slot, or why the row yields no batch. A specimen belongs to one
    /// batch only.
    pub fn attach_to_batch(
        &mut self,
        key: &str,
        specimen_official: &Identifier,
    ) -> Result<usize, BatchSkip> {
        if let Some(&enrolled) = self.batch_of.get(&specimen_official.value) {
            let batch = &self.batches[enrolled];
            return match official_of(&batch.identifier) {
                Some(official) if official == key => Err(BatchSkip::AlreadyMember),
                official => Err(BatchSkip::InOtherBatch(
                    official.unwrap_or_default().to_string(),
                )),
            };
        }
        let filename = self.filename.as_str();
        let slot = self.batches.iter().position(|batch| {
            identifier_value(&batch.identifier, IdentifierKind::Accession) == Some(filename)
                && official_of(&batch.identifier) == Some(key)
        });
        match slot {
            Some(slot) => {
                let batch = &mut self.batches[slot];
                if batch.has_member(&specimen_official.value) {
                    return Err(BatchSkip::AlreadyMember);
                }
                batch.add_member(specimen_official.clone());
                self.batch_of.insert(specimen_official.value.clone(), slot);
                Ok(slot)
            }
            None => {
                let mut batch = Batch::new(filename, key, columns::BATCH);
                batch.add_member(specimen_official.clone());
                self.batches.push(batch);
                let slot = self.batches.len() - 1;
                self.batch_of.insert(specimen_official.value.clone(), slot);
                Ok(slot)
            }
        }
    }
}

pub struct GraphBuilder<'r, R: Registry + ?Sized> {
    resolver: IdentityResolver<'r, R>,
    default_batch: String,
}

impl<'r, R: Registry + ?Sized> GraphBuilder<'r, R> {
    pub fn new(registry: &'r R, cache_lookups: bool) -> Self {
        Self {
            resolver: IdentityResolver::new(registry, cache_lookups),
            default_batch: DEFAULT_BATCH.to_string(),
        }
    }

    pub fn with_default_batch(mut self, key: impl Into<String>) -> Self {
        self.default_batch = key.into();
        self
    }

    /// Builds and submits the graph for one upload. A file whose sequencing
    /// resources are already registered is left untouched.
    pub fn build(
        &mut self,
        table: &Table,
        filename: &UploadFilename,
    ) -> Result<GraphReport, IngestError> {
        table.headers().validate()?;

        let existing = self
            .resolver
            .by_accession(ResourceKind::Sequencing, filename.as_str())?;
        if !existing.is_empty() {
            info!(%filename, sequencing = existing.len(), "upload already ingested, skipping");
            return Ok(GraphReport {
                filename: filename.to_string(),
                already_ingested: true,
                ..GraphReport::default()
            });
        }

        let mut context = UploadContext::new(filename.clone(), table.headers().clone());
        for row in table.records() {
            context.report.rows += 1;
            self.process_row(&mut context, &row)?;
        }
        self.submit(context)
    }

    fn process_row(
        &mut self,
        context: &mut UploadContext,
        row: &RowRecord<'_>,
    ) -> Result<(), IngestError> {
        let filename = context.filename.to_string();
        let subject = build_subject(&filename, row);
        if let Some(subject) = &subject {
            context.add_subject(subject);
        }

        let Some(sample) = row
            .get(columns::SAMPLE_ID)
            .filter(|value| !value.trim().eq_ignore_ascii_case(UNKNOWN))
        else {
            debug!(line = row.line(), "no sample on row, specimen not built");
            return Ok(());
        };

        let mut specimen = build_specimen(&filename, row, sample)?;
        if let Some(organ) = cell(row, columns::ORGAN) {
            context.add_organ(organ);
        }
        let specimen_official = specimen
            .identifier
            .iter()
            .find(|identifier| identifier.kind == IdentifierKind::Official)
            .cloned()
            .ok_or(IngestError::UnresolvableSpecimenId { line: row.line() })?;

        let batch_key = cell(row, columns::BATCH)
            .map(str::to_string)
            .unwrap_or_else(|| self.default_batch.clone());
        let slot = match context.attach_to_batch(&batch_key, &specimen_official) {
            Ok(slot) => slot,
            Err(BatchSkip::AlreadyMember) => {
                debug!(
                    line = row.line(),
                    batch = %batch_key,
                    specimen = %specimen_official.value,
                    "specimen already in batch, row skipped"
                );
                context.report.skipped_rows += 1;
                return Ok(());
            }
            Err(BatchSkip::InOtherBatch(enrolled)) => {
                warn!(
                    line = row.line(),
                    batch = %batch_key,
                    enrolled = %enrolled,
                    specimen = %specimen_official.value,
                    "specimen already enrolled in another batch, row skipped"
                );
                context.report.skipped_rows += 1;
                return Ok(());
            }
        };

        let upsert = self
            .resolver
            .upsert(Resource::Batch(context.batches[slot].clone()))
            .map_err(|err| match err {
                IngestError::RegistryPayload(reason) => IngestError::BatchResolution {
                    batch: batch_key.clone(),
                    reason,
                },
                other => other,
            })?;
        match &upsert {
            Upsert::Created(_) => context.report.batches.created += 1,
            Upsert::Updated(_) => context.report.batches.updated += 1,
        }
        let batch_id = upsert.id().to_string();
        context.batches[slot].id = Some(batch_id.clone());

        if let Some(sequence_type) = cell(row, columns::SEQUENCE_TYPE) {
            let official = format!("{batch_key}_{sequence_type}");
            let known = context.sequencing_ids.contains(&official)
                || context.sequencing.iter().any(|sequencing| {
                    identifier_value(&sequencing.identifier, IdentifierKind::Accession)
                        == Some(filename.as_str())
                        && official_of(&sequencing.identifier) == Some(official.as_str())
                });
            if !known {
                let extension = cell(row, columns::CELLULAR_RESOLUTION)
                    .map(|value| {
                        Extension::coded(
                            CELLULAR_RESOLUTION_EXTENSION_URL,
                            CodeableConcept::from_cell(columns::CELLULAR_RESOLUTION, value),
                        )
                    })
                    .into_iter()
                    .collect();
                context.sequencing_ids.insert(official.clone());
                context.sequencing.push(SequencingResource {
                    id: None,
                    identifier: vec![
                        Identifier::accession(filename.as_str()),
                        Identifier::official(official, columns::SEQUENCE_TYPE),
                    ],
                    sequence_type: sequence_type_code(sequence_type).map(str::to_string),
                    subject: Some(Reference::to_resource(ResourceKind::Batch, &batch_id)),
                    extension,
                });
            }
        }

        specimen.extension.push(Extension::reference(
            BATCH_EXTENSION_URL,
            Reference::to_resource(ResourceKind::Batch, &batch_id),
        ));
        if let Some(mut subject) = subject {
            if let Some(key) = official_of(&subject.identifier).map(str::to_string) {
                specimen.subject = Some(Reference::contained(ResourceKind::Subject, &key));
                subject.id = Some(key);
                specimen.contained.push(Resource::Subject(subject));
            }
        }
        context.add_specimen(specimen);
        Ok(())
    }

    fn submit(&mut self, mut context: UploadContext) -> Result<GraphReport, IngestError> {
        for specimen in std::mem::take(&mut context.specimens) {
            let resolution = self.resolver.create_if_absent(Resource::Specimen(specimen))?;
            context.report.specimens.record(&resolution);
        }
        for subject in std::mem::take(&mut context.subjects) {
            let resolution = self.resolver.create_if_absent(Resource::Subject(subject))?;
            context.report.subjects.record(&resolution);
        }
        for sequencing in std::mem::take(&mut context.sequencing) {
            let resolution = self
                .resolver
                .create_if_absent(Resource::Sequencing(sequencing))?;
            context.report.sequencing.record(&resolution);
        }

        let mut report = context.report;
        report.organs = context.organs;
        info!(
            filename = %report.filename,
            rows = report.rows,
            specimens = report.specimens.created,
            subjects = report.subjects.created,
            sequencing = report.sequencing.created,
            batches_created = report.batches.created,
            batches_updated = report.batches.updated,
            "resource graph submitted"
        );
        Ok(report)
    }
}

/// Non-empty trimmed cell; `None` when the column is absent or blank.
fn cell<'a>(row: &'a RowRecord<'_>, column: &str) -> Option<&'a str> {
    row.get(column)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn official_of(identifiers: &[Identifier]) -> Option<&str> {
    identifier_value(identifiers, IdentifierKind::Official)
}

fn build_subject(filename: &str, row: &RowRecord<'_>) -> Option<Subject> {
    let raw = row.get(columns::PATIENT_ID)?;
    if raw.trim().eq_ignore_ascii_case(UNKNOWN) {
        return None;
    }
    let key = sanitize_id(raw);
    if key.is_empty() {
        debug!(line = row.line(), "patient id sanitizes to empty, subject skipped");
        return None;
    }
    let mut extension = Vec::new();
    if let Some(age) = cell(row, columns::AGE) {
        extension.push(Extension::coded(
            AGE_EXTENSION_URL,
            CodeableConcept::from_cell(columns::AGE, age),
        ));
    }
    if let Some(species) = cell(row, columns::STANDARDIZED_SPECIES) {
        extension.push(Extension::coded(
            SPECIES_EXTENSION_URL,
            CodeableConcept::from_cell(columns::STANDARDIZED_SPECIES, species),
        ));
    }
    Some(Subject {
        id: None,
        identifier: vec![
            Identifier::accession(filename),
            Identifier::official(key, columns::PATIENT_ID),
        ],
        gender: row.get(columns::GENDER).and_then(Gender::from_cell),
        extension,
    })
}

fn build_specimen(
    filename: &str,
    row: &RowRecord<'_>,
    sample: &str,
) -> Result<Specimen, IngestError> {
    let key = sanitize_id(sample);
    if key.is_empty() {
        return Err(IngestError::UnresolvableSpecimenId { line: row.line() });
    }
    let collection = SpecimenCollection {
        method: cell(row, columns::PROTOCOL)
            .map(|value| CodeableConcept::from_cell(columns::PROTOCOL, value)),
        body_site: cell(row, columns::ORGAN)
            .map(|value| CodeableConcept::from_cell(columns::ORGAN, value)),
    };
    let has_collection = collection.method.is_some() || collection.body_site.is_some();
    Ok(Specimen {
        id: None,
        identifier: vec![
            Identifier::accession(filename),
            Identifier::official(key, columns::SAMPLE_ID),
        ],
        subject: None,
        collection: has_collection.then_some(collection),
        condition: cell(row, columns::DISORDER)
            .map(|value| CodeableConcept::from_cell(columns::DISORDER, value))
            .into_iter()
            .collect(),
        extension: Vec::new(),
        contained: Vec::new(),
    })
}
