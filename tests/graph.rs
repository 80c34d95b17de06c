use std::sync::Mutex;

use assert_matches::assert_matches;

use kira_sample_graph::domain::{Gender, UploadFilename};
use kira_sample_graph::error::IngestError;
use kira_sample_graph::graph::GraphBuilder;
use kira_sample_graph::registry::{MemoryRegistry, Registry};
use kira_sample_graph::resource::{Resource, ResourceKind};
use kira_sample_graph::table::Table;

const BASE: &str = "sample_id,organ,sequenceType,batch,cellularResolution,standardized_species,disorder";

fn sheet(columns: &str, rows: &[&str]) -> Table {
    let mut text = columns.replace(',', "\t");
    text.push('\n');
    for row in rows {
        text.push_str(&row.replace(',', "\t"));
        text.push('\n');
    }
    Table::parse(&text, None)
}

fn filename() -> UploadFilename {
    "f.csv".parse().unwrap()
}

fn officials(registry: &MemoryRegistry, kind: ResourceKind) -> Vec<String> {
    registry
        .resources(kind)
        .iter()
        .filter_map(|resource| resource.official().map(str::to_string))
        .collect()
}

#[test]
fn duplicate_rows_build_one_of_each() {
    let registry = MemoryRegistry::new();
    let table = sheet(
        BASE,
        &[
            "S1,liver,RNA,B1,Bulk,Homo sapiens,healthy",
            "S1,liver,RNA,B1,Bulk,Homo sapiens,healthy",
        ],
    );

    let report = GraphBuilder::new(&registry, true)
        .build(&table, &filename())
        .unwrap();

    assert_eq!(officials(&registry, ResourceKind::Specimen), vec!["S1"]);
    assert_eq!(officials(&registry, ResourceKind::Batch), vec!["B1"]);
    assert_eq!(officials(&registry, ResourceKind::Sequencing), vec!["B1_RNA"]);
    assert!(registry.resources(ResourceKind::Subject).is_empty());

    let batches = registry.resources(ResourceKind::Batch);
    assert_matches!(&batches[0], Resource::Batch(batch) => {
        assert_eq!(batch.member.len(), 1);
        assert!(batch.has_member("S1"));
    });
    assert_eq!(report.rows, 2);
    assert_eq!(report.skipped_rows, 1);
    assert_eq!(report.specimens.created, 1);
    assert_eq!(report.batches.created, 1);
    assert_eq!(report.organs, vec!["liver"]);
}

#[test]
fn batch_collects_distinct_specimens() {
    let registry = MemoryRegistry::new();
    let table = sheet(
        BASE,
        &[
            "S1,liver,RNA,B1,Bulk,Homo sapiens,healthy",
            "S2,lung,RNA,B1,Bulk,Homo sapiens,healthy",
        ],
    );
    let report = GraphBuilder::new(&registry, true)
        .build(&table, &filename())
        .unwrap();

    let batches = registry.resources(ResourceKind::Batch);
    assert_eq!(batches.len(), 1);
    assert_matches!(&batches[0], Resource::Batch(batch) => {
        assert!(batch.has_member("S1"));
        assert!(batch.has_member("S2"));
    });
    assert_eq!(report.batches.created, 1);
    assert_eq!(report.batches.updated, 1);
    assert_eq!(officials(&registry, ResourceKind::Sequencing), vec!["B1_RNA"]);
    assert_eq!(report.organs, vec!["liver", "lung"]);
}

#[test]
fn second_run_on_same_file_is_a_no_op() {
    let registry = MemoryRegistry::new();
    let table = sheet(BASE, &["S1,liver,RNA,B1,Bulk,Homo sapiens,healthy"]);
    GraphBuilder::new(&registry, true)
        .build(&table, &filename())
        .unwrap();
    let before = registry.calls();

    let report = GraphBuilder::new(&registry, true)
        .build(&table, &filename())
        .unwrap();

    assert!(report.already_ingested);
    let after = registry.calls();
    assert_eq!(after.creates, before.creates);
    assert_eq!(after.updates, before.updates);
    assert_eq!(after.searches, before.searches + 1);
}

#[test]
fn missing_batch_column_uses_default_batch() {
    let registry = MemoryRegistry::new();
    let table = sheet(
        "sample_id,organ,sequenceType,cellularResolution,standardized_species,disorder",
        &["S1,liver,RNA,Bulk,Homo sapiens,healthy"],
    );
    GraphBuilder::new(&registry, true)
        .build(&table, &filename())
        .unwrap();
    assert_eq!(officials(&registry, ResourceKind::Batch), vec!["Default_Batch"]);
    assert_eq!(
        officials(&registry, ResourceKind::Sequencing),
        vec!["Default_Batch_RNA"]
    );
}

#[test]
fn unknown_sample_builds_no_specimen_but_subject_is_independent() {
    let registry = MemoryRegistry::new();
    let columns = format!("{BASE},patient_id,gender,age");
    let table = sheet(
        &columns,
        &[
            "Unknown,liver,RNA,B1,Bulk,Homo sapiens,healthy,P1,F,42",
            "unknown,liver,RNA,B1,Bulk,Homo sapiens,healthy,Unknown,M,40",
        ],
    );
    let report = GraphBuilder::new(&registry, true)
        .build(&table, &filename())
        .unwrap();

    assert!(registry.resources(ResourceKind::Specimen).is_empty());
    assert!(registry.resources(ResourceKind::Batch).is_empty());
    assert!(registry.resources(ResourceKind::Sequencing).is_empty());
    assert_eq!(officials(&registry, ResourceKind::Subject), vec!["P1"]);
    assert_eq!(report.subjects.created, 1);

    let subjects = registry.resources(ResourceKind::Subject);
    assert_matches!(&subjects[0], Resource::Subject(subject) => {
        assert_eq!(subject.gender, Some(Gender::Female));
        assert_eq!(subject.extension.len(), 2);
    });
}

#[test]
fn specimen_links_batch_and_contains_subject() {
    let registry = MemoryRegistry::new();
    let columns = format!("{BASE},patient_id,protocol");
    let table = sheet(
        &columns,
        &["S 1!,liver,RNA,B1,Single Cell,Homo sapiens,healthy,P 7,10XV3"],
    );
    GraphBuilder::new(&registry, true)
        .build(&table, &filename())
        .unwrap();

    let batch_id = registry.resources(ResourceKind::Batch)[0]
        .id()
        .unwrap()
        .to_string();
    let specimens = registry.resources(ResourceKind::Specimen);
    assert_matches!(&specimens[0], Resource::Specimen(specimen) => {
        assert_eq!(specimens[0].official(), Some("S_1"));
        assert_eq!(specimens[0].accession(), Some("f.csv"));
        let batch_ref = specimen.extension[0].value_reference.as_ref().unwrap();
        assert_eq!(batch_ref.reference.as_deref(), Some(format!("Group/{batch_id}").as_str()));
        assert_eq!(
            specimen.subject.as_ref().and_then(|reference| reference.reference.as_deref()),
            Some("#P_7")
        );
        assert_eq!(specimen.contained.len(), 1);
        let collection = specimen.collection.as_ref().unwrap();
        assert_eq!(collection.method.as_ref().and_then(|m| m.code()), Some("10XV3"));
        assert_eq!(collection.body_site.as_ref().and_then(|b| b.code()), Some("liver"));
        assert_eq!(specimen.condition[0].code(), Some("healthy"));
    });

    let sequencing = registry.resources(ResourceKind::Sequencing);
    assert_matches!(&sequencing[0], Resource::Sequencing(resource) => {
        assert_eq!(resource.sequence_type.as_deref(), Some("rna"));
        assert_eq!(resource.extension[0].value_codeable_concept.as_ref().and_then(|c| c.code()), Some("Single Cell"));
    });
}

#[test]
fn specimen_id_that_sanitizes_to_empty_aborts() {
    let registry = MemoryRegistry::new();
    let table = sheet(BASE, &["!!!,liver,RNA,B1,Bulk,Homo sapiens,healthy"]);
    let err = GraphBuilder::new(&registry, true)
        .build(&table, &filename())
        .unwrap_err();
    assert_matches!(err, IngestError::UnresolvableSpecimenId { line: 2 });
    assert!(registry.resources(ResourceKind::Specimen).is_empty());
}

#[test]
fn missing_required_header_touches_nothing() {
    let registry = MemoryRegistry::new();
    let table = sheet(
        "sample_id,sequenceType,batch,cellularResolution,standardized_species,disorder",
        &["S1,RNA,B1,Bulk,Homo sapiens,healthy"],
    );
    let err = GraphBuilder::new(&registry, true)
        .build(&table, &filename())
        .unwrap_err();
    assert_matches!(err, IngestError::MissingHeaders(_));
    assert_eq!(registry.calls().searches, 0);
}

#[test]
fn same_batch_and_type_across_samples_shares_sequencing() {
    let registry = MemoryRegistry::new();
    let table = sheet(
        BASE,
        &[
            "S1,liver,RNA,B1,Bulk,Homo sapiens,healthy",
            "S2,liver,RNA,B1,Bulk,Homo sapiens,healthy",
            "S3,liver,ATAC,B1,Bulk,Homo sapiens,healthy",
            "S4,liver,RNA,B2,Bulk,Homo sapiens,healthy",
        ],
    );
    let report = GraphBuilder::new(&registry, true)
        .build(&table, &filename())
        .unwrap();
    let mut sequencing = officials(&registry, ResourceKind::Sequencing);
    sequencing.sort();
    assert_eq!(sequencing, vec!["B1_ATAC", "B1_RNA", "B2_RNA"]);
    assert_eq!(report.sequencing.created, 3);
}

#[test]
fn uncached_lookups_give_the_same_graph() {
    let cached = MemoryRegistry::new();
    let uncached = MemoryRegistry::new();
    let table = sheet(
        BASE,
        &[
            "S1,liver,RNA,B1,Bulk,Homo sapiens,healthy",
            "S2,liver,RNA,B1,Bulk,Homo sapiens,healthy",
        ],
    );
    GraphBuilder::new(&cached, true)
        .build(&table, &filename())
        .unwrap();
    GraphBuilder::new(&uncached, false)
        .build(&table, &filename())
        .unwrap();

    for kind in [
        ResourceKind::Specimen,
        ResourceKind::Batch,
        ResourceKind::Sequencing,
    ] {
        assert_eq!(officials(&cached, kind), officials(&uncached, kind));
    }
    assert!(uncached.calls().searches > cached.calls().searches);
}

#[test]
fn existing_specimen_from_previous_partial_run_is_reused() {
    let registry = MemoryRegistry::new();
    let partial = sheet(BASE, &["S1,liver,,B1,Bulk,Homo sapiens,healthy"]);
    GraphBuilder::new(&registry, true)
        .build(&partial, &filename())
        .unwrap();

    let full = sheet(BASE, &["S1,liver,RNA,B1,Bulk,Homo sapiens,healthy"]);
    let report = GraphBuilder::new(&registry, true)
        .build(&full, &filename())
        .unwrap();

    assert_eq!(report.specimens.created, 0);
    assert_eq!(report.specimens.existing, 1);
    assert_eq!(report.batches.updated, 1);
    assert_eq!(registry.resources(ResourceKind::Specimen).len(), 1);
}

#[test]
fn rerun_after_partial_run_keeps_earlier_batch_members() {
    let registry = MemoryRegistry::new();
    let partial = sheet(BASE, &["S1,liver,,B1,Bulk,Homo sapiens,healthy"]);
    GraphBuilder::new(&registry, true)
        .build(&partial, &filename())
        .unwrap();

    let rest = sheet(BASE, &["S2,liver,RNA,B1,Bulk,Homo sapiens,healthy"]);
    let report = GraphBuilder::new(&registry, false)
        .build(&rest, &filename())
        .unwrap();

    assert_eq!(report.batches.updated, 1);
    let batches = registry.resources(ResourceKind::Batch);
    assert_eq!(batches.len(), 1);
    assert_matches!(&batches[0], Resource::Batch(batch) => {
        assert_eq!(batch.member.len(), 2);
        assert!(batch.has_member("S1"));
        assert!(batch.has_member("S2"));
    });
    assert_eq!(registry.resources(ResourceKind::Specimen).len(), 2);
}

#[test]
fn specimen_stays_in_its_first_batch() {
    let registry = MemoryRegistry::new();
    let table = sheet(
        BASE,
        &[
            "S1,liver,RNA,B1,Bulk,Homo sapiens,healthy",
            "S1,liver,RNA,B2,Bulk,Homo sapiens,healthy",
        ],
    );
    let report = GraphBuilder::new(&registry, true)
        .build(&table, &filename())
        .unwrap();

    assert_eq!(officials(&registry, ResourceKind::Batch), vec!["B1"]);
    assert_eq!(officials(&registry, ResourceKind::Sequencing), vec!["B1_RNA"]);
    assert_eq!(report.skipped_rows, 1);

    let batch_id = registry.resources(ResourceKind::Batch)[0]
        .id()
        .unwrap()
        .to_string();
    let specimens = registry.resources(ResourceKind::Specimen);
    assert_matches!(&specimens[0], Resource::Specimen(specimen) => {
        let batch_ref = specimen.extension[0].value_reference.as_ref().unwrap();
        assert_eq!(batch_ref.reference.as_deref(), Some(format!("Group/{batch_id}").as_str()));
    });
}

#[test]
fn unknown_sequence_type_leaves_type_unset() {
    let registry = MemoryRegistry::new();
    let table = sheet(BASE, &["S1,liver,ATAC,B1,Bulk,Homo sapiens,healthy"]);
    GraphBuilder::new(&registry, true)
        .build(&table, &filename())
        .unwrap();
    let sequencing = registry.resources(ResourceKind::Sequencing);
    assert_matches!(&sequencing[0], Resource::Sequencing(resource) => {
        assert_eq!(resource.sequence_type, None);
    });
    assert_eq!(sequencing[0].official(), Some("B1_ATAC"));
}

/// Registry whose writes always fail, to show that errors surface unchanged.
struct FailingRegistry {
    searches: Mutex<usize>,
}

impl Registry for FailingRegistry {
    fn search(&self, _kind: ResourceKind, _identifier: &str) -> Result<Vec<Resource>, IngestError> {
        *self.searches.lock().unwrap() += 1;
        Ok(Vec::new())
    }

    fn create(&self, _resource: &Resource) -> Result<String, IngestError> {
        Err(IngestError::RegistryStatus {
            status: 503,
            message: "unavailable".to_string(),
        })
    }

    fn update(&self, _resource: &Resource) -> Result<String, IngestError> {
        Err(IngestError::RegistryHttp("unreachable".to_string()))
    }
}

#[test]
fn registry_failures_propagate() {
    let registry = FailingRegistry {
        searches: Mutex::new(0),
    };
    let table = sheet(BASE, &["S1,liver,RNA,B1,Bulk,Homo sapiens,healthy"]);
    let err = GraphBuilder::new(&registry, true)
        .build(&table, &filename())
        .unwrap_err();
    assert_matches!(err, IngestError::RegistryStatus { status: 503, .. });
    assert!(err.is_collaborator());
    assert_eq!(*registry.searches.lock().unwrap(), 2);
}
