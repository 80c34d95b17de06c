//! FHIR-shaped resources produced by the graph builder.
//!
//! Only the fields this pipeline writes or reads back are modelled. Every
//! durable resource carries exactly one OFFICIAL identifier (entity key) and
//! one ACCESSION identifier (upload filename).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::Gender;

pub const ACCESSION_CODE: &str = "ACSN";
pub const ACCESSION_TEXT: &str = "Accession ID";

pub const AGE_EXTENSION_URL: &str = "https://hl7.org/fhir/StructureDefinition/patient-birthTime";
pub const SPECIES_EXTENSION_URL: &str = "https://hl7.org/fhir/ValueSet/animal-species";
pub const BATCH_EXTENSION_URL: &str = "https://kira.bio/fhir/StructureDefinition/specimen-batch";
pub const CELLULAR_RESOLUTION_EXTENSION_URL: &str =
    "https://kira.bio/fhir/StructureDefinition/cellular-resolution";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Subject,
    Specimen,
    Batch,
    Sequencing,
}

impl ResourceKind {
    /// FHIR resource type used on the wire.
    pub fn resource_type(self) -> &'static str {
        match self {
            ResourceKind::Subject => "Patient",
            ResourceKind::Specimen => "Specimen",
            ResourceKind::Batch => "Group",
            ResourceKind::Sequencing => "MolecularSequence",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Subject => write!(f, "subject"),
            ResourceKind::Specimen => write!(f, "specimen"),
            ResourceKind::Batch => write!(f, "batch"),
            ResourceKind::Sequencing => write!(f, "sequencing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentifierKind {
    #[serde(rename = "official")]
    Official,
    #[serde(rename = "secondary")]
    Accession,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coding {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodeableConcept {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coding: Vec<Coding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl CodeableConcept {
    /// Coded cell value: code and display are the raw cell, text names the column.
    pub fn from_cell(column: &str, value: &str) -> Self {
        Self {
            coding: vec![Coding {
                code: value.to_string(),
                display: Some(value.to_string()),
            }],
            text: Some(column.to_string()),
        }
    }

    pub fn code(&self) -> Option<&str> {
        self.coding.first().map(|coding| coding.code.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "use")]
    pub kind: IdentifierKind,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_code: Option<CodeableConcept>,
    pub value: String,
}

impl Identifier {
    pub fn official(value: impl Into<String>, column: &str) -> Self {
        Self {
            kind: IdentifierKind::Official,
            type_code: Some(CodeableConcept {
                coding: Vec::new(),
                text: Some(column.to_string()),
            }),
            value: value.into(),
        }
    }

    pub fn accession(filename: impl Into<String>) -> Self {
        Self {
            kind: IdentifierKind::Accession,
            type_code: Some(CodeableConcept {
                coding: vec![Coding {
                    code: ACCESSION_CODE.to_string(),
                    display: None,
                }],
                text: Some(ACCESSION_TEXT.to_string()),
            }),
            value: filename.into(),
        }
    }

    pub fn display_code(&self) -> Option<&str> {
        self.type_code
            .as_ref()
            .and_then(|concept| concept.code().or(concept.text.as_deref()))
    }
}

pub fn identifier_value(identifiers: &[Identifier], kind: IdentifierKind) -> Option<&str> {
    identifiers
        .iter()
        .find(|identifier| identifier.kind == kind)
        .map(|identifier| identifier.value.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,
}

impl Reference {
    pub fn to_resource(kind: ResourceKind, id: &str) -> Self {
        Self {
            reference: Some(format!("{}/{id}", kind.resource_type())),
            kind: Some(kind.resource_type().to_string()),
            identifier: None,
        }
    }

    /// Logical reference for a resource that has no registry id yet.
    pub fn by_identifier(kind: ResourceKind, identifier: Identifier) -> Self {
        Self {
            reference: None,
            kind: Some(kind.resource_type().to_string()),
            identifier: Some(identifier),
        }
    }

    pub fn contained(kind: ResourceKind, local_id: &str) -> Self {
        Self {
            reference: Some(format!("#{local_id}")),
            kind: Some(kind.resource_type().to_string()),
            identifier: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_codeable_concept: Option<CodeableConcept>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_reference: Option<Reference>,
}

impl Extension {
    pub fn coded(url: &str, concept: CodeableConcept) -> Self {
        Self {
            url: url.to_string(),
            value_codeable_concept: Some(concept),
            value_reference: None,
        }
    }

    pub fn reference(url: &str, reference: Reference) -> Self {
        Self {
            url: url.to_string(),
            value_codeable_concept: None,
            value_reference: Some(reference),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub identifier: Vec<Identifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecimenCollection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<CodeableConcept>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_site: Option<CodeableConcept>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specimen {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub identifier: Vec<Identifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<SpecimenCollection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub condition: Vec<CodeableConcept>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contained: Vec<Resource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMember {
    pub entity: Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub identifier: Vec<Identifier>,
    #[serde(rename = "type", default = "specimen_group_type")]
    pub group_type: String,
    #[serde(default = "enumerated_membership")]
    pub membership: String,
    #[serde(default = "actual_group")]
    pub actual: bool,
    #[serde(default)]
    pub member: Vec<BatchMember>,
}

fn specimen_group_type() -> String {
    "specimen".to_string()
}

fn enumerated_membership() -> String {
    "enumerated".to_string()
}

fn actual_group() -> bool {
    true
}

impl Batch {
    pub fn new(filename: &str, key: &str, column: &str) -> Self {
        Self {
            id: None,
            identifier: vec![Identifier::accession(filename), Identifier::official(key, column)],
            group_type: specimen_group_type(),
            membership: enumerated_membership(),
            actual: true,
            member: Vec::new(),
        }
    }

    /// True when a member references a specimen with this OFFICIAL key.
    pub fn has_member(&self, specimen_key: &str) -> bool {
        self.member.iter().any(|member| {
            member
                .entity
                .identifier
                .as_ref()
                .is_some_and(|identifier| identifier.value == specimen_key)
        })
    }

    pub fn add_member(&mut self, specimen_official: Identifier) {
        self.member.push(BatchMember {
            entity: Reference::by_identifier(ResourceKind::Specimen, specimen_official),
        });
    }

    /// Rebuilds the member list as `held`'s members followed by this batch's
    /// members that `held` does not already list.
    pub fn merge_members(&mut self, held: &Batch) {
        let mut merged = held.member.clone();
        for member in self.member.drain(..) {
            let known = match &member.entity.identifier {
                Some(identifier) => held.has_member(&identifier.value),
                None => merged.contains(&member),
            };
            if !known {
                merged.push(member);
            }
        }
        self.member = merged;
    }
}

/// Maps a sheet's sequence type onto the `MolecularSequence.type` code set.
pub fn sequence_type_code(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "aa" => Some("aa"),
        "dna" => Some("dna"),
        "rna" => Some("rna"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencingResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub identifier: Vec<Identifier>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub sequence_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Reference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resourceType")]
pub enum Resource {
    #[serde(rename = "Patient")]
    Subject(Subject),
    Specimen(Specimen),
    #[serde(rename = "Group")]
    Batch(Batch),
    #[serde(rename = "MolecularSequence")]
    Sequencing(SequencingResource),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Subject(_) => ResourceKind::Subject,
            Resource::Specimen(_) => ResourceKind::Specimen,
            Resource::Batch(_) => ResourceKind::Batch,
            Resource::Sequencing(_) => ResourceKind::Sequencing,
        }
    }

    pub fn identifiers(&self) -> &[Identifier] {
        match self {
            Resource::Subject(subject) => &subject.identifier,
            Resource::Specimen(specimen) => &specimen.identifier,
            Resource::Batch(batch) => &batch.identifier,
            Resource::Sequencing(sequencing) => &sequencing.identifier,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Resource::Subject(subject) => subject.id.as_deref(),
            Resource::Specimen(specimen) => specimen.id.as_deref(),
            Resource::Batch(batch) => batch.id.as_deref(),
            Resource::Sequencing(sequencing) => sequencing.id.as_deref(),
        }
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        let id = Some(id.into());
        match self {
            Resource::Subject(subject) => subject.id = id,
            Resource::Specimen(specimen) => specimen.id = id,
            Resource::Batch(batch) => batch.id = id,
            Resource::Sequencing(sequencing) => sequencing.id = id,
        }
    }

    pub fn official(&self) -> Option<&str> {
        identifier_value(self.identifiers(), IdentifierKind::Official)
    }

    pub fn accession(&self) -> Option<&str> {
        identifier_value(self.identifiers(), IdentifierKind::Accession)
    }

    pub fn matches(&self, accession: &str, official: &str) -> bool {
        self.accession() == Some(accession) && self.official() == Some(official)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_serialize_with_fhir_resource_type() {
        let batch = Resource::Batch(Batch::new("f.csv", "B1", "batch"));
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["resourceType"], "Group");
        assert_eq!(json["type"], "specimen");
        assert_eq!(json["actual"], true);
        assert_eq!(json["identifier"][0]["use"], "secondary");
        assert_eq!(json["identifier"][0]["type"]["coding"][0]["code"], "ACSN");
        assert_eq!(json["identifier"][1]["use"], "official");
        assert_eq!(json["identifier"][1]["value"], "B1");
    }

    #[test]
    fn registry_payload_round_trips_identity() {
        let payload = serde_json::json!({
            "resourceType": "Patient",
            "id": "42",
            "identifier": [
                {"use": "secondary", "value": "f.csv"},
                {"use": "official", "value": "P1"}
            ],
            "gender": "female",
            "meta": {"versionId": "1"}
        });
        let resource: Resource = serde_json::from_value(payload).unwrap();
        assert_eq!(resource.kind(), ResourceKind::Subject);
        assert_eq!(resource.id(), Some("42"));
        assert!(resource.matches("f.csv", "P1"));
    }

    #[test]
    fn batch_membership_is_keyed_by_official_identifier() {
        let mut batch = Batch::new("f.csv", "B1", "batch");
        batch.add_member(Identifier::official("S1", "sample_id"));
        assert!(batch.has_member("S1"));
        assert!(!batch.has_member("S2"));
    }

    #[test]
    fn merged_members_keep_registry_members_first() {
        let mut held = Batch::new("f.csv", "B1", "batch");
        held.add_member(Identifier::official("S1", "sample_id"));
        held.add_member(Identifier::official("S2", "sample_id"));
        let mut outgoing = Batch::new("f.csv", "B1", "batch");
        outgoing.add_member(Identifier::official("S2", "sample_id"));
        outgoing.add_member(Identifier::official("S3", "sample_id"));

        outgoing.merge_members(&held);
        let keys: Vec<_> = outgoing
            .member
            .iter()
            .filter_map(|member| member.entity.identifier.as_ref())
            .map(|identifier| identifier.value.as_str())
            .collect();
        assert_eq!(keys, vec!["S1", "S2", "S3"]);
    }

    #[test]
    fn sequence_types_map_to_lowercase_codes() {
        assert_eq!(sequence_type_code("RNA"), Some("rna"));
        assert_eq!(sequence_type_code(" dna "), Some("dna"));
        assert_eq!(sequence_type_code("AA"), Some("aa"));
        assert_eq!(sequence_type_code("ATAC"), None);
    }
}
