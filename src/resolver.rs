use std::collections::HashMap;

use tracing::debug;

use crate::error::IngestError;
use crate::registry::Registry;
use crate::resource::{Resource, ResourceKind};

/// Result of a create-if-absent call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Created(String),
    /// The registry already held the entity; carries its id when it has one.
    Existing(Option<String>),
}

/// Result of a search-then-write call on a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    Created(String),
    Updated(String),
}

impl Upsert {
    pub fn id(&self) -> &str {
        match self {
            Upsert::Created(id) | Upsert::Updated(id) => id,
        }
    }
}

/// Decides whether an (ACCESSION, OFFICIAL) pair already exists in the
/// registry. With `cache_lookups` on, search results are kept per
/// (kind, accession) and patched after every write, so each kind costs one
/// search per upload.
pub struct IdentityResolver<'r, R: Registry + ?Sized> {
    registry: &'r R,
    index: Option<HashMap<(ResourceKind, String), Vec<Resource>>>,
}

impl<'r, R: Registry + ?Sized> IdentityResolver<'r, R> {
    pub fn new(registry: &'r R, cache_lookups: bool) -> Self {
        Self {
            registry,
            index: cache_lookups.then(HashMap::new),
        }
    }

    /// All resources of `kind` carrying `accession`.
    pub fn by_accession(
        &mut self,
        kind: ResourceKind,
        accession: &str,
    ) -> Result<Vec<Resource>, IngestError> {
        let Some(index) = self.index.as_mut() else {
            return self.registry.search(kind, accession);
        };
        let key = (kind, accession.to_string());
        if let Some(cached) = index.get(&key) {
            return Ok(cached.clone());
        }
        let found = self
            .registry
            .search(kind, accession)?
            .into_iter()
            .filter(|resource| resource.accession() == Some(accession))
            .collect::<Vec<_>>();
        index.insert(key, found.clone());
        Ok(found)
    }

    pub fn exists(
        &mut self,
        kind: ResourceKind,
        accession: &str,
        official: &str,
    ) -> Result<Option<Resource>, IngestError> {
        Ok(self
            .by_accession(kind, accession)?
            .into_iter()
            .find(|resource| resource.matches(accession, official)))
    }

    pub fn create_if_absent(&mut self, mut resource: Resource) -> Result<Resolution, IngestError> {
        let (kind, accession, official) = identity(&resource)?;
        if let Some(existing) = self.exists(kind, &accession, &official)? {
            debug!(%kind, official = %official, "already in registry");
            return Ok(Resolution::Existing(existing.id().map(str::to_string)));
        }
        let id = self.registry.create(&resource)?;
        resource.set_id(id.clone());
        self.remember(kind, &accession, resource);
        Ok(Resolution::Created(id))
    }

    /// Updates the registry copy when one exists, creates it otherwise. A
    /// batch update keeps the members the registry copy already lists.
    pub fn upsert(&mut self, mut resource: Resource) -> Result<Upsert, IngestError> {
        let (kind, accession, official) = identity(&resource)?;
        match self.exists(kind, &accession, &official)? {
            Some(existing) => {
                let id = existing.id().ok_or_else(|| {
                    IngestError::RegistryPayload(format!("{kind} {official} has no id"))
                })?;
                resource.set_id(id);
                if let (Resource::Batch(outgoing), Resource::Batch(held)) =
                    (&mut resource, &existing)
                {
                    outgoing.merge_members(held);
                }
                let id = self.registry.update(&resource)?;
                self.remember(kind, &accession, resource);
                Ok(Upsert::Updated(id))
            }
            None => {
                let id = self.registry.create(&resource)?;
                resource.set_id(id.clone());
                self.remember(kind, &accession, resource);
                Ok(Upsert::Created(id))
            }
        }
    }

    fn remember(&mut self, kind: ResourceKind, accession: &str, resource: Resource) {
        let Some(index) = self.index.as_mut() else {
            return;
        };
        let entries = index.entry((kind, accession.to_string())).or_default();
        match entries
            .iter_mut()
            .find(|cached| cached.official() == resource.official())
        {
            Some(slot) => *slot = resource,
            None => entries.push(resource),
        }
    }
}

fn identity(resource: &Resource) -> Result<(ResourceKind, String, String), IngestError> {
    let kind = resource.kind();
    match (resource.accession(), resource.official()) {
        (Some(accession), Some(official)) => {
            Ok((kind, accession.to_string(), official.to_string()))
        }
        _ => Err(IngestError::RegistryPayload(format!(
            "{kind} is missing its accession or official identifier"
        ))),
    }
}
