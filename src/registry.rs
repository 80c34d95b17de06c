use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, LOCATION, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::RegistrySettings;
use crate::error::IngestError;
use crate::resource::{Resource, ResourceKind};

const FHIR_JSON: &str = "application/fhir+json";

/// The external resource registry, consumed only through identifier search
/// and create/update.
pub trait Registry: Send + Sync {
    /// Resources of `kind` carrying an identifier whose value equals `identifier`.
    fn search(&self, kind: ResourceKind, identifier: &str) -> Result<Vec<Resource>, IngestError>;
    /// Creates the resource and returns the id assigned by the registry.
    fn create(&self, resource: &Resource) -> Result<String, IngestError>;
    /// Replaces the resource stored under `resource.id()`.
    fn update(&self, resource: &Resource) -> Result<String, IngestError>;
}

impl<T: Registry + ?Sized> Registry for &T {
    fn search(&self, kind: ResourceKind, identifier: &str) -> Result<Vec<Resource>, IngestError> {
        (**self).search(kind, identifier)
    }

    fn create(&self, resource: &Resource) -> Result<String, IngestError> {
        (**self).create(resource)
    }

    fn update(&self, resource: &Resource) -> Result<String, IngestError> {
        (**self).update(resource)
    }
}

#[derive(Clone)]
pub struct FhirHttpClient {
    client: Client,
    base_url: String,
    retries: usize,
}

#[derive(Debug, Deserialize)]
struct Bundle {
    #[serde(default)]
    entry: Vec<BundleEntry>,
    #[serde(default)]
    link: Vec<BundleLink>,
}

#[derive(Debug, Deserialize)]
struct BundleEntry {
    #[serde(default)]
    resource: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct BundleLink {
    relation: String,
    url: String,
}

impl FhirHttpClient {
    pub fn new(settings: &RegistrySettings) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-sg/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::RegistryHttp(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static(FHIR_JSON));
        if let Some(token) = &settings.token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|err| IngestError::RegistryHttp(err.to_string()))?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| IngestError::RegistryHttp(err.to_string()))?;

        Url::parse(&settings.base_url)
            .map_err(|err| IngestError::RegistryHttp(format!("{}: {err}", settings.base_url)))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            retries: settings.retries,
        })
    }

    fn type_url(&self, kind: ResourceKind) -> String {
        format!("{}/{}", self.base_url, kind.resource_type())
    }

    /// Retries transport failures and retryable statuses. Only used for
    /// searches; writes go out exactly once.
    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, IngestError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.retries && is_retryable_status(status) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < self.retries && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(IngestError::RegistryHttp(err.to_string()));
                }
            }
        }
    }

    fn handle_status(response: Response) -> Result<Response, IngestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "registry request failed".to_string());
        Err(IngestError::RegistryStatus { status, message })
    }

    /// `identifier=<accession>&identifier=<official>` for conditional create.
    fn conditional_query(&self, resource: &Resource) -> Option<String> {
        let (accession, official) = (resource.accession()?, resource.official()?);
        let mut url = Url::parse(&self.base_url).ok()?;
        url.query_pairs_mut()
            .append_pair("identifier", accession)
            .append_pair("identifier", official);
        url.query().map(str::to_string)
    }

    fn write_body(resource: &Resource) -> Result<Vec<u8>, IngestError> {
        serde_json::to_vec(resource).map_err(|err| IngestError::RegistryPayload(err.to_string()))
    }

    fn assigned_id(response: Response, kind: ResourceKind) -> Result<String, IngestError> {
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .map_err(|err| IngestError::RegistryHttp(err.to_string()))?;
        if let Ok(value) = serde_json::from_str::<Value>(&body) {
            if let Some(id) = value.get("id").and_then(Value::as_str) {
                return Ok(id.to_string());
            }
        }
        location
            .as_deref()
            .and_then(|location| id_from_location(location, kind))
            .ok_or_else(|| {
                IngestError::RegistryPayload(format!("no id returned for created {kind}"))
            })
    }
}

impl Registry for FhirHttpClient {
    fn search(&self, kind: ResourceKind, identifier: &str) -> Result<Vec<Resource>, IngestError> {
        let mut resources = Vec::new();
        let mut next = Some(self.type_url(kind));
        let mut first_page = true;
        while let Some(url) = next.take() {
            let response = self.send_with_retries(|| {
                let request = self.client.get(&url);
                if first_page {
                    request.query(&[("identifier", identifier)])
                } else {
                    request
                }
            })?;
            first_page = false;
            let bundle: Bundle = Self::handle_status(response)?
                .json()
                .map_err(|err| IngestError::RegistryPayload(err.to_string()))?;
            for entry in bundle.entry {
                let Some(value) = entry.resource else { continue };
                match serde_json::from_value::<Resource>(value) {
                    Ok(resource) if resource.kind() == kind => resources.push(resource),
                    Ok(_) => {}
                    Err(err) => debug!(%kind, error = %err, "ignoring unparseable bundle entry"),
                }
            }
            next = bundle
                .link
                .into_iter()
                .find(|link| link.relation == "next")
                .map(|link| link.url);
        }
        debug!(%kind, identifier, found = resources.len(), "registry search");
        Ok(resources)
    }

    fn create(&self, resource: &Resource) -> Result<String, IngestError> {
        let kind = resource.kind();
        let mut request = self
            .client
            .post(self.type_url(kind))
            .header(CONTENT_TYPE, FHIR_JSON)
            .body(Self::write_body(resource)?);
        if let Some(condition) = self.conditional_query(resource) {
            request = request.header("If-None-Exist", condition);
        }
        let response = request
            .send()
            .map_err(|err| IngestError::RegistryHttp(err.to_string()))?;
        let id = Self::assigned_id(Self::handle_status(response)?, kind)?;
        debug!(%kind, id = %id, "registry create");
        Ok(id)
    }

    fn update(&self, resource: &Resource) -> Result<String, IngestError> {
        let kind = resource.kind();
        let id = resource.id().ok_or_else(|| {
            IngestError::RegistryPayload(format!("cannot update {kind} without an id"))
        })?;
        let response = self
            .client
            .put(format!("{}/{id}", self.type_url(kind)))
            .header(CONTENT_TYPE, FHIR_JSON)
            .body(Self::write_body(resource)?)
            .send()
            .map_err(|err| IngestError::RegistryHttp(err.to_string()))?;
        Self::handle_status(response)?;
        debug!(%kind, id, "registry update");
        Ok(id.to_string())
    }
}

fn id_from_location(location: &str, kind: ResourceKind) -> Option<String> {
    let mut segments = location.split('/');
    segments.find(|segment| *segment == kind.resource_type())?;
    segments
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Registry held in process memory. Backs dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    resources: Vec<Resource>,
    next_id: u64,
    searches: usize,
    creates: usize,
    updates: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallCounts {
    pub searches: usize,
    pub creates: usize,
    pub updates: usize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resources(&self, kind: ResourceKind) -> Vec<Resource> {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state
            .resources
            .iter()
            .filter(|resource| resource.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> CallCounts {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        CallCounts {
            searches: state.searches,
            creates: state.creates,
            updates: state.updates,
        }
    }
}

impl Registry for MemoryRegistry {
    fn search(&self, kind: ResourceKind, identifier: &str) -> Result<Vec<Resource>, IngestError> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.searches += 1;
        Ok(state
            .resources
            .iter()
            .filter(|resource| resource.kind() == kind)
            .filter(|resource| {
                resource
                    .identifiers()
                    .iter()
                    .any(|candidate| candidate.value == identifier)
            })
            .cloned()
            .collect())
    }

    fn create(&self, resource: &Resource) -> Result<String, IngestError> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.creates += 1;
        state.next_id += 1;
        let id = state.next_id.to_string();
        let mut stored = resource.clone();
        stored.set_id(id.clone());
        state.resources.push(stored);
        Ok(id)
    }

    fn update(&self, resource: &Resource) -> Result<String, IngestError> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.updates += 1;
        let id = resource
            .id()
            .ok_or_else(|| IngestError::RegistryPayload("update without id".to_string()))?
            .to_string();
        let slot = state
            .resources
            .iter_mut()
            .find(|stored| stored.kind() == resource.kind() && stored.id() == Some(id.as_str()))
            .ok_or_else(|| IngestError::RegistryStatus {
                status: 404,
                message: format!("{} {id} not found", resource.kind()),
            })?;
        *slot = resource.clone();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_header_yields_logical_id() {
        assert_eq!(
            id_from_location(
                "http://localhost:7000/api/fhir/Group/17/_history/1",
                ResourceKind::Batch
            ),
            Some("17".to_string())
        );
        assert_eq!(id_from_location("http://x/Patient/", ResourceKind::Subject), None);
    }
}
