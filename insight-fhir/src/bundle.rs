//! Transaction bundle holding every resource derived from one document.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::fhir::Resource;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BundleRequest {
    pub method: String,
    pub url: String,
}

impl BundleRequest {
    /// Create a new resource of `resource_type`.
    pub fn post(resource_type: &str) -> Self {
        Self {
            method: "POST".to_string(),
            url: resource_type.to_string(),
        }
    }

    /// Replace the stored resource `<resource_type>/<id>`.
    pub fn put(resource_type: &str, id: &str) -> Self {
        Self {
            method: "PUT".to_string(),
            url: format!("{resource_type}/{id}"),
        }
    }
}

/// Entry payload: a resource built here, or a caller's resource carried as JSON.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum EntryResource {
    Derived(Resource),
    Structured(Value),
}

impl EntryResource {
    pub fn resource_type(&self) -> &str {
        match self {
            EntryResource::Derived(resource) => resource.resource_type(),
            EntryResource::Structured(value) => value
                .get("resourceType")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            EntryResource::Derived(resource) => Some(resource.id()),
            EntryResource::Structured(value) => value.get("id").and_then(Value::as_str),
        }
    }

    pub fn derived(&self) -> Option<&Resource> {
        match self {
            EntryResource::Derived(resource) => Some(resource),
            EntryResource::Structured(_) => None,
        }
    }

    pub fn structured(&self) -> Option<&Value> {
        match self {
            EntryResource::Derived(_) => None,
            EntryResource::Structured(value) => Some(value),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,
    pub resource: EntryResource,
    pub request: BundleRequest,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub resource_type: &'static str,
    #[serde(rename = "type")]
    pub bundle_type: &'static str,
    pub timestamp: DateTime<Utc>,
    pub entry: Vec<BundleEntry>,
}

impl Bundle {
    pub fn entries(&self) -> &[BundleEntry] {
        &self.entry
    }

    /// Derived resources of one type, in entry order.
    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = &'a Resource> + 'a {
        self.entry
            .iter()
            .filter_map(|entry| entry.resource.derived())
            .filter(move |resource| resource.resource_type() == resource_type)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Collects entries in order; `finish` produces the bundle in one step.
#[derive(Debug, Default)]
pub struct BundleAssembler {
    entries: Vec<BundleEntry>,
}

impl BundleAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a derived resource as a `POST` under a fresh `urn:uuid` full url.
    pub fn add(&mut self, resource: Resource) {
        let request = BundleRequest::post(resource.resource_type());
        let full_url = Some(format!("urn:uuid:{}", resource.id()));
        self.entries.push(BundleEntry {
            full_url,
            resource: EntryResource::Derived(resource),
            request,
        });
    }

    pub fn add_entry(&mut self, resource: EntryResource, request: BundleRequest) {
        self.entries.push(BundleEntry {
            full_url: None,
            resource,
            request,
        });
    }

    pub fn extend<I: IntoIterator<Item = Resource>>(&mut self, resources: I) {
        for resource in resources {
            self.add(resource);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finish(self) -> Bundle {
        Bundle {
            resource_type: "Bundle",
            bundle_type: "transaction",
            timestamp: Utc::now(),
            entry: self.entries,
        }
    }
}
