//! Annotation service seam and the caller-owned registry of configured services.

use std::collections::HashMap;
use std::sync::Arc;

use insight_core::{AnnotationSet, InsightError, MedicationAnnotation, OracleError};
use tracing::info;

/// Clinical NLP service producing annotations for one document.
///
/// Implementations must be safe to share between threads; the pipeline only
/// ever borrows them.
pub trait Oracle: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, text: &str) -> Result<AnnotationSet, OracleError>;

    /// Medication-indication support, for services whose output carries it.
    fn medication_enrichment(&self) -> Option<&dyn MedicationEnrichment> {
        None
    }
}

/// Optional capability: drug-administration mentions beyond plain concepts.
pub trait MedicationEnrichment: Send + Sync {
    fn medication_mentions<'a>(&self, annotations: &'a AnnotationSet)
        -> &'a [MedicationAnnotation];
}

/// Reads the `MedicationInd` section of the annotation output.
#[derive(Debug, Clone, Copy, Default)]
pub struct MedicationIndications;

impl MedicationEnrichment for MedicationIndications {
    fn medication_mentions<'a>(
        &self,
        annotations: &'a AnnotationSet,
    ) -> &'a [MedicationAnnotation] {
        &annotations.medication_ind
    }
}

/// Serves a previously recorded oracle response.
#[derive(Debug, Clone)]
pub struct ReplayOracle {
    name: String,
    recorded: Result<AnnotationSet, OracleError>,
    enrichment: Option<MedicationIndications>,
}

impl ReplayOracle {
    pub fn new(name: impl Into<String>, annotations: AnnotationSet) -> Self {
        Self {
            name: name.into(),
            recorded: Ok(annotations),
            enrichment: None,
        }
    }

    pub fn from_json(name: impl Into<String>, json: &str) -> Result<Self, InsightError> {
        let annotations: AnnotationSet = serde_json::from_str(json)
            .map_err(|err| InsightError::MalformedAnnotation(err.to_string()))?;
        Ok(Self::new(name, annotations))
    }

    /// A service that always fails with `error`.
    pub fn failing(name: impl Into<String>, error: OracleError) -> Self {
        Self {
            name: name.into(),
            recorded: Err(error),
            enrichment: None,
        }
    }

    pub fn with_medication_enrichment(mut self) -> Self {
        self.enrichment = Some(MedicationIndications);
        self
    }
}

impl Oracle for ReplayOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, text: &str) -> Result<AnnotationSet, OracleError> {
        info!(service = %self.name, chars = text.chars().count(), "replaying annotation output");
        self.recorded.clone()
    }

    fn medication_enrichment(&self) -> Option<&dyn MedicationEnrichment> {
        self.enrichment
            .as_ref()
            .map(|enrichment| enrichment as &dyn MedicationEnrichment)
    }
}

/// Named annotation services and the one currently in use.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn Oracle>>,
    active: Option<String>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service` under `name`, returning any service it replaces.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        service: Arc<dyn Oracle>,
    ) -> Option<Arc<dyn Oracle>> {
        let name = name.into();
        info!(service = %name, "registered annotation service");
        self.services.insert(name, service)
    }

    pub fn activate(&mut self, name: &str) -> Result<(), InsightError> {
        if !self.services.contains_key(name) {
            return Err(InsightError::UnknownService(name.to_string()));
        }
        info!(service = %name, "annotation service activated");
        self.active = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Oracle>> {
        self.services.get(name).cloned()
    }

    pub fn active(&self) -> Result<Arc<dyn Oracle>, InsightError> {
        let name = self
            .active
            .as_deref()
            .ok_or_else(|| InsightError::UnknownService("<none active>".to_string()))?;
        self.get(name)
            .ok_or_else(|| InsightError::UnknownService(name.to_string()))
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
