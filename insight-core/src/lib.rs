//! Annotation data model, configuration and errors shared by the insight pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Half-open `[begin, end)` offset interval into the document text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Span {
    pub begin: usize,
    pub end: usize,
}

impl Span {
    pub fn new(begin: usize, end: usize) -> Self {
        Self { begin, end }
    }
}

/// Output of one oracle call over one document.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationSet {
    #[serde(default)]
    pub sentences: Vec<Sentence>,
    #[serde(default)]
    pub concepts: Vec<Concept>,
    #[serde(default)]
    pub attribute_values: Vec<AttributeValue>,
    #[serde(rename = "MedicationInd", default)]
    pub medication_ind: Vec<MedicationAnnotation>,
}

impl AnnotationSet {
    /// Covered text of the sentence carrying `uid`, once normalized.
    pub fn sentence_text(&self, uid: u64) -> Option<&str> {
        self.sentences
            .iter()
            .find(|sentence| sentence.uid == Some(uid))
            .and_then(|sentence| sentence.covered_text.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sentence {
    pub begin: usize,
    pub end: usize,
    #[serde(default)]
    pub uid: Option<u64>,
    #[serde(default)]
    pub covered_text: Option<String>,
}

/// Semantic type tags; the oracle sends either one string or a list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TypeTags {
    One(String),
    Many(Vec<String>),
}

impl Default for TypeTags {
    fn default() -> Self {
        TypeTags::Many(Vec::new())
    }
}

impl TypeTags {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            TypeTags::One(tag) => std::slice::from_ref(tag),
            TypeTags::Many(tags) => tags.as_slice(),
        };
        slice.iter().map(String::as_str)
    }
}

/// A detected clinical concept. `cui` is the identity key within a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Concept {
    pub cui: String,
    #[serde(rename = "type", default)]
    pub types: TypeTags,
    #[serde(default)]
    pub preferred_name: Option<String>,
    pub begin: usize,
    pub end: usize,
    #[serde(default)]
    pub covered_text: Option<String>,
    #[serde(default)]
    pub uid: Option<u64>,
    #[serde(rename = "rxNormID", default)]
    pub rx_norm_id: Option<String>,
    #[serde(default)]
    pub snomed_concept_id: Option<String>,
    #[serde(default)]
    pub icd9_code: Option<String>,
    #[serde(default)]
    pub icd10_code: Option<String>,
    #[serde(default)]
    pub nci_code: Option<String>,
    #[serde(default)]
    pub loinc_id: Option<String>,
    #[serde(default)]
    pub mesh_id: Option<String>,
    #[serde(default)]
    pub insight_model_data: Option<InsightModelData>,
}

impl Concept {
    /// Comma-delimited code lists per coding system, UMLS excluded.
    pub fn code_lists<'a>(
        &'a self,
        systems: &'a CodingSystems,
    ) -> [(&'a str, Option<&'a str>); 7] {
        [
            (&systems.snomed, self.snomed_concept_id.as_deref()),
            (&systems.nci, self.nci_code.as_deref()),
            (&systems.loinc, self.loinc_id.as_deref()),
            (&systems.mesh, self.mesh_id.as_deref()),
            (&systems.icd9, self.icd9_code.as_deref()),
            (&systems.icd10, self.icd10_code.as_deref()),
            (&systems.rxnorm, self.rx_norm_id.as_deref()),
        ]
    }
}

/// Drug-administration annotation (`MedicationInd`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MedicationAnnotation {
    pub cui: String,
    pub begin: usize,
    pub end: usize,
    #[serde(default)]
    pub covered_text: Option<String>,
    #[serde(default)]
    pub uid: Option<u64>,
    #[serde(default)]
    pub drug: Vec<Drug>,
    #[serde(default)]
    pub administration: Vec<Administration>,
    #[serde(default)]
    pub insight_model_data: Option<InsightModelData>,
}

impl MedicationAnnotation {
    /// First drug name entry, the one the oracle reports as the mention itself.
    pub fn drug_name(&self) -> Option<&DrugName> {
        self.drug.first().and_then(|drug| drug.name1.first())
    }

    pub fn administration(&self) -> Option<&Administration> {
        self.administration.first()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Drug {
    #[serde(default)]
    pub name1: Vec<DrugName>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrugName {
    #[serde(default)]
    pub drug_surface_form: Option<String>,
    #[serde(default)]
    pub cui: Option<String>,
    #[serde(rename = "rxNormID", default)]
    pub rx_norm_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Administration {
    #[serde(default)]
    pub dosage_value: Option<String>,
    #[serde(default)]
    pub frequency_value: Option<String>,
}

/// Attribute-value assertion (e.g. `MedicationAdverseEvent`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttributeValue {
    pub name: String,
    pub begin: usize,
    pub end: usize,
    #[serde(default)]
    pub preferred_name: Option<String>,
    #[serde(default)]
    pub covered_text: Option<String>,
    #[serde(default)]
    pub evidence_spans: Vec<EvidenceSpan>,
    /// Concept the attribute was derived from.
    #[serde(default)]
    pub concept: Option<ConceptRef>,
    #[serde(default)]
    pub insight_model_data: Option<InsightModelData>,
}

impl AttributeValue {
    pub fn span(&self) -> Span {
        Span::new(self.begin, self.end)
    }

    pub fn first_evidence_uid(&self) -> Option<u64> {
        self.evidence_spans.first().and_then(|evidence| evidence.uid)
    }

    /// Source concept, matched on uid.
    pub fn source_concept<'a>(&self, concepts: &'a [Concept]) -> Option<&'a Concept> {
        let uid = self.concept.as_ref()?.uid?;
        concepts.iter().find(|concept| concept.uid == Some(uid))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ConceptRef {
    #[serde(default)]
    pub uid: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EvidenceSpan {
    #[serde(default)]
    pub uid: Option<u64>,
}

/// Confidence sub-scores attached by the oracle.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct InsightModelData {
    #[serde(default)]
    pub medication: Option<MedicationModel>,
    #[serde(default)]
    pub diagnosis: Option<DiagnosisModel>,
}

impl InsightModelData {
    /// `medication.adverseEvent.usage.consideringScore`
    pub fn adverse_event_considering_score(&self) -> Option<f64> {
        self.medication
            .as_ref()?
            .adverse_event
            .as_ref()?
            .usage
            .as_ref()?
            .considering_score
    }

    /// MedDRA pair of the last associated adverse event that carries one.
    pub fn meddra_code(&self) -> Option<&MeddraCode> {
        self.medication
            .as_ref()?
            .modifiers
            .as_ref()?
            .associated_adverse_events
            .iter()
            .filter_map(|event| event.meddra_codes.as_ref())
            .last()?
            .first()?
            .first()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MedicationModel {
    #[serde(default)]
    pub usage: Option<MedicationUsage>,
    #[serde(default)]
    pub adverse_event: Option<AdverseEventModel>,
    #[serde(default)]
    pub modifiers: Option<MedicationModifiers>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MedicationUsage {
    #[serde(default)]
    pub taken_score: Option<f64>,
    #[serde(default)]
    pub considering_score: Option<f64>,
    #[serde(default)]
    pub discussed_score: Option<f64>,
    #[serde(default)]
    pub lab_measurement_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AdverseEventModel {
    #[serde(default)]
    pub usage: Option<MedicationUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MedicationModifiers {
    #[serde(default)]
    pub associated_adverse_events: Vec<AssociatedAdverseEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssociatedAdverseEvent {
    #[serde(default)]
    pub meddra_codes: Option<Vec<Vec<MeddraCode>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeddraCode {
    #[serde(default)]
    pub pref_name: Option<String>,
    #[serde(default)]
    pub meddra_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisModel {
    #[serde(default)]
    pub usage: Option<DiagnosisUsage>,
    #[serde(default)]
    pub suspected_score: Option<f64>,
    #[serde(default)]
    pub family_history_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisUsage {
    #[serde(default)]
    pub explicit_score: Option<f64>,
    #[serde(default)]
    pub patient_reported_score: Option<f64>,
    #[serde(default)]
    pub discussed_score: Option<f64>,
}

/// Common view over the annotation kinds that produce insights.
pub trait Mention {
    fn cui(&self) -> &str;
    fn span(&self) -> Span;
    fn covered_text(&self) -> Option<&str>;
    fn model_data(&self) -> Option<&InsightModelData>;
}

impl Mention for Concept {
    fn cui(&self) -> &str {
        &self.cui
    }

    fn span(&self) -> Span {
        Span::new(self.begin, self.end)
    }

    fn covered_text(&self) -> Option<&str> {
        self.covered_text.as_deref()
    }

    fn model_data(&self) -> Option<&InsightModelData> {
        self.insight_model_data.as_ref()
    }
}

impl Mention for MedicationAnnotation {
    fn cui(&self) -> &str {
        &self.cui
    }

    fn span(&self) -> Span {
        Span::new(self.begin, self.end)
    }

    fn covered_text(&self) -> Option<&str> {
        self.covered_text.as_deref()
    }

    fn model_data(&self) -> Option<&InsightModelData> {
        self.insight_model_data.as_ref()
    }
}

/// Link back to a FHIR resource (`Patient/123`, `urn:uuid:...`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl ResourceReference {
    pub fn to(reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
            display: None,
        }
    }
}

/// Unstructured resource handed to the pipeline by the document source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceDocument {
    pub resource_type: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub subject: Option<ResourceReference>,
    pub extracted_text: String,
}

impl SourceDocument {
    pub fn new(resource_type: impl Into<String>, extracted_text: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: None,
            subject: None,
            extracted_text: extracted_text.into(),
        }
    }

    /// `ResourceType/id`, when the document has an id.
    pub fn reference(&self) -> Option<ResourceReference> {
        self.id
            .as_ref()
            .map(|id| ResourceReference::to(format!("{}/{id}", self.resource_type)))
    }
}

/// Coding systems written into derived codings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CodingSystems {
    pub umls: String,
    pub rxnorm: String,
    pub snomed: String,
    pub icd9: String,
    pub icd10: String,
    pub nci: String,
    pub loinc: String,
    pub mesh: String,
    pub meddra: String,
    pub timing: String,
}

impl Default for CodingSystems {
    fn default() -> Self {
        Self {
            umls: "http://terminology.hl7.org/CodeSystem/umls".to_string(),
            rxnorm: "http://www.nlm.nih.gov/research/umls/rxnorm".to_string(),
            snomed: "http://snomed.info/sct".to_string(),
            icd9: "http://terminology.hl7.org/CodeSystem/icd9".to_string(),
            icd10: "https://terminology.hl7.org/CodeSystem/icd10".to_string(),
            nci: "http://ncithesaurus.nci.nih.gov/ncitbrowser/".to_string(),
            loinc: "http://loinc.org".to_string(),
            mesh: "http://www.nlm.nih.gov/mesh/meshhome.html".to_string(),
            meddra: "meddra".to_string(),
            timing: "http://hl7.org/fhir/ValueSet/timing-abbreviation".to_string(),
        }
    }
}

/// Attribute names that enrich each kind of structured resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StructuredAttributes {
    pub allergy: Vec<String>,
    pub condition: Vec<String>,
    pub immunization: Vec<String>,
}

impl Default for StructuredAttributes {
    fn default() -> Self {
        Self {
            allergy: vec!["CDP-Allergy".to_string()],
            condition: vec!["CDP-Condition".to_string()],
            immunization: vec!["CDP-Immunization".to_string()],
        }
    }
}

/// Static settings for one pipeline; read-only while documents are processed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InsightConfig {
    /// Concept type tags turned into MedicationStatements.
    pub medication_types: Vec<String>,
    /// Concept type tags turned into Conditions.
    pub condition_types: Vec<String>,
    /// Attribute name that marks a medication adverse event.
    pub adverse_event_attribute: String,
    /// Considering score below which an adverse event is reported as actual.
    pub actuality_threshold: f64,
    /// System of the `insight-N` identifiers.
    pub insight_id_system: String,
    /// Where the raw oracle output is kept, if anywhere.
    pub nlp_output_location: Option<String>,
    pub coding: CodingSystems,
    pub structured_attributes: StructuredAttributes,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            medication_types: [
                "umls.Antibiotic",
                "umls.ClinicalDrug",
                "umls.PharmacologicSubstance",
                "umls.OrganicChemical",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            condition_types: [
                "umls.DiseaseOrSyndrome",
                "umls.NeoplasticProcess",
                "umls.SignOrSymptom",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            adverse_event_attribute: "MedicationAdverseEvent".to_string(),
            actuality_threshold: 0.5,
            insight_id_system: "urn:id:COM.IBM.WH.PA.CDP.CDE/1.0.0".to_string(),
            nlp_output_location: None,
            coding: CodingSystems::default(),
            structured_attributes: StructuredAttributes::default(),
        }
    }
}

impl InsightConfig {
    /// Rejects settings the pipeline cannot work with.
    pub fn validate(&self) -> Result<(), InsightError> {
        if self.adverse_event_attribute.trim().is_empty() {
            return Err(InsightError::Config(
                "adverse_event_attribute must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.actuality_threshold) {
            return Err(InsightError::Config(format!(
                "actuality_threshold {} is outside 0..=1",
                self.actuality_threshold
            )));
        }
        if self.insight_id_system.trim().is_empty() {
            return Err(InsightError::Config(
                "insight_id_system must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fatal failures; the document yields no bundle.
#[derive(Debug, thiserror::Error)]
pub enum InsightError {
    #[error("span {begin}..{end} is outside the document text (length {len})")]
    SpanOutOfRange { begin: usize, end: usize, len: usize },
    #[error("malformed annotation data: {0}")]
    MalformedAnnotation(String),
    #[error("cannot enrich resource: {0}")]
    MalformedResource(String),
    #[error("annotation service failed: {0}")]
    OracleFailure(#[from] OracleError),
    #[error("no annotation service registered as `{0}`")]
    UnknownService(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failure of the annotation call itself.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OracleError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// A dose amount that could not be read; the amount stays unset.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("cannot read dose amount from `{token}`")]
pub struct ParseRecoverable {
    pub token: String,
}
