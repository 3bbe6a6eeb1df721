//! FHIR output shapes, limited to the elements derived resources use.

use insight_core::ResourceReference;
use serde::Serialize;

pub const INSIGHT_REFERENCE_URL: &str = "http://ibm.com/fhir/cdm/insight/reference";
pub const INSIGHT_CATEGORY_URL: &str = "http://ibm.com/fhir/cdm/StructureDefinition/category";
pub const INSIGHT_URL: &str = "http://ibm.com/fhir/cdm/StructureDefinition/insight";
pub const INSIGHT_BASED_ON_URL: &str = "http://ibm.com/fhir/cdm/StructureDefinition/reference";
pub const INSIGHT_DETAIL_URL: &str = "http://ibm.com/fhir/cdm/StructureDefinition/insight-detail";
pub const INSIGHT_ID_URL: &str = "http://ibm.com/fhir/cdm/StructureDefinition/insight-id";
pub const INSIGHT_NLP_OUTPUT_URL: &str =
    "http://ibm.com/fhir/cdm/StructureDefinition/evaluated-output";
pub const INSIGHT_REFERENCE_PATH_URL: &str =
    "http://ibm.com/fhir/cdm/StructureDefinition/reference-path";
pub const INSIGHT_RESULT_URL: &str = "http://ibm.com/fhir/cdm/StructureDefinition/insight-result";
pub const INSIGHT_SPAN_URL: &str = "http://ibm.com/fhir/cdm/StructureDefinition/span";
pub const INSIGHT_SPAN_OFFSET_BEGIN_URL: &str =
    "http://ibm.com/fhir/cdm/StructureDefinition/offset-begin";
pub const INSIGHT_SPAN_OFFSET_END_URL: &str =
    "http://ibm.com/fhir/cdm/StructureDefinition/offset-end";
pub const INSIGHT_SPAN_COVERED_TEXT_URL: &str =
    "http://ibm.com/fhir/cdm/StructureDefinition/covered-text";
pub const INSIGHT_CONFIDENCE_URL: &str =
    "http://ibm.com/fhir/cdm/StructureDefinition/insight-confidence";
pub const INSIGHT_CONFIDENCE_SCORE_URL: &str = "http://ibm.com/fhir/cdm/StructureDefinition/score";
pub const INSIGHT_CONFIDENCE_NAME_URL: &str =
    "http://ibm.com/fhir/cdm/StructureDefinition/description";

pub const CLASSIFICATION_DERIVED_CODE: &str = "natural-language-processing";
pub const CLASSIFICATION_DERIVED_DISPLAY: &str = "NLP";
pub const CLASSIFICATION_DERIVED_SYSTEM: &str =
    "http://ibm.com/fhir/cdm/CodeSystem/insight-category-code-system";

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_integer: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_decimal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_identifier: Option<Identifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_reference: Option<ResourceReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_attachment: Option<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_codeable_concept: Option<CodeableConcept>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
}

impl Extension {
    pub fn complex(url: &str, extension: Vec<Extension>) -> Self {
        Self {
            url: url.to_string(),
            extension,
            ..Self::default()
        }
    }

    pub fn string(url: &str, value: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            value_string: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn integer(url: &str, value: i64) -> Self {
        Self {
            url: url.to_string(),
            value_integer: Some(value),
            ..Self::default()
        }
    }

    pub fn decimal(url: &str, value: f64) -> Self {
        Self {
            url: url.to_string(),
            value_decimal: Some(value),
            ..Self::default()
        }
    }

    pub fn identifier(url: &str, system: &str, value: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            value_identifier: Some(Identifier {
                system: Some(system.to_string()),
                value: Some(value.into()),
                kind: None,
            }),
            ..Self::default()
        }
    }

    pub fn reference(url: &str, reference: ResourceReference) -> Self {
        Self {
            url: url.to_string(),
            value_reference: Some(reference),
            ..Self::default()
        }
    }

    pub fn attachment(url: &str, location: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            value_attachment: Some(Attachment {
                url: location.into(),
            }),
            ..Self::default()
        }
    }

    /// Insight id reference placed on codings and dosages.
    pub fn insight_reference(system: &str, insight_id: impl Into<String>) -> Self {
        Self::identifier(INSIGHT_REFERENCE_URL, system, insight_id)
    }
}

/// Resource-level marker: the whole resource was derived by NLP.
pub fn derived_by_nlp_extension() -> Extension {
    Extension {
        url: INSIGHT_CATEGORY_URL.to_string(),
        value_codeable_concept: Some(CodeableConcept {
            text: Some(CLASSIFICATION_DERIVED_DISPLAY.to_string()),
            coding: vec![Coding::new(
                CLASSIFICATION_DERIVED_SYSTEM,
                CLASSIFICATION_DERIVED_CODE,
                Some(CLASSIFICATION_DERIVED_DISPLAY),
            )],
        }),
        ..Extension::default()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Attachment {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct Identifier {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<CodeableConcept>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct Coding {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
    pub system: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Coding {
    pub fn new(system: &str, code: &str, display: Option<&str>) -> Self {
        Self {
            extension: Vec::new(),
            system: system.to_string(),
            code: code.to_string(),
            display: display.map(str::to_string),
        }
    }

    pub fn with_extension(mut self, extension: Extension) -> Self {
        self.extension.push(extension);
        self
    }

    /// Insight that contributed this coding, if it was tagged with one.
    pub fn insight_id(&self) -> Option<&str> {
        self.extension
            .iter()
            .find(|ext| ext.url == INSIGHT_REFERENCE_URL)
            .and_then(|ext| ext.value_identifier.as_ref())
            .and_then(|id| id.value.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct CodeableConcept {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub coding: Vec<Coding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl CodeableConcept {
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            coding: Vec::new(),
            text: Some(text.into()),
        }
    }

    pub fn find_coding(&self, system: &str, code: &str) -> Option<&Coding> {
        self.coding
            .iter()
            .find(|coding| coding.system == system && coding.code == code)
    }

    /// Appends `coding` unless one with the same system and code is present.
    pub fn add_coding(&mut self, coding: Coding) -> bool {
        if self.find_coding(&coding.system, &coding.code).is_some() {
            return false;
        }
        self.coding.push(coding);
        true
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct Meta {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Quantity {
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DoseAndRate {
    pub dose_quantity: Quantity,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Timing {
    pub code: CodeableConcept,
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Dosage {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<Timing>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dose_and_rate: Vec<DoseAndRate>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MedicationStatement {
    pub id: String,
    pub meta: Meta,
    pub extension: Vec<Extension>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medication_codeable_concept: Option<CodeableConcept>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dosage: Vec<Dosage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<ResourceReference>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdverseEvent {
    pub id: String,
    pub meta: Meta,
    pub extension: Vec<Extension>,
    pub identifier: Identifier,
    pub actuality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<ResourceReference>,
    pub suspect_entity: Vec<SuspectEntity>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SuspectEntity {
    pub instance: ResourceReference,
    pub causality: Vec<Causality>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Causality {
    pub product_relatedness: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Condition {
    pub id: String,
    pub meta: Meta,
    pub extension: Vec<Extension>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<CodeableConcept>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<ResourceReference>,
}

/// Any resource the pipeline emits.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "resourceType")]
pub enum Resource {
    MedicationStatement(MedicationStatement),
    AdverseEvent(AdverseEvent),
    Condition(Condition),
}

impl Resource {
    pub fn resource_type(&self) -> &'static str {
        match self {
            Resource::MedicationStatement(_) => "MedicationStatement",
            Resource::AdverseEvent(_) => "AdverseEvent",
            Resource::Condition(_) => "Condition",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Resource::MedicationStatement(resource) => &resource.id,
            Resource::AdverseEvent(resource) => &resource.id,
            Resource::Condition(resource) => &resource.id,
        }
    }
}
