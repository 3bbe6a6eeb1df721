//! Adds NLP codings to the coded fields of an existing structured resource.
//!
//! The resource is handled as raw JSON so every element this crate does not
//! model survives the round trip untouched.

use insight_core::{Concept, InsightConfig, InsightError};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::builders::split_codes;
use crate::bundle::{Bundle, BundleAssembler, BundleRequest, EntryResource};
use crate::fhir::{
    derived_by_nlp_extension, Coding, Extension, INSIGHT_CATEGORY_URL, INSIGHT_DETAIL_URL,
    INSIGHT_ID_URL, INSIGHT_NLP_OUTPUT_URL, INSIGHT_REFERENCE_PATH_URL, INSIGHT_URL,
};
use crate::normalize;
use crate::oracle::{Oracle, ServiceRegistry};
use crate::provenance::InsightId;

/// Resource types whose coded fields can be enriched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredKind {
    AllergyIntolerance,
    Condition,
    Immunization,
}

impl StructuredKind {
    pub fn from_resource_type(resource_type: &str) -> Option<Self> {
        match resource_type {
            "AllergyIntolerance" => Some(StructuredKind::AllergyIntolerance),
            "Condition" => Some(StructuredKind::Condition),
            "Immunization" => Some(StructuredKind::Immunization),
            _ => None,
        }
    }

    pub fn resource_type(self) -> &'static str {
        match self {
            StructuredKind::AllergyIntolerance => "AllergyIntolerance",
            StructuredKind::Condition => "Condition",
            StructuredKind::Immunization => "Immunization",
        }
    }

    /// Attribute names that carry insights for this kind of resource.
    pub fn attribute_names(self, config: &InsightConfig) -> &[String] {
        let names = &config.structured_attributes;
        match self {
            StructuredKind::AllergyIntolerance => &names.allergy,
            StructuredKind::Condition => &names.condition,
            StructuredKind::Immunization => &names.immunization,
        }
    }

    fn of(resource: &Value) -> Result<Self, InsightError> {
        let resource_type = resource
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or_else(|| InsightError::MalformedResource("missing resourceType".to_string()))?;
        Self::from_resource_type(resource_type).ok_or_else(|| {
            InsightError::MalformedResource(format!("unsupported resource type {resource_type}"))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Allergen,
    Manifestation,
    Condition,
    Vaccine,
}

/// One codeable concept whose text is sent to the annotation service.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldOfInterest {
    pub kind: FieldKind,
    /// FHIR path, e.g. `AllergyIntolerance.reaction[0].manifestation[1]`.
    pub path: String,
    /// JSON pointer to the same element, e.g. `/reaction/0/manifestation/1`.
    pub pointer: String,
    pub text: String,
}

impl FieldOfInterest {
    fn new(kind: FieldKind, path: String, pointer: String, text: &str) -> Self {
        Self {
            kind,
            path,
            pointer,
            text: text.to_string(),
        }
    }
}

fn concept_text(codeable: &Value) -> Option<&str> {
    codeable
        .get("text")
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
}

fn elements<'a>(value: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    value.get(key).and_then(Value::as_array).into_iter().flatten()
}

/// Coded fields of `resource` that carry text, in document order.
///
/// Concepts without text are skipped; there is nothing to annotate.
pub fn fields_of_interest(resource: &Value) -> Result<Vec<FieldOfInterest>, InsightError> {
    let kind = StructuredKind::of(resource)?;
    let mut fields = Vec::new();

    let top_level = match kind {
        StructuredKind::AllergyIntolerance => ("code", FieldKind::Allergen),
        StructuredKind::Condition => ("code", FieldKind::Condition),
        StructuredKind::Immunization => ("vaccineCode", FieldKind::Vaccine),
    };
    let (key, field_kind) = top_level;
    if let Some(text) = resource.get(key).and_then(concept_text) {
        fields.push(FieldOfInterest::new(
            field_kind,
            format!("{}.{key}", kind.resource_type()),
            format!("/{key}"),
            text,
        ));
    }

    if kind == StructuredKind::AllergyIntolerance {
        for (r, reaction) in elements(resource, "reaction").enumerate() {
            for (m, manifestation) in elements(reaction, "manifestation").enumerate() {
                let Some(text) = concept_text(manifestation) else {
                    continue;
                };
                fields.push(FieldOfInterest::new(
                    FieldKind::Manifestation,
                    format!("AllergyIntolerance.reaction[{r}].manifestation[{m}]"),
                    format!("/reaction/{r}/manifestation/{m}"),
                    text,
                ));
            }
        }
    }

    Ok(fields)
}

/// Enrich a resource with the registry's active service.
pub fn enrich_resource_with(
    registry: &ServiceRegistry,
    resource: Value,
    config: &InsightConfig,
) -> Result<Option<Bundle>, InsightError> {
    let oracle = registry.active()?;
    enrich_resource(resource, oracle.as_ref(), config)
}

/// Annotates each field of interest and appends the resulting codings.
///
/// Returns a one-entry `PUT` bundle for the updated resource, or `None` when
/// no field gained a coding. Insight numbers are dense within the resource.
pub fn enrich_resource(
    mut resource: Value,
    oracle: &dyn Oracle,
    config: &InsightConfig,
) -> Result<Option<Bundle>, InsightError> {
    config.validate()?;
    let kind = StructuredKind::of(&resource)?;
    let id = resource
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| InsightError::MalformedResource("missing id".to_string()))?;
    let names = kind.attribute_names(config);

    let mut insights = Vec::new();
    for field in fields_of_interest(&resource)? {
        info!(
            service = oracle.name(),
            path = %field.path,
            "calling annotation service"
        );
        let mut annotations = oracle.process(&field.text)?;
        normalize::normalize(&field.text, &mut annotations)?;

        let codeable = resource.pointer_mut(&field.pointer).ok_or_else(|| {
            InsightError::MalformedResource(format!("{} is not addressable", field.path))
        })?;

        for attribute in annotations
            .attribute_values
            .iter()
            .filter(|attribute| names.contains(&attribute.name))
        {
            let Some(concept) = attribute.source_concept(&annotations.concepts) else {
                debug!(attribute = %attribute.name, "attribute has no source concept, skipped");
                continue;
            };

            let insight_id = InsightId::new(insights.len() as u32 + 1);
            let added = append_codings(codeable, concept_codings(concept, insight_id, config))?;
            if added == 0 {
                continue;
            }
            debug!(path = %field.path, %insight_id, added, "codings appended");
            insights.push(insight_extension(insight_id, &field, config));
        }
    }

    if insights.is_empty() {
        info!(resource_type = kind.resource_type(), %id, "no insights, resource unchanged");
        return Ok(None);
    }

    let count = insights.len();
    let insights = insights
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| InsightError::MalformedResource(err.to_string()))?;
    meta_extensions(&mut resource)?.extend(insights);
    info!(resource_type = kind.resource_type(), %id, insights = count, "resource enriched");

    let mut assembler = BundleAssembler::new();
    assembler.add_entry(
        EntryResource::Structured(resource),
        BundleRequest::put(kind.resource_type(), &id),
    );
    Ok(Some(assembler.finish()))
}

/// UMLS first, then every other system's comma-delimited codes.
fn concept_codings(
    concept: &Concept,
    insight_id: InsightId,
    config: &InsightConfig,
) -> Vec<Coding> {
    let systems = &config.coding;
    let tag = |coding: Coding| {
        coding
            .with_extension(derived_by_nlp_extension())
            .with_extension(Extension::insight_reference(
                &config.insight_id_system,
                insight_id.to_string(),
            ))
    };

    let mut codings = vec![tag(Coding::new(
        &systems.umls,
        &concept.cui,
        concept.preferred_name.as_deref(),
    ))];
    for (system, codes) in concept.code_lists(systems) {
        codings.extend(
            codes
                .into_iter()
                .flat_map(split_codes)
                .map(|code| tag(Coding::new(system, code, None))),
        );
    }
    codings
}

fn is_derived_coding(coding: &Value, system: &str, code: &str) -> bool {
    coding.get("system").and_then(Value::as_str) == Some(system)
        && coding.get("code").and_then(Value::as_str) == Some(code)
        && elements(coding, "extension")
            .any(|ext| ext.get("url").and_then(Value::as_str) == Some(INSIGHT_CATEGORY_URL))
}

/// Appends codings not already derived for this concept; returns how many.
///
/// A caller-supplied coding with the same system and code does not block the
/// derived one. The field is left untouched when nothing is new.
fn append_codings(codeable: &mut Value, codings: Vec<Coding>) -> Result<usize, InsightError> {
    let existing = codeable
        .get("coding")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut fresh: Vec<Value> = Vec::new();
    for coding in codings {
        if existing
            .iter()
            .chain(&fresh)
            .any(|known| is_derived_coding(known, &coding.system, &coding.code))
        {
            continue;
        }
        let value = serde_json::to_value(&coding)
            .map_err(|err| InsightError::MalformedResource(err.to_string()))?;
        fresh.push(value);
    }
    if fresh.is_empty() {
        return Ok(0);
    }

    let added = fresh.len();
    let object = codeable.as_object_mut().ok_or_else(|| {
        InsightError::MalformedResource("codeable concept is not an object".to_string())
    })?;
    let Value::Array(list) = object
        .entry("coding")
        .or_insert_with(|| Value::Array(Vec::new()))
    else {
        return Err(InsightError::MalformedResource("coding is not a list".to_string()));
    };
    list.extend(fresh);
    Ok(added)
}

fn insight_extension(
    insight_id: InsightId,
    field: &FieldOfInterest,
    config: &InsightConfig,
) -> Extension {
    let mut detail = Vec::new();
    if let Some(location) = &config.nlp_output_location {
        detail.push(Extension::attachment(INSIGHT_NLP_OUTPUT_URL, location.clone()));
    }
    detail.push(Extension::string(INSIGHT_REFERENCE_PATH_URL, field.path.clone()));

    Extension::complex(
        INSIGHT_URL,
        vec![
            Extension::identifier(
                INSIGHT_ID_URL,
                &config.insight_id_system,
                insight_id.to_string(),
            ),
            Extension::complex(INSIGHT_DETAIL_URL, detail),
        ],
    )
}

fn meta_extensions(resource: &mut Value) -> Result<&mut Vec<Value>, InsightError> {
    let malformed = |what: &str| InsightError::MalformedResource(format!("{what} is not valid"));
    let meta = resource
        .as_object_mut()
        .ok_or_else(|| malformed("resource"))?
        .entry("meta")
        .or_insert_with(|| Value::Object(Map::new()));
    let extension = meta
        .as_object_mut()
        .ok_or_else(|| malformed("meta"))?
        .entry("extension")
        .or_insert_with(|| Value::Array(Vec::new()));
    extension.as_array_mut().ok_or_else(|| malformed("meta.extension"))
}
