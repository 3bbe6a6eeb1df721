use std::fs;
use std::sync::Arc;

use insight_core::{InsightConfig, InsightError, OracleError, ResourceReference, SourceDocument};
use insight_fhir::fhir::{
    AdverseEvent, Condition, Extension, MedicationStatement, Meta, Resource, INSIGHT_BASED_ON_URL,
    INSIGHT_CONFIDENCE_URL, INSIGHT_DETAIL_URL, INSIGHT_ID_URL, INSIGHT_NLP_OUTPUT_URL,
    INSIGHT_RESULT_URL, INSIGHT_SPAN_COVERED_TEXT_URL, INSIGHT_SPAN_OFFSET_BEGIN_URL,
    INSIGHT_SPAN_OFFSET_END_URL, INSIGHT_SPAN_URL,
};
use insight_fhir::{
    derive_bundle, derive_bundle_with, synthesize_bundle_str, Bundle, Oracle, ReplayOracle,
    ServiceRegistry,
};
use serde_json::Value;

fn fixture_path(name: &str) -> String {
    format!("{}/tests/data/{name}", env!("CARGO_MANIFEST_DIR"))
}

fn fixture(name: &str) -> String {
    fs::read_to_string(fixture_path(name)).expect("fixture is readable")
}

fn discharge_bundle() -> Bundle {
    synthesize_bundle_str(
        &fixture("discharge_note.txt"),
        &fixture("discharge_note_annotations.json"),
        &InsightConfig::default(),
    )
    .expect("bundle is synthesized")
}

fn medication_statements(bundle: &Bundle) -> Vec<&MedicationStatement> {
    bundle
        .entries()
        .iter()
        .filter_map(|entry| match entry.resource.derived() {
            Some(Resource::MedicationStatement(resource)) => Some(resource),
            _ => None,
        })
        .collect()
}

fn adverse_events(bundle: &Bundle) -> Vec<&AdverseEvent> {
    bundle
        .entries()
        .iter()
        .filter_map(|entry| match entry.resource.derived() {
            Some(Resource::AdverseEvent(resource)) => Some(resource),
            _ => None,
        })
        .collect()
}

fn conditions(bundle: &Bundle) -> Vec<&Condition> {
    bundle
        .entries()
        .iter()
        .filter_map(|entry| match entry.resource.derived() {
            Some(Resource::Condition(resource)) => Some(resource),
            _ => None,
        })
        .collect()
}

fn child<'a>(extension: &'a Extension, url: &str) -> Option<&'a Extension> {
    extension.extension.iter().find(|ext| ext.url == url)
}

fn insight_ids(meta: &Meta) -> Vec<String> {
    meta.extension
        .iter()
        .filter_map(|insight| child(insight, INSIGHT_ID_URL))
        .filter_map(|id| id.value_identifier.as_ref())
        .filter_map(|id| id.value.clone())
        .collect()
}

fn insight_result(insight: &Extension) -> &Extension {
    child(insight, INSIGHT_DETAIL_URL)
        .and_then(|detail| child(detail, INSIGHT_RESULT_URL))
        .expect("insight carries a result")
}

fn insight_span(insight: &Extension) -> (Option<String>, i64, i64) {
    let span = child(insight_result(insight), INSIGHT_SPAN_URL).expect("result carries a span");
    let offset = |url: &str| {
        child(span, url)
            .and_then(|ext| ext.value_integer)
            .expect("span offset present")
    };
    (
        child(span, INSIGHT_SPAN_COVERED_TEXT_URL).and_then(|ext| ext.value_string.clone()),
        offset(INSIGHT_SPAN_OFFSET_BEGIN_URL),
        offset(INSIGHT_SPAN_OFFSET_END_URL),
    )
}

fn confidence_count(insight: &Extension) -> usize {
    insight_result(insight)
        .extension
        .iter()
        .filter(|ext| ext.url == INSIGHT_CONFIDENCE_URL)
        .count()
}

#[test]
fn bundle_lists_conditions_then_medications_then_adverse_events() {
    let bundle = discharge_bundle();

    assert_eq!(bundle.resource_type, "Bundle");
    assert_eq!(bundle.bundle_type, "transaction");

    let types: Vec<&str> = bundle
        .entries()
        .iter()
        .map(|entry| entry.resource.resource_type())
        .collect();
    assert_eq!(
        types,
        vec!["Condition", "Condition", "MedicationStatement", "AdverseEvent"]
    );

    for entry in bundle.entries() {
        let id = entry.resource.id().expect("derived resources carry an id");
        assert_eq!(entry.full_url, Some(format!("urn:uuid:{id}")));
        assert_eq!(entry.request.method, "POST");
        assert_eq!(entry.request.url, entry.resource.resource_type());
    }
}

#[test]
fn repeated_medication_mentions_fold_into_one_statement() {
    let bundle = discharge_bundle();
    let statements = medication_statements(&bundle);
    assert_eq!(statements.len(), 1);

    let statement = statements[0];
    assert_eq!(statement.status, "unknown");
    assert_eq!(
        insight_ids(&statement.meta),
        vec!["insight-1", "insight-2", "insight-3"]
    );

    let medication = statement
        .medication_codeable_concept
        .as_ref()
        .expect("medication is populated");
    assert_eq!(medication.text.as_deref(), Some("lisinopril"));
    assert_eq!(medication.coding.len(), 2);
    assert!(medication
        .coding
        .iter()
        .all(|coding| coding.insight_id() == Some("insight-1")));

    let config = InsightConfig::default();
    assert!(medication
        .find_coding(&config.coding.umls, "C0065374")
        .is_some());
    assert!(medication
        .find_coding(&config.coding.rxnorm, "29046")
        .is_some());
}

#[test]
fn medication_name_is_set_once_while_codings_accumulate() {
    let text = "lisinopril then Zestril.";
    let annotations = r#"{
        "concepts": [
            {
                "cui": "C1", "type": "umls.ClinicalDrug", "begin": 0, "end": 10,
                "preferredName": "lisinopril", "rxNormID": "29046"
            },
            {
                "cui": "C1", "type": "umls.ClinicalDrug", "begin": 16, "end": 23,
                "preferredName": "Zestril", "rxNormID": "29046, 203644"
            }
        ]
    }"#;

    let bundle = synthesize_bundle_str(text, annotations, &InsightConfig::default())
        .expect("bundle is synthesized");
    let statements = medication_statements(&bundle);
    assert_eq!(statements.len(), 1);
    assert_eq!(insight_ids(&statements[0].meta), vec!["insight-1", "insight-2"]);

    let medication = statements[0]
        .medication_codeable_concept
        .as_ref()
        .expect("medication is populated");
    assert_eq!(medication.text.as_deref(), Some("lisinopril"));

    let config = InsightConfig::default();
    let insight_of = |code: &str| {
        medication
            .find_coding(&config.coding.rxnorm, code)
            .and_then(|coding| coding.insight_id())
            .map(str::to_string)
    };
    assert_eq!(insight_of("29046").as_deref(), Some("insight-1"));
    assert_eq!(insight_of("203644").as_deref(), Some("insight-2"));
    assert_eq!(medication.coding.len(), 3);
}

#[test]
fn dosage_entries_follow_each_medication_indication() {
    let bundle = discharge_bundle();
    let statement = medication_statements(&bundle)[0];
    assert_eq!(statement.dosage.len(), 2);

    let morning = &statement.dosage[0];
    assert_eq!(morning.dose_and_rate[0].dose_quantity.value, 10.0);
    assert_eq!(morning.dose_and_rate[0].dose_quantity.unit.as_deref(), Some("mg"));
    let timing = morning.timing.as_ref().expect("Q AM maps to a timing code");
    assert_eq!(timing.code.coding[0].code, "AM");
    assert_eq!(timing.code.text.as_deref(), Some("Q AM"));
    assert_eq!(morning.text, None);
    assert_eq!(
        morning.extension[0]
            .value_identifier
            .as_ref()
            .and_then(|id| id.value.as_deref()),
        Some("insight-1")
    );

    let nightly = &statement.dosage[1];
    assert_eq!(nightly.dose_and_rate[0].dose_quantity.value, 1000.0);
    assert_eq!(nightly.dose_and_rate[0].dose_quantity.unit.as_deref(), Some("mg"));
    assert!(nightly.timing.is_none());
    assert_eq!(nightly.text.as_deref(), Some("nightly"));
    assert_eq!(
        nightly.extension[0]
            .value_identifier
            .as_ref()
            .and_then(|id| id.value.as_deref()),
        Some("insight-2")
    );
}

#[test]
fn medication_insights_keep_their_spans() {
    let bundle = discharge_bundle();
    let statement = medication_statements(&bundle)[0];

    let spans: Vec<_> = statement.meta.extension.iter().map(insight_span).collect();
    assert_eq!(
        spans,
        vec![
            (Some("lisinopril".to_string()), 14, 24),
            (Some("lisinopril".to_string()), 77, 87),
            (Some("Lisinopril".to_string()), 37, 47),
        ]
    );

    // taken, considering, discussed and lab measurement scores
    assert_eq!(confidence_count(&statement.meta.extension[0]), 4);
    assert_eq!(confidence_count(&statement.meta.extension[1]), 0);
}

#[test]
fn adverse_event_links_only_on_exact_span() {
    let bundle = discharge_bundle();
    let statement = medication_statements(&bundle)[0];
    let events = adverse_events(&bundle);

    // the attribute ending one character later finds no medication and is dropped
    assert_eq!(events.len(), 1);

    let event = events[0];
    assert_eq!(event.actuality, "actual");
    assert_eq!(event.identifier.value.as_deref(), Some("10011224"));
    assert_eq!(event.identifier.system.as_deref(), Some("meddra"));
    assert_eq!(
        event
            .identifier
            .kind
            .as_ref()
            .and_then(|kind| kind.text.as_deref()),
        Some("Cough")
    );

    let suspect = &event.suspect_entity[0];
    assert_eq!(
        suspect.instance.reference,
        Some(format!("urn:uuid:{}", statement.id))
    );
    assert_eq!(
        suspect.causality[0].product_relatedness,
        "Target medication = 'lisinopril'. Evidence = 'Lisinopril caused a dry cough.'"
    );
    assert_eq!(insight_ids(&event.meta), vec!["insight-1"]);
}

#[test]
fn condition_mentions_share_one_condition_per_cui() {
    let bundle = discharge_bundle();
    let conditions = conditions(&bundle);
    assert_eq!(conditions.len(), 2);

    let diabetes = conditions[0];
    assert_eq!(insight_ids(&diabetes.meta), vec!["insight-1", "insight-2"]);

    let code = diabetes.code.as_ref().expect("condition is coded");
    assert_eq!(code.text.as_deref(), Some("Diabetes Mellitus"));
    assert_eq!(code.coding.len(), 4);

    let config = InsightConfig::default();
    assert!(code.find_coding(&config.coding.snomed, "73211009").is_some());
    assert!(code.find_coding(&config.coding.icd10, "E11.9").is_some());
    assert!(code.find_coding(&config.coding.icd10, "E10.9").is_some());

    // explicit, patient reported, discussed, family history and suspected scores
    assert_eq!(confidence_count(&diabetes.meta.extension[0]), 5);
    assert_eq!(confidence_count(&diabetes.meta.extension[1]), 0);

    let cough = conditions[1];
    assert_eq!(
        cough.code.as_ref().and_then(|code| code.text.as_deref()),
        Some("Coughing")
    );
    assert_eq!(insight_ids(&cough.meta), vec!["insight-1"]);
}

#[test]
fn repeated_runs_differ_only_in_generated_identity() {
    let mut first = serde_json::to_value(discharge_bundle()).expect("bundle serializes");
    let mut second = serde_json::to_value(discharge_bundle()).expect("bundle serializes");

    normalize_dynamic_fields(&mut first);
    normalize_dynamic_fields(&mut second);

    assert_eq!(first, second);
}

#[test]
fn discharge_note_bundle_matches_golden() {
    let mut actual = serde_json::to_value(discharge_bundle()).expect("bundle serializes");
    let mut expected: Value =
        serde_json::from_str(&fixture("discharge_note_bundle.json")).expect("golden json parses");

    normalize_dynamic_fields(&mut actual);
    normalize_dynamic_fields(&mut expected);

    assert_eq!(actual, expected);
}

#[test]
fn medication_indications_need_the_enrichment_capability() {
    let text = fixture("discharge_note.txt");
    let annotations = fixture("discharge_note_annotations.json");
    let config = InsightConfig::default();
    let document = SourceDocument::new("DocumentReference", text);

    let plain = ReplayOracle::from_json("acd", &annotations).expect("annotations parse");
    assert!(plain.medication_enrichment().is_none());
    let bundle = derive_bundle(&document, &plain, &config).expect("bundle is derived");

    let statement = medication_statements(&bundle)[0];
    assert_eq!(insight_ids(&statement.meta), vec!["insight-1"]);
    assert!(statement.dosage.is_empty());
    assert_eq!(adverse_events(&bundle).len(), 1);

    let enriched = plain.with_medication_enrichment();
    let bundle = derive_bundle(&document, &enriched, &config).expect("bundle is derived");
    let statement = medication_statements(&bundle)[0];
    assert_eq!(insight_ids(&statement.meta).len(), 3);
    assert_eq!(statement.dosage.len(), 2);
}

#[test]
fn source_document_and_output_location_reach_provenance() {
    let mut document = SourceDocument::new("DocumentReference", fixture("discharge_note.txt"));
    document.id = Some("doc-1".to_string());
    document.subject = Some(ResourceReference::to("Patient/7"));

    let config = InsightConfig {
        nlp_output_location: Some("s3://nlp-output/doc-1.json".to_string()),
        ..InsightConfig::default()
    };

    let mut registry = ServiceRegistry::new();
    registry.register(
        "acd",
        Arc::new(
            ReplayOracle::from_json("acd", &fixture("discharge_note_annotations.json"))
                .expect("annotations parse")
                .with_medication_enrichment(),
        ),
    );
    registry.activate("acd").expect("service is registered");

    let bundle = derive_bundle_with(&registry, &document, &config).expect("bundle is derived");
    let statement = medication_statements(&bundle)[0];
    assert_eq!(
        statement.subject.as_ref().and_then(|s| s.reference.as_deref()),
        Some("Patient/7")
    );

    let detail = child(&statement.meta.extension[0], INSIGHT_DETAIL_URL).expect("detail present");
    assert_eq!(
        child(detail, INSIGHT_BASED_ON_URL)
            .and_then(|ext| ext.value_reference.as_ref())
            .and_then(|reference| reference.reference.as_deref()),
        Some("DocumentReference/doc-1")
    );
    assert_eq!(
        child(detail, INSIGHT_NLP_OUTPUT_URL)
            .and_then(|ext| ext.value_attachment.as_ref())
            .map(|attachment| attachment.url.as_str()),
        Some("s3://nlp-output/doc-1.json")
    );

    let event = adverse_events(&bundle)[0];
    assert_eq!(
        event.subject.as_ref().and_then(|s| s.reference.as_deref()),
        Some("Patient/7")
    );
}

#[test]
fn adverse_event_links_to_the_repeated_indication() {
    let text = "Ibuprofen 200 mg. Ibuprofen gave her a rash.";
    let annotations = r#"{
        "sentences": [{ "begin": 0, "end": 17, "uid": 1 }, { "begin": 18, "end": 44, "uid": 2 }],
        "MedicationInd": [
            {
                "cui": "C0020740", "begin": 0, "end": 9,
                "drug": [{ "name1": [{ "drugSurfaceForm": "Ibuprofen", "cui": "C0020740" }] }],
                "administration": [{ "dosageValue": "200 mg" }]
            },
            {
                "cui": "C0020740", "begin": 18, "end": 27,
                "drug": [{ "name1": [{ "drugSurfaceForm": "Ibuprofen", "cui": "C0020740" }] }]
            }
        ],
        "attributeValues": [
            { "name": "MedicationAdverseEvent", "begin": 18, "end": 27, "evidenceSpans": [{ "uid": 2 }] }
        ]
    }"#;

    let bundle = synthesize_bundle_str(text, annotations, &InsightConfig::default())
        .expect("bundle is synthesized");

    let statements = medication_statements(&bundle);
    assert_eq!(statements.len(), 1);
    assert_eq!(insight_ids(&statements[0].meta), vec!["insight-1", "insight-2"]);
    assert_eq!(statements[0].dosage.len(), 1);

    let events = adverse_events(&bundle);
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].suspect_entity[0].instance.reference,
        Some(format!("urn:uuid:{}", statements[0].id))
    );
    assert_eq!(
        events[0].suspect_entity[0].causality[0].product_relatedness,
        "Target medication = 'Ibuprofen'. Evidence = 'Ibuprofen gave her a rash.'"
    );
}

#[test]
fn registry_without_active_service_cannot_derive() {
    let registry = ServiceRegistry::new();
    let document = SourceDocument::new("DocumentReference", "Aspirin daily.");

    let err = derive_bundle_with(&registry, &document, &InsightConfig::default())
        .expect_err("no service is active");
    assert!(matches!(err, InsightError::UnknownService(_)));
}

#[test]
fn adverse_event_without_scores_or_evidence_uses_placeholders() {
    let text = "Aspirin upset the stomach.";
    let annotations = r#"{
        "sentences": [{ "begin": 0, "end": 26, "uid": 1 }],
        "concepts": [
            { "cui": "C0004057", "type": "umls.ClinicalDrug", "preferredName": "aspirin", "begin": 0, "end": 7 }
        ],
        "attributeValues": [
            { "name": "MedicationAdverseEvent", "begin": 0, "end": 7, "evidenceSpans": [{ "uid": 9 }] }
        ]
    }"#;

    let bundle = synthesize_bundle_str(text, annotations, &InsightConfig::default())
        .expect("bundle is synthesized");
    let event = adverse_events(&bundle)[0];

    assert_eq!(event.actuality, "potential");
    assert_eq!(event.identifier.value.as_deref(), Some("Not available"));
    assert_eq!(
        event.suspect_entity[0].causality[0].product_relatedness,
        "Target medication = 'aspirin'. Evidence = 'Not available'"
    );
}

#[test]
fn considering_score_at_threshold_is_potential() {
    let text = "Aspirin upset the stomach.";
    let annotations = r#"{
        "concepts": [
            { "cui": "C0004057", "type": ["umls.ClinicalDrug"], "begin": 0, "end": 7 }
        ],
        "attributeValues": [
            {
                "name": "MedicationAdverseEvent", "begin": 0, "end": 7,
                "insightModelData": { "medication": { "adverseEvent": { "usage": { "consideringScore": 0.5 } } } }
            }
        ]
    }"#;

    let bundle = synthesize_bundle_str(text, annotations, &InsightConfig::default())
        .expect("bundle is synthesized");
    assert_eq!(adverse_events(&bundle)[0].actuality, "potential");
}

#[test]
fn failing_oracle_aborts_the_document() {
    let oracle = ReplayOracle::failing("acd", OracleError::Unavailable("503".to_string()));
    let document = SourceDocument::new("DocumentReference", "Aspirin daily.");

    let err = derive_bundle(&document, &oracle, &InsightConfig::default())
        .expect_err("oracle failure is fatal");
    assert!(matches!(
        err,
        InsightError::OracleFailure(OracleError::Unavailable(_))
    ));
}

#[test]
fn spans_past_the_text_abort_the_document() {
    let err = synthesize_bundle_str(
        "too short",
        &fixture("discharge_note_annotations.json"),
        &InsightConfig::default(),
    )
    .expect_err("offsets exceed the text");

    assert!(matches!(err, InsightError::SpanOutOfRange { len: 9, .. }));
}

#[test]
fn concept_without_cui_is_malformed() {
    let err = synthesize_bundle_str(
        "Aspirin",
        r#"{ "concepts": [{ "begin": 0, "end": 7 }] }"#,
        &InsightConfig::default(),
    )
    .expect_err("cui is required");

    assert!(matches!(err, InsightError::MalformedAnnotation(_)));
}

#[test]
fn invalid_threshold_is_rejected_before_processing() {
    let config = InsightConfig {
        actuality_threshold: 1.5,
        ..InsightConfig::default()
    };

    let err = synthesize_bundle_str("Aspirin", "{}", &config).expect_err("threshold out of range");
    assert!(matches!(err, InsightError::Config(_)));
}

#[test]
fn empty_annotations_give_an_empty_transaction() {
    let bundle = synthesize_bundle_str("Nothing notable.", "{}", &InsightConfig::default())
        .expect("bundle is synthesized");
    assert!(bundle.entries().is_empty());

    let json: Value = serde_json::from_str(&bundle.to_json().expect("bundle serializes"))
        .expect("bundle json parses");
    assert_eq!(json["resourceType"], "Bundle");
    assert_eq!(json["type"], "transaction");
}

fn normalize_dynamic_fields(value: &mut Value) {
    match value {
        Value::Object(obj) => {
            for (key, field) in obj.iter_mut() {
                let dynamic = matches!(key.as_str(), "id" | "fullUrl" | "timestamp")
                    || field
                        .as_str()
                        .is_some_and(|text| text.starts_with("urn:uuid:"));
                if dynamic {
                    *field = Value::String("__DYNAMIC__".to_string());
                } else {
                    normalize_dynamic_fields(field);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(normalize_dynamic_fields),
        _ => {}
    }
}
