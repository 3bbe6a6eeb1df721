//! Clinical annotation output to a FHIR transaction bundle of derived resources.

pub mod aggregate;
pub mod builders;
pub mod bundle;
pub mod classify;
pub mod dosage;
pub mod enrich;
pub mod fhir;
pub mod normalize;
pub mod oracle;
pub mod provenance;
pub mod span_index;

use insight_core::{
    AnnotationSet, AttributeValue, Concept, InsightConfig, InsightError, MedicationAnnotation,
    Mention, SourceDocument, Span,
};
use tracing::{debug, info};

use crate::aggregate::{Aggregator, Processed};
use crate::builders::{
    AdverseEventBuilder, AdverseEventRecord, ConditionBuilder, ConditionRecord,
    MedicationBuilder, MedicationRecord,
};
use crate::bundle::BundleAssembler;
use crate::classify::ConceptClassifier;
use crate::fhir::Resource;
use crate::provenance::ProvenanceContext;
use crate::span_index::{SpanIndex, SpanIndexBuilder};

pub use crate::bundle::Bundle;
pub use crate::enrich::{enrich_resource, enrich_resource_with};
pub use crate::oracle::{
    MedicationEnrichment, MedicationIndications, Oracle, ReplayOracle, ServiceRegistry,
};

/// Synthesize a bundle from document text and the oracle's JSON output.
pub fn synthesize_bundle_str(
    text: &str,
    annotations_json: &str,
    config: &InsightConfig,
) -> Result<Bundle, InsightError> {
    let annotations: AnnotationSet = serde_json::from_str(annotations_json)
        .map_err(|err| InsightError::MalformedAnnotation(err.to_string()))?;
    let document = SourceDocument::new("DocumentReference", text);
    synthesize_bundle(&document, annotations, Some(&MedicationIndications), config)
}

/// Run the oracle over the document, then synthesize its bundle.
pub fn derive_bundle(
    document: &SourceDocument,
    oracle: &dyn Oracle,
    config: &InsightConfig,
) -> Result<Bundle, InsightError> {
    info!(
        service = oracle.name(),
        document = %document.resource_type,
        "calling annotation service"
    );
    let annotations = oracle.process(&document.extracted_text)?;
    synthesize_bundle(document, annotations, oracle.medication_enrichment(), config)
}

/// Run the registry's active service over the document.
pub fn derive_bundle_with(
    registry: &ServiceRegistry,
    document: &SourceDocument,
    config: &InsightConfig,
) -> Result<Bundle, InsightError> {
    let oracle = registry.active()?;
    derive_bundle(document, oracle.as_ref(), config)
}

/// Synthesize a bundle from an already computed annotation set.
///
/// Medications are aggregated before adverse events are linked to them. Any
/// error aborts the document before a bundle is assembled.
pub fn synthesize_bundle(
    document: &SourceDocument,
    mut annotations: AnnotationSet,
    enrichment: Option<&dyn MedicationEnrichment>,
    config: &InsightConfig,
) -> Result<Bundle, InsightError> {
    config.validate()?;
    normalize::normalize(&document.extracted_text, &mut annotations)?;

    let mut insights = DocumentInsights::new(document, config);

    for concept in annotations.concepts.iter() {
        insights.handle_condition(concept);
    }

    if let Some(enrichment) = enrichment {
        for medication in enrichment.medication_mentions(&annotations) {
            insights.handle_medication_indication(medication);
        }
    }
    for concept in annotations.concepts.iter() {
        insights.handle_medication_concept(concept);
    }

    let mut linked = insights.start_linking();
    for attribute in annotations.attribute_values.iter() {
        linked.handle_attribute(attribute, &annotations);
    }

    Ok(linked.finalize())
}

/// Per-document state; dropped with the invocation.
struct DocumentInsights<'a> {
    config: &'a InsightConfig,
    context: ProvenanceContext,
    medication_builder: MedicationBuilder<'a>,
    condition_builder: ConditionBuilder<'a>,
    medication_classifier: ConceptClassifier<'a>,
    condition_classifier: ConceptClassifier<'a>,
    conditions: Aggregator<ConditionRecord>,
    medications: Aggregator<MedicationRecord>,
    spans: SpanIndexBuilder,
    document: &'a SourceDocument,
}

impl<'a> DocumentInsights<'a> {
    fn new(document: &'a SourceDocument, config: &'a InsightConfig) -> Self {
        Self {
            config,
            context: ProvenanceContext::new(config, document),
            medication_builder: MedicationBuilder::new(config, document.subject.clone()),
            condition_builder: ConditionBuilder::new(config, document.subject.clone()),
            medication_classifier: ConceptClassifier::new(&config.medication_types),
            condition_classifier: ConceptClassifier::new(&config.condition_types),
            conditions: Aggregator::new(),
            medications: Aggregator::new(),
            spans: SpanIndexBuilder::new(),
            document,
        }
    }

    fn handle_condition(&mut self, concept: &Concept) {
        if !self.condition_classifier.matches(concept) {
            return;
        }
        self.conditions
            .process(&self.condition_builder, concept, &self.context);
    }

    fn handle_medication_indication(&mut self, medication: &MedicationAnnotation) {
        let processed = self
            .medications
            .process(&self.medication_builder, medication, &self.context);
        self.record_span(medication.span(), processed);
    }

    fn handle_medication_concept(&mut self, concept: &Concept) {
        if !self.medication_classifier.matches(concept) {
            return;
        }
        let processed = self
            .medications
            .process(&self.medication_builder, concept, &self.context);
        self.record_span(concept.span(), processed);
    }

    fn record_span(&mut self, span: Span, processed: Processed) {
        debug!(
            begin = span.begin,
            end = span.end,
            insight = %processed.insight_id,
            "medication span recorded"
        );
        self.spans.record(span, processed.index);
    }

    fn start_linking(self) -> LinkedInsights<'a> {
        LinkedInsights {
            adverse_event_builder: AdverseEventBuilder::new(
                self.config,
                self.document.subject.clone(),
            ),
            spans: self.spans.freeze(),
            config: self.config,
            context: self.context,
            conditions: self.conditions.into_records(),
            medications: self.medications.into_records(),
            adverse_events: Vec::new(),
        }
    }
}

/// Second pass: medication records are final and the span index is read-only.
struct LinkedInsights<'a> {
    config: &'a InsightConfig,
    context: ProvenanceContext,
    adverse_event_builder: AdverseEventBuilder<'a>,
    spans: SpanIndex,
    conditions: Vec<ConditionRecord>,
    medications: Vec<MedicationRecord>,
    adverse_events: Vec<AdverseEventRecord>,
}

impl LinkedInsights<'_> {
    fn handle_attribute(&mut self, attribute: &AttributeValue, annotations: &AnnotationSet) {
        if !self.adverse_event_builder.accepts(attribute) {
            return;
        }

        let span = attribute.span();
        let Some(medication) = self
            .spans
            .first(span)
            .and_then(|index| self.medications.get(index))
        else {
            debug!(
                begin = span.begin,
                end = span.end,
                "no medication at adverse event span, dropped"
            );
            return;
        };

        if let Some(event) =
            self.adverse_event_builder
                .build(attribute, medication, annotations, &self.context)
        {
            self.adverse_events.push(event);
        }
    }

    fn finalize(self) -> Bundle {
        let mut assembler = BundleAssembler::new();
        assembler.extend(
            self.conditions
                .iter()
                .map(|record| Resource::Condition(record.to_resource())),
        );
        assembler.extend(
            self.medications
                .iter()
                .map(|record| Resource::MedicationStatement(record.to_resource(self.config))),
        );
        assembler.extend(
            self.adverse_events
                .iter()
                .map(|record| Resource::AdverseEvent(record.to_resource())),
        );

        info!(
            conditions = self.conditions.len(),
            medications = self.medications.len(),
            adverse_events = self.adverse_events.len(),
            "bundle assembled"
        );

        assembler.finish()
    }
}
