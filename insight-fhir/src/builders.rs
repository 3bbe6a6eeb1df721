//! Derived records and the builders that populate them from single mentions.

use insight_core::{
    Administration, AnnotationSet, AttributeValue, Concept, InsightConfig, MedicationAnnotation,
    Mention, ResourceReference,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dosage::{parse_dose, parse_frequency, Frequency, ParsedDose};
use crate::fhir::{
    derived_by_nlp_extension, AdverseEvent, Causality, CodeableConcept, Coding, Condition,
    DoseAndRate, Dosage, Extension, Identifier, MedicationStatement, Meta, Quantity,
    SuspectEntity, Timing,
};
use crate::provenance::{
    compose_at, ConfidenceKind, InsightId, InsightRecord, ProvenanceContext, ProvenanceEntry,
};

/// Placeholder for values the oracle did not supply.
pub const NOT_AVAILABLE: &str = "Not available";

const DEFAULT_STATUS: &str = "unknown";

/// Creates a record for a first-seen cui and folds later mentions into it.
pub trait ResourceBuilder<M: Mention + ?Sized> {
    type Record: InsightRecord;

    fn create(&self, mention: &M) -> Self::Record;

    fn populate(&self, record: &mut Self::Record, mention: &M, insight_id: InsightId);

    fn confidence_kind(&self) -> ConfidenceKind;
}

/// Medication name and codings; the name is fixed by the first mention.
#[derive(Debug, Clone, PartialEq)]
pub enum MedicationConcept {
    Uninitialized,
    Populated(CodeableConcept),
}

impl MedicationConcept {
    pub fn name(&self) -> Option<&str> {
        match self {
            MedicationConcept::Uninitialized => None,
            MedicationConcept::Populated(concept) => concept.text.as_deref(),
        }
    }

    pub fn codeable_concept(&self) -> Option<&CodeableConcept> {
        match self {
            MedicationConcept::Uninitialized => None,
            MedicationConcept::Populated(concept) => Some(concept),
        }
    }

    fn initialize(&mut self, name: &str) {
        if matches!(self, MedicationConcept::Uninitialized) {
            *self = MedicationConcept::Populated(CodeableConcept::with_text(name));
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimingCode {
    pub code: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DosageEntry {
    pub amount: Option<f64>,
    pub unit: Option<String>,
    pub timing: Option<TimingCode>,
    /// Frequency text that matched no known abbreviation.
    pub text: Option<String>,
    pub insight_id: InsightId,
}

impl DosageEntry {
    fn to_dosage(&self, config: &InsightConfig) -> Dosage {
        Dosage {
            extension: vec![Extension::insight_reference(
                &config.insight_id_system,
                self.insight_id.to_string(),
            )],
            text: self.text.clone(),
            timing: self.timing.as_ref().map(|timing| Timing {
                code: CodeableConcept {
                    coding: vec![Coding::new(
                        &config.coding.timing,
                        &timing.code,
                        Some(timing.code.as_str()),
                    )],
                    text: Some(timing.text.clone()),
                },
            }),
            dose_and_rate: self
                .amount
                .map(|value| DoseAndRate {
                    dose_quantity: Quantity {
                        value,
                        unit: self.unit.clone(),
                    },
                })
                .into_iter()
                .collect(),
        }
    }
}

/// Builds the dosage for one administration; `None` when it holds neither dose nor frequency.
pub fn dosage_entry(administration: &Administration, insight_id: InsightId) -> Option<DosageEntry> {
    if administration.dosage_value.is_none() && administration.frequency_value.is_none() {
        return None;
    }

    let ParsedDose { amount, unit } = administration
        .dosage_value
        .as_deref()
        .map(parse_dose)
        .unwrap_or_default();

    let (timing, text) = match administration.frequency_value.as_deref().map(parse_frequency) {
        Some(Frequency::Timed { code, text }) => (
            Some(TimingCode {
                code: code.to_string(),
                text,
            }),
            None,
        ),
        Some(Frequency::FreeText(text)) => (None, Some(text)),
        None => (None, None),
    };

    Some(DosageEntry {
        amount,
        unit,
        timing,
        text,
        insight_id,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct MedicationRecord {
    pub id: Uuid,
    pub cui: String,
    pub status: Option<String>,
    pub medication: MedicationConcept,
    pub dosage: Vec<DosageEntry>,
    pub subject: Option<ResourceReference>,
    insights: Vec<ProvenanceEntry>,
}

impl MedicationRecord {
    pub fn new(cui: impl Into<String>, subject: Option<ResourceReference>) -> Self {
        Self {
            id: Uuid::new_v4(),
            cui: cui.into(),
            status: None,
            medication: MedicationConcept::Uninitialized,
            dosage: Vec::new(),
            subject,
            insights: Vec::new(),
        }
    }

    pub fn surface_name(&self) -> Option<&str> {
        self.medication.name()
    }

    /// `urn:uuid:` reference used inside the transaction bundle.
    pub fn reference(&self) -> ResourceReference {
        ResourceReference::to(format!("urn:uuid:{}", self.id))
    }

    pub fn to_resource(&self, config: &InsightConfig) -> MedicationStatement {
        MedicationStatement {
            id: self.id.to_string(),
            meta: meta_for(&self.insights),
            extension: vec![derived_by_nlp_extension()],
            status: self
                .status
                .clone()
                .unwrap_or_else(|| DEFAULT_STATUS.to_string()),
            medication_codeable_concept: self.medication.codeable_concept().cloned(),
            dosage: self
                .dosage
                .iter()
                .map(|entry| entry.to_dosage(config))
                .collect(),
            subject: self.subject.clone(),
        }
    }
}

impl InsightRecord for MedicationRecord {
    fn insights(&self) -> &[ProvenanceEntry] {
        &self.insights
    }

    fn push_insight(&mut self, entry: ProvenanceEntry) {
        self.insights.push(entry);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionRecord {
    pub id: Uuid,
    pub cui: String,
    pub code: Option<CodeableConcept>,
    pub subject: Option<ResourceReference>,
    insights: Vec<ProvenanceEntry>,
}

impl ConditionRecord {
    pub fn new(cui: impl Into<String>, subject: Option<ResourceReference>) -> Self {
        Self {
            id: Uuid::new_v4(),
            cui: cui.into(),
            code: None,
            subject,
            insights: Vec::new(),
        }
    }

    pub fn to_resource(&self) -> Condition {
        Condition {
            id: self.id.to_string(),
            meta: meta_for(&self.insights),
            extension: vec![derived_by_nlp_extension()],
            code: self.code.clone(),
            subject: self.subject.clone(),
        }
    }
}

impl InsightRecord for ConditionRecord {
    fn insights(&self) -> &[ProvenanceEntry] {
        &self.insights
    }

    fn push_insight(&mut self, entry: ProvenanceEntry) {
        self.insights.push(entry);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actuality {
    Actual,
    Potential,
}

impl Actuality {
    /// A considering score under `threshold` is reported as actual; no score is potential.
    pub fn from_considering_score(score: Option<f64>, threshold: f64) -> Self {
        match score {
            Some(score) if score < threshold => Actuality::Actual,
            _ => Actuality::Potential,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Actuality::Actual => "actual",
            Actuality::Potential => "potential",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeddraPair {
    pub system: String,
    pub code: String,
    pub display: String,
}

/// Adverse event linked to one medication. Fields are fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct AdverseEventRecord {
    id: Uuid,
    meddra: MeddraPair,
    actuality: Actuality,
    suspect: ResourceReference,
    causality: String,
    subject: Option<ResourceReference>,
    insights: Vec<ProvenanceEntry>,
}

impl AdverseEventRecord {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn meddra(&self) -> &MeddraPair {
        &self.meddra
    }

    pub fn actuality(&self) -> Actuality {
        self.actuality
    }

    pub fn suspect(&self) -> &ResourceReference {
        &self.suspect
    }

    pub fn causality(&self) -> &str {
        &self.causality
    }

    pub fn insights(&self) -> &[ProvenanceEntry] {
        &self.insights
    }

    pub fn to_resource(&self) -> AdverseEvent {
        let coding = Coding::new(
            &self.meddra.system,
            &self.meddra.code,
            Some(self.meddra.display.as_str()),
        );
        AdverseEvent {
            id: self.id.to_string(),
            meta: meta_for(&self.insights),
            extension: vec![derived_by_nlp_extension()],
            identifier: Identifier {
                kind: Some(CodeableConcept {
                    coding: vec![coding],
                    text: Some(self.meddra.display.clone()),
                }),
                system: Some(self.meddra.system.clone()),
                value: Some(self.meddra.code.clone()),
            },
            actuality: self.actuality.as_str().to_string(),
            subject: self.subject.clone(),
            suspect_entity: vec![SuspectEntity {
                instance: self.suspect.clone(),
                causality: vec![Causality {
                    product_relatedness: self.causality.clone(),
                }],
            }],
        }
    }
}

fn meta_for(insights: &[ProvenanceEntry]) -> Meta {
    Meta {
        extension: insights.iter().map(ProvenanceEntry::to_extension).collect(),
    }
}

pub(crate) fn split_codes(codes: &str) -> impl Iterator<Item = &str> {
    codes
        .split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty())
}

#[derive(Debug, Clone)]
pub struct MedicationBuilder<'a> {
    config: &'a InsightConfig,
    subject: Option<ResourceReference>,
}

impl<'a> MedicationBuilder<'a> {
    pub fn new(config: &'a InsightConfig, subject: Option<ResourceReference>) -> Self {
        Self { config, subject }
    }

    fn tagged(
        &self,
        system: &str,
        code: &str,
        display: Option<&str>,
        insight_id: InsightId,
    ) -> Coding {
        Coding::new(system, code, display).with_extension(Extension::insight_reference(
            &self.config.insight_id_system,
            insight_id.to_string(),
        ))
    }

    /// Sets status and name on first population, then appends codings.
    fn apply(
        &self,
        record: &mut MedicationRecord,
        name: &str,
        cui: &str,
        rx_norm: Option<&str>,
        insight_id: InsightId,
    ) {
        record
            .status
            .get_or_insert_with(|| DEFAULT_STATUS.to_string());
        record.medication.initialize(name);

        let MedicationConcept::Populated(concept) = &mut record.medication else {
            return;
        };

        let systems = &self.config.coding;
        concept.add_coding(self.tagged(&systems.umls, cui, Some(name), insight_id));
        for code in rx_norm.into_iter().flat_map(split_codes) {
            concept.add_coding(self.tagged(&systems.rxnorm, code, None, insight_id));
        }
    }
}

impl ResourceBuilder<Concept> for MedicationBuilder<'_> {
    type Record = MedicationRecord;

    fn create(&self, mention: &Concept) -> MedicationRecord {
        MedicationRecord::new(&mention.cui, self.subject.clone())
    }

    fn populate(&self, record: &mut MedicationRecord, mention: &Concept, insight_id: InsightId) {
        let name = mention
            .preferred_name
            .as_deref()
            .or(mention.covered_text())
            .unwrap_or(&mention.cui);
        self.apply(
            record,
            name,
            &mention.cui,
            mention.rx_norm_id.as_deref(),
            insight_id,
        );
    }

    fn confidence_kind(&self) -> ConfidenceKind {
        ConfidenceKind::Medication
    }
}

impl ResourceBuilder<MedicationAnnotation> for MedicationBuilder<'_> {
    type Record = MedicationRecord;

    fn create(&self, mention: &MedicationAnnotation) -> MedicationRecord {
        MedicationRecord::new(&mention.cui, self.subject.clone())
    }

    fn populate(
        &self,
        record: &mut MedicationRecord,
        mention: &MedicationAnnotation,
        insight_id: InsightId,
    ) {
        let drug = mention.drug_name();
        if drug.is_none() {
            warn!(cui = %mention.cui, "medication annotation has no drug name, using covered text");
        }

        let name = drug
            .and_then(|drug| drug.drug_surface_form.as_deref())
            .or(mention.covered_text())
            .unwrap_or(&mention.cui);
        let cui = drug
            .and_then(|drug| drug.cui.as_deref())
            .unwrap_or(&mention.cui);
        self.apply(
            record,
            name,
            cui,
            drug.and_then(|drug| drug.rx_norm_id.as_deref()),
            insight_id,
        );

        if let Some(entry) = mention
            .administration()
            .and_then(|administration| dosage_entry(administration, insight_id))
        {
            record.dosage.push(entry);
        }
    }

    fn confidence_kind(&self) -> ConfidenceKind {
        ConfidenceKind::Medication
    }
}

#[derive(Debug, Clone)]
pub struct ConditionBuilder<'a> {
    config: &'a InsightConfig,
    subject: Option<ResourceReference>,
}

impl<'a> ConditionBuilder<'a> {
    pub fn new(config: &'a InsightConfig, subject: Option<ResourceReference>) -> Self {
        Self { config, subject }
    }
}

impl ResourceBuilder<Concept> for ConditionBuilder<'_> {
    type Record = ConditionRecord;

    fn create(&self, mention: &Concept) -> ConditionRecord {
        ConditionRecord::new(&mention.cui, self.subject.clone())
    }

    fn populate(&self, record: &mut ConditionRecord, mention: &Concept, insight_id: InsightId) {
        let name = mention
            .preferred_name
            .as_deref()
            .or(mention.covered_text())
            .unwrap_or(&mention.cui);
        let code = record
            .code
            .get_or_insert_with(|| CodeableConcept::with_text(name));

        let systems = &self.config.coding;
        let tag = || {
            Extension::insight_reference(&self.config.insight_id_system, insight_id.to_string())
        };

        code.add_coding(
            Coding::new(&systems.umls, &mention.cui, mention.preferred_name.as_deref())
                .with_extension(tag()),
        );
        for (system, codes) in mention.code_lists(systems) {
            for value in codes.into_iter().flat_map(split_codes) {
                code.add_coding(Coding::new(system, value, None).with_extension(tag()));
            }
        }
    }

    fn confidence_kind(&self) -> ConfidenceKind {
        ConfidenceKind::Diagnosis
    }
}

#[derive(Debug, Clone)]
pub struct AdverseEventBuilder<'a> {
    config: &'a InsightConfig,
    subject: Option<ResourceReference>,
}

impl<'a> AdverseEventBuilder<'a> {
    pub fn new(config: &'a InsightConfig, subject: Option<ResourceReference>) -> Self {
        Self { config, subject }
    }

    pub fn accepts(&self, attribute: &AttributeValue) -> bool {
        attribute.name == self.config.adverse_event_attribute
    }

    /// Builds the event for `attribute` against its linked medication.
    pub fn build(
        &self,
        attribute: &AttributeValue,
        medication: &MedicationRecord,
        annotations: &AnnotationSet,
        context: &ProvenanceContext,
    ) -> Option<AdverseEventRecord> {
        if !self.accepts(attribute) {
            return None;
        }

        let model = attribute.insight_model_data.as_ref();
        let meddra = model.and_then(|data| data.meddra_code());
        let meddra = MeddraPair {
            system: self.config.coding.meddra.clone(),
            code: meddra
                .and_then(|m| m.meddra_code.clone())
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            display: meddra
                .and_then(|m| m.pref_name.clone())
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        };

        let score = model.and_then(|data| data.adverse_event_considering_score());
        let actuality = Actuality::from_considering_score(score, self.config.actuality_threshold);

        let medication_name = medication
            .surface_name()
            .or(attribute.preferred_name.as_deref())
            .unwrap_or(NOT_AVAILABLE);
        let evidence = attribute
            .first_evidence_uid()
            .and_then(|uid| annotations.sentence_text(uid))
            .unwrap_or(NOT_AVAILABLE);

        debug!(
            medication = %medication.id,
            code = %meddra.code,
            actuality = actuality.as_str(),
            "linked adverse event"
        );

        let insight = compose_at(
            attribute.span(),
            attribute.covered_text.as_deref(),
            model,
            InsightId::new(1),
            ConfidenceKind::Medication,
            context,
        );

        Some(AdverseEventRecord {
            id: Uuid::new_v4(),
            meddra,
            actuality,
            suspect: medication.reference(),
            causality: format!(
                "Target medication = '{medication_name}'. Evidence = '{evidence}'"
            ),
            subject: self.subject.clone(),
            insights: vec![insight],
        })
    }
}
