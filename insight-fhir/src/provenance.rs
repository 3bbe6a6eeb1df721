//! Per-mention insight entries kept in each derived resource's meta.

use std::fmt;

use insight_core::{
    InsightConfig, InsightModelData, Mention, ResourceReference, SourceDocument, Span,
};

use crate::fhir::{
    Extension, INSIGHT_BASED_ON_URL, INSIGHT_CONFIDENCE_NAME_URL, INSIGHT_CONFIDENCE_SCORE_URL,
    INSIGHT_CONFIDENCE_URL, INSIGHT_DETAIL_URL, INSIGHT_ID_URL, INSIGHT_NLP_OUTPUT_URL,
    INSIGHT_RESULT_URL, INSIGHT_SPAN_COVERED_TEXT_URL, INSIGHT_SPAN_OFFSET_BEGIN_URL,
    INSIGHT_SPAN_OFFSET_END_URL, INSIGHT_SPAN_URL, INSIGHT_URL,
};

pub const CONFIDENCE_SCORE_EXPLICIT: &str = "Explicit Score";
pub const CONFIDENCE_SCORE_PATIENT_REPORTED: &str = "Patient Reported Score";
pub const CONFIDENCE_SCORE_DISCUSSED: &str = "Discussed Score";
pub const CONFIDENCE_SCORE_SUSPECTED: &str = "Suspected Score";
pub const CONFIDENCE_SCORE_FAMILY_HISTORY: &str = "Family History Score";
pub const CONFIDENCE_SCORE_MEDICATION_TAKEN: &str = "Medication Taken Score";
pub const CONFIDENCE_SCORE_MEDICATION_CONSIDERING: &str = "Medication Considering Score";
pub const CONFIDENCE_SCORE_MEDICATION_DISCUSSED: &str = "Medication Discussed Score";
pub const CONFIDENCE_SCORE_MEDICATION_MEASUREMENT: &str = "Medication Lab Measurement Score";

/// Sequential, 1-based insight number within one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsightId(u32);

impl InsightId {
    pub fn new(number: u32) -> Self {
        Self(number)
    }

    pub fn number(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InsightId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "insight-{}", self.0)
    }
}

/// Which family of oracle sub-scores a record reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceKind {
    Medication,
    Diagnosis,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Confidence {
    pub name: &'static str,
    pub score: f64,
}

/// Document-wide values every entry repeats.
#[derive(Debug, Clone)]
pub struct ProvenanceContext {
    system: String,
    source: Option<ResourceReference>,
    nlp_output: Option<String>,
}

impl ProvenanceContext {
    pub fn new(config: &InsightConfig, document: &SourceDocument) -> Self {
        Self {
            system: config.insight_id_system.clone(),
            source: document.reference(),
            nlp_output: config.nlp_output_location.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvenanceEntry {
    pub insight_id: InsightId,
    pub system: String,
    pub span: Span,
    pub covered_text: Option<String>,
    pub source: Option<ResourceReference>,
    pub nlp_output: Option<String>,
    pub confidences: Vec<Confidence>,
}

impl ProvenanceEntry {
    /// Meta extension for this insight.
    pub fn to_extension(&self) -> Extension {
        let mut span_parts = Vec::new();
        if let Some(text) = &self.covered_text {
            span_parts.push(Extension::string(INSIGHT_SPAN_COVERED_TEXT_URL, text.clone()));
        }
        span_parts.push(Extension::integer(
            INSIGHT_SPAN_OFFSET_BEGIN_URL,
            self.span.begin as i64,
        ));
        span_parts.push(Extension::integer(
            INSIGHT_SPAN_OFFSET_END_URL,
            self.span.end as i64,
        ));

        let mut result = vec![Extension::complex(INSIGHT_SPAN_URL, span_parts)];
        result.extend(self.confidences.iter().map(|confidence| {
            Extension::complex(
                INSIGHT_CONFIDENCE_URL,
                vec![
                    Extension::string(INSIGHT_CONFIDENCE_NAME_URL, confidence.name),
                    Extension::decimal(INSIGHT_CONFIDENCE_SCORE_URL, confidence.score),
                ],
            )
        }));

        let mut detail = Vec::new();
        if let Some(location) = &self.nlp_output {
            detail.push(Extension::attachment(INSIGHT_NLP_OUTPUT_URL, location.clone()));
        }
        if let Some(source) = &self.source {
            detail.push(Extension::reference(INSIGHT_BASED_ON_URL, source.clone()));
        }
        detail.push(Extension::complex(INSIGHT_RESULT_URL, result));

        Extension::complex(
            INSIGHT_URL,
            vec![
                Extension::identifier(INSIGHT_ID_URL, &self.system, self.insight_id.to_string()),
                Extension::complex(INSIGHT_DETAIL_URL, detail),
            ],
        )
    }
}

/// A record that owns an append-only list of insights.
pub trait InsightRecord {
    fn insights(&self) -> &[ProvenanceEntry];
    fn push_insight(&mut self, entry: ProvenanceEntry);
}

/// Builds the entry for one processed mention.
pub fn compose<M: Mention + ?Sized>(
    mention: &M,
    insight_id: InsightId,
    kind: ConfidenceKind,
    context: &ProvenanceContext,
) -> ProvenanceEntry {
    compose_at(
        mention.span(),
        mention.covered_text(),
        mention.model_data(),
        insight_id,
        kind,
        context,
    )
}

pub fn compose_at(
    span: Span,
    covered_text: Option<&str>,
    model_data: Option<&InsightModelData>,
    insight_id: InsightId,
    kind: ConfidenceKind,
    context: &ProvenanceContext,
) -> ProvenanceEntry {
    ProvenanceEntry {
        insight_id,
        system: context.system.clone(),
        span,
        covered_text: covered_text.map(str::to_string),
        source: context.source.clone(),
        nlp_output: context.nlp_output.clone(),
        confidences: model_data
            .map(|data| confidences(data, kind))
            .unwrap_or_default(),
    }
}

pub fn attach<R: InsightRecord + ?Sized>(record: &mut R, entry: ProvenanceEntry) {
    record.push_insight(entry);
}

fn confidences(data: &InsightModelData, kind: ConfidenceKind) -> Vec<Confidence> {
    let scored =
        |name: &'static str, score: Option<f64>| score.map(|score| Confidence { name, score });

    match kind {
        ConfidenceKind::Medication => {
            let Some(usage) = data.medication.as_ref().and_then(|m| m.usage.as_ref()) else {
                return Vec::new();
            };
            [
                scored(CONFIDENCE_SCORE_MEDICATION_TAKEN, usage.taken_score),
                scored(CONFIDENCE_SCORE_MEDICATION_CONSIDERING, usage.considering_score),
                scored(CONFIDENCE_SCORE_MEDICATION_DISCUSSED, usage.discussed_score),
                scored(CONFIDENCE_SCORE_MEDICATION_MEASUREMENT, usage.lab_measurement_score),
            ]
            .into_iter()
            .flatten()
            .collect()
        }
        ConfidenceKind::Diagnosis => {
            let Some(diagnosis) = data.diagnosis.as_ref() else {
                return Vec::new();
            };
            let usage = diagnosis.usage.clone().unwrap_or_default();
            [
                scored(CONFIDENCE_SCORE_EXPLICIT, usage.explicit_score),
                scored(CONFIDENCE_SCORE_PATIENT_REPORTED, usage.patient_reported_score),
                scored(CONFIDENCE_SCORE_DISCUSSED, usage.discussed_score),
                scored(CONFIDENCE_SCORE_FAMILY_HISTORY, diagnosis.family_history_score),
                scored(CONFIDENCE_SCORE_SUSPECTED, diagnosis.suspected_score),
            ]
            .into_iter()
            .flatten()
            .collect()
        }
    }
}
