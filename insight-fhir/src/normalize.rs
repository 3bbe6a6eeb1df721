//! Backfills covered text from offsets into the document.

use insight_core::{AnnotationSet, InsightError, Span};

/// Character-offset view of the document text.
pub struct TextIndex<'a> {
    text: &'a str,
    boundaries: Vec<usize>,
}

impl<'a> TextIndex<'a> {
    pub fn new(text: &'a str) -> Self {
        let mut boundaries: Vec<usize> = text.char_indices().map(|(idx, _)| idx).collect();
        boundaries.push(text.len());
        Self { text, boundaries }
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.boundaries.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn covered_text(&self, span: Span) -> Result<&'a str, InsightError> {
        if span.begin > span.end || span.end > self.len() {
            return Err(InsightError::SpanOutOfRange {
                begin: span.begin,
                end: span.end,
                len: self.len(),
            });
        }
        Ok(&self.text[self.boundaries[span.begin]..self.boundaries[span.end]])
    }
}

/// Fills every sentence's covered text. Mentions that arrive without covered
/// text get it as well; offsets past the end of the text are fatal.
pub fn normalize(text: &str, annotations: &mut AnnotationSet) -> Result<(), InsightError> {
    let index = TextIndex::new(text);

    for sentence in &mut annotations.sentences {
        let covered = index.covered_text(Span::new(sentence.begin, sentence.end))?;
        sentence.covered_text = Some(covered.to_string());
    }

    for concept in &mut annotations.concepts {
        let covered = index.covered_text(Span::new(concept.begin, concept.end))?;
        concept
            .covered_text
            .get_or_insert_with(|| covered.to_string());
    }

    for medication in &mut annotations.medication_ind {
        let covered = index.covered_text(Span::new(medication.begin, medication.end))?;
        medication
            .covered_text
            .get_or_insert_with(|| covered.to_string());
    }

    for attribute in &mut annotations.attribute_values {
        let covered = index.covered_text(attribute.span())?;
        attribute
            .covered_text
            .get_or_insert_with(|| covered.to_string());
    }

    Ok(())
}
