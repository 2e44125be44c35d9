//! Transcript hallucination filtering
//!
//! Cloud STT models sometimes "complete" silence with scripted phrases:
//! sign-offs, self-introductions, whole narrated paragraphs. Everything a
//! recognizer produces passes through here before it can become a
//! conversation turn.

use std::sync::LazyLock;

use regex::Regex;

/// Phrases the transcription model injects over silence
static BOILERPLATE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"продолжение следует",
        r"с вами был",
        r"до свидания",
        r"до новых встреч",
        r"спасибо за внимание",
        r"конец",
        r"закончили",
        // The model introducing itself as a person
        r"^здравствуйте[.,!]?\s*я\s",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("static pattern"))
    .collect()
});

/// Filler-only noise: single letters, vowel interjections
static NOISE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"^[а-яёa-z]{1,2}$", r"^[эмаоу]+$"]
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).expect("static pattern"))
        .collect()
});

/// Longest plausible single utterance from a short captured chunk
const MAX_UTTERANCE_CHARS: usize = 100;

/// More terminators than this suggests narrated text, not speech
const MAX_SENTENCE_TERMINATORS: usize = 2;

/// Validates raw transcript candidates.
///
/// Pure: no hidden state, identical input always yields identical output.
#[derive(Debug, Clone, Copy, Default)]
pub struct HallucinationFilter;

impl HallucinationFilter {
    /// Create a filter
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validate a candidate. Returns the trimmed text, or `None` when the
    /// candidate is rejected as an artifact.
    #[must_use]
    pub fn apply(&self, text: &str) -> Option<String> {
        let trimmed = text.trim();

        if trimmed.chars().count() < 2 {
            return None;
        }

        if trimmed.chars().count() > MAX_UTTERANCE_CHARS {
            tracing::debug!(len = trimmed.len(), "transcript rejected: oversized");
            return None;
        }

        let terminators = trimmed.chars().filter(|c| matches!(c, '.' | '!' | '?')).count();
        if terminators > MAX_SENTENCE_TERMINATORS {
            tracing::debug!(terminators, "transcript rejected: narrated text");
            return None;
        }

        for pattern in BOILERPLATE.iter() {
            if pattern.is_match(trimmed) {
                tracing::debug!(text = trimmed, "transcript rejected: boilerplate");
                return None;
            }
        }

        for pattern in NOISE.iter() {
            if pattern.is_match(trimmed) {
                tracing::debug!(text = trimmed, "transcript rejected: noise");
                return None;
            }
        }

        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> HallucinationFilter {
        HallucinationFilter::new()
    }

    #[test]
    fn test_passes_ordinary_speech() {
        assert_eq!(
            filter().apply("  покажи рецепт борща  "),
            Some("покажи рецепт борща".to_string())
        );
        assert_eq!(
            filter().apply("what can I cook tonight?"),
            Some("what can I cook tonight?".to_string())
        );
    }

    #[test]
    fn test_rejects_boilerplate_signoffs() {
        assert_eq!(filter().apply("Спасибо за внимание!"), None);
        assert_eq!(filter().apply("До новых встреч"), None);
        assert_eq!(filter().apply("Продолжение следует..."), None);
        assert_eq!(filter().apply("Здравствуйте! Я Марк"), None);
    }

    #[test]
    fn test_rejects_oversized_text() {
        let long = "слово ".repeat(30);
        assert_eq!(filter().apply(&long), None);
    }

    #[test]
    fn test_rejects_narrated_text() {
        assert_eq!(
            filter().apply("Первое предложение. Второе. Третье."),
            None
        );
        // Two terminators are still plausible speech
        assert!(filter().apply("Да. Давай!").is_some());
    }

    #[test]
    fn test_rejects_noise() {
        assert_eq!(filter().apply("э"), None);
        assert_eq!(filter().apply("ээээ"), None);
        assert_eq!(filter().apply("ммм"), None);
        assert_eq!(filter().apply("а"), None);
        assert_eq!(filter().apply(""), None);
        assert_eq!(filter().apply("  "), None);
    }

    #[test]
    fn test_repeated_calls_identical() {
        let f = filter();
        let input = "сделай пасту карбонара";
        assert_eq!(f.apply(input), f.apply(input));
        assert_eq!(f.apply("конец"), f.apply("конец"));
    }
}
