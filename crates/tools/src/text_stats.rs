//! Text statistics tool: counts words, sentences and characters.

use async_trait::async_trait;
use parley_core::error::ToolError;
use parley_core::tool::Tool;
use serde::Serialize;
use serde_json::{Map, Value};

pub struct TextStatsTool;

/// Summary returned to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextStats {
    pub characters: usize,
    pub characters_no_spaces: usize,
    pub words: usize,
    pub unique_words: usize,
    pub sentences: usize,
    pub paragraphs: usize,
    pub average_word_length: f64,
    pub average_sentence_words: f64,
    pub longest_word: Option<String>,
}

#[async_trait]
impl Tool for TextStatsTool {
    fn name(&self) -> &str {
        "text_stats"
    }

    fn description(&self) -> &str {
        "Analyze a text and report word, sentence and character statistics."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "The text to analyze"
                }
            },
            "required": ["text"]
        })
    }

    async fn invoke(&self, arguments: Map<String, Value>) -> Result<Value, ToolError> {
        let text = arguments
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'text' argument".into()))?;

        serde_json::to_value(analyze(text)).map_err(|e| ToolError::ExecutionFailed {
            tool_name: "text_stats".into(),
            reason: e.to_string(),
        })
    }

    fn is_optional(&self) -> bool {
        true
    }
}

/// Compute statistics for `text`.
pub fn analyze(text: &str) -> TextStats {
    let words: Vec<&str> = text
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .collect();

    let mut unique: Vec<String> = words.iter().map(|w| w.to_lowercase()).collect();
    unique.sort_unstable();
    unique.dedup();

    let sentences = count_sentences(text);
    let paragraphs = text
        .split("\n\n")
        .filter(|p| !p.trim().is_empty())
        .count();

    let letters: usize = words.iter().map(|w| w.chars().count()).sum();
    let longest_word = words
        .iter()
        .copied()
        .fold(None::<&str>, |best, w| match best {
            Some(b) if b.chars().count() >= w.chars().count() => Some(b),
            _ => Some(w),
        })
        .map(str::to_string);

    TextStats {
        characters: text.chars().count(),
        characters_no_spaces: text.chars().filter(|c| !c.is_whitespace()).count(),
        words: words.len(),
        unique_words: unique.len(),
        sentences,
        paragraphs,
        average_word_length: ratio(letters, words.len()),
        average_sentence_words: ratio(words.len(), sentences),
        longest_word,
    }
}

// A sentence ends at a run of terminators; trailing text without one still counts.
fn count_sentences(text: &str) -> usize {
    let mut count = 0;
    let mut in_sentence = false;
    for c in text.chars() {
        if matches!(c, '.' | '!' | '?') {
            if in_sentence {
                count += 1;
                in_sentence = false;
            }
        } else if c.is_alphanumeric() {
            in_sentence = true;
        }
    }
    if in_sentence {
        count += 1;
    }
    count
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    let value = numerator as f64 / denominator as f64;
    (value * 100.0).round() / 100.0
}
