//! Evidence and question extraction from agent responses.
//!
//! Agents report their results as JSON embedded in free text. Extraction
//! tries, in order:
//!
//! 1. each ```json block as one JSON object;
//! 2. each line of such a block as a standalone object (JSON lines);
//! 3. balanced `{...}` groups inside the block;
//! 4. balanced groups over the whole response, if no block produced
//!    anything.
//!
//! Objects are merged in document order; later keys win.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::utils::{balanced_objects, json_code_blocks};

/// Marker that introduces a question for the Q&A orchestrator.
pub const QUESTION_MARKER: &str = "QUESTION:";

/// Key/value data extracted from one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evidence {
    fields: BTreeMap<String, Value>,
}

impl Evidence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing hash fields. Values that parse as JSON are stored as
    /// such; everything else is kept as a string.
    pub fn from_hash_fields<'a, I>(fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let fields = fields
            .into_iter()
            .map(|(k, v)| {
                let value = serde_json::from_str::<Value>(v)
                    .ok()
                    .filter(|parsed| !parsed.is_string())
                    .unwrap_or_else(|| Value::String(v.clone()));
                (k.clone(), value)
            })
            .collect();
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Merge one JSON object; its keys replace existing ones.
    fn merge_object(&mut self, object: Map<String, Value>) {
        for (k, v) in object {
            self.fields.insert(k, v);
        }
    }

    /// `other` laid over `self`: keys present in both take `other`'s value.
    pub fn overlay(&self, other: &Evidence) -> Evidence {
        let mut merged = self.clone();
        for (k, v) in &other.fields {
            merged.fields.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Interpret a field as a boolean.
    ///
    /// Accepts `true`, non-zero numbers and the strings `true`, `yes`,
    /// `pass`, `passed` (case-insensitive). Anything else, including a
    /// missing key, is `false`.
    pub fn flag(&self, key: &str) -> bool {
        match self.fields.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => matches!(
                s.trim().to_lowercase().as_str(),
                "true" | "yes" | "pass" | "passed"
            ),
            _ => false,
        }
    }

    /// Interpret a field as a number. Strings like `"87.5%"` are accepted.
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
            _ => None,
        }
    }

    /// Field/value pairs for a Redis hash. Strings are stored raw,
    /// everything else as compact JSON.
    pub fn to_hash_fields(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), rendered)
            })
            .collect()
    }
}

/// Parse `candidate` and merge it when it is a JSON object.
fn merge_if_object(evidence: &mut Evidence, candidate: &str) -> bool {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => {
            evidence.merge_object(map);
            true
        }
        _ => false,
    }
}

/// Extract objects from a single fenced block.
fn extract_from_block(evidence: &mut Evidence, block: &str) -> bool {
    if merge_if_object(evidence, block) {
        return true;
    }

    let mut found = false;
    for line in block.lines().map(str::trim).filter(|l| !l.is_empty()) {
        found |= merge_if_object(evidence, line);
    }
    if found {
        return true;
    }

    for group in balanced_objects(block) {
        found |= merge_if_object(evidence, group);
    }
    found
}

/// Extract evidence from a response.
///
/// Pure and deterministic: the same text always yields the same map.
pub fn extract_evidence(text: &str) -> Evidence {
    let mut evidence = Evidence::new();

    let mut found_in_blocks = false;
    for block in json_code_blocks(text) {
        found_in_blocks |= extract_from_block(&mut evidence, block);
    }

    if !found_in_blocks {
        for group in balanced_objects(text) {
            merge_if_object(&mut evidence, group);
        }
    }

    evidence
}

/// Strip list bullets and markdown emphasis from the start of a line.
fn strip_decoration(line: &str) -> &str {
    let mut rest = line.trim();
    loop {
        let before = rest;
        rest = rest
            .trim_start_matches("**")
            .trim_start_matches(['-', '*', '>'])
            .trim_start();
        if let Some(stripped) = strip_ordinal(rest) {
            rest = stripped;
        }
        if rest == before {
            return rest;
        }
    }
}

/// Strip a leading `1.` / `2)` list ordinal.
fn strip_ordinal(line: &str) -> Option<&str> {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    rest.strip_prefix('.')
        .or_else(|| rest.strip_prefix(')'))
        .map(str::trim_start)
}

/// Extract `QUESTION:` lines from a response.
///
/// Returns the trimmed question texts in order, without empties or
/// duplicates.
pub fn extract_questions(text: &str) -> Vec<String> {
    let mut questions: Vec<String> = Vec::new();

    for line in text.lines() {
        let Some(rest) = strip_decoration(line).strip_prefix(QUESTION_MARKER) else {
            continue;
        };
        let question = rest
            .trim()
            .trim_start_matches("**")
            .trim_end_matches("**")
            .trim();
        if question.is_empty() || questions.iter().any(|q| q == question) {
            continue;
        }
        questions.push(question.to_string());
    }

    questions
}
