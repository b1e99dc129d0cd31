//! JSON extraction from LLM responses.
//!
//! Model output is free text with JSON embedded in it, sometimes inside
//! fenced code blocks, sometimes inline. These helpers find candidate
//! JSON snippets; deciding what to do with them is up to the caller.

use std::sync::LazyLock;

use regex::Regex;

/// Fence pattern for ```json blocks. Lazy so the unterminated tail of a
/// truncated response does not swallow earlier blocks.
const JSON_FENCE_PATTERN: &str = r"```json[^\n]*\n?([\s\S]*?)```";

static JSON_FENCE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(JSON_FENCE_PATTERN).ok());

/// Find the index of the '}' closing the object that starts at `s[0]`.
///
/// Handles nested braces, string literals (including escaped quotes) and
/// escape sequences inside strings.
///
/// # Returns
///
/// The byte index of the matching closing '}', or None if not found.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => {
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
            }
            '{' if !in_string => {
                depth += 1;
            }
            '}' if !in_string => {
                // A '}' before any '{' means `s` did not start an object.
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Bodies of every ```json fenced block, in document order.
pub fn json_code_blocks(content: &str) -> Vec<&str> {
    let Some(re) = JSON_FENCE.as_ref() else {
        return Vec::new();
    };

    re.captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|body| !body.is_empty())
        .collect()
}

/// Every top-level balanced `{...}` group in `content`, in order.
///
/// Groups are not validated as JSON. A group nested inside another one
/// is not returned separately. An unmatched '{' is skipped and scanning
/// resumes after it.
pub fn balanced_objects(content: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut offset = 0;

    while let Some(rel) = content[offset..].find('{') {
        let start = offset + rel;
        match find_matching_brace(&content[start..]) {
            Some(end) => {
                found.push(&content[start..=start + end]);
                offset = start + end + 1;
            }
            None => {
                offset = start + 1;
            }
        }
    }

    found
}
