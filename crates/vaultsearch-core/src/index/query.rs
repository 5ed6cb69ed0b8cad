//! Search query parsing.

use super::model::MessageFields;

/// Characters of body context kept around the first match.
const SNIPPET_CONTEXT: usize = 100;

/// A parsed search query: every keyword must match.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchQuery {
    keywords: Vec<String>,
}

impl SearchQuery {
    /// Parse user input.
    ///
    /// Input is trimmed and lowercased, typographic quotes and apostrophes are
    /// normalized, double-quoted segments are kept as phrases and everything
    /// else is split on whitespace.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let normalized: String = input
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| match c {
                '\u{201C}' | '\u{201D}' => '"',
                '\u{2018}' | '\u{2019}' | '\u{201B}' => '\'',
                other => other,
            })
            .collect();

        let mut keywords = Vec::new();
        for (index, segment) in normalized.split('"').enumerate() {
            let quoted = index % 2 == 1;
            if quoted {
                let phrase = segment.trim();
                if !phrase.is_empty() {
                    keywords.push(phrase.to_string());
                }
            } else {
                keywords.extend(segment.split_whitespace().map(ToString::to_string));
            }
        }

        Self { keywords }
    }

    /// The parsed keywords, lowercased.
    #[must_use]
    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Returns true if the query has no keywords.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// Returns true if every keyword occurs in the message.
    #[must_use]
    pub fn matches(&self, fields: &MessageFields) -> bool {
        !self.is_empty() && self.keywords.iter().all(|k| fields.contains(k))
    }

    /// Body text around the first keyword found in the body.
    ///
    /// Falls back to the start of the body when only other fields matched.
    #[must_use]
    pub fn snippet(&self, body: &str) -> String {
        let lower = body.to_lowercase();
        let first_hit = self
            .keywords
            .iter()
            .filter_map(|k| lower.find(k.as_str()))
            .min();

        let chars: Vec<char> = body.chars().collect();
        let Some(byte_offset) = first_hit else {
            return chars.iter().take(SNIPPET_CONTEXT).collect();
        };

        // Lowercasing can change byte lengths, so map through char counts.
        let hit_char = lower[..byte_offset].chars().count().min(chars.len());
        let start = hit_char.saturating_sub(SNIPPET_CONTEXT / 2);
        let end = (start + SNIPPET_CONTEXT).min(chars.len());
        chars[start..end].iter().collect()
    }
}
