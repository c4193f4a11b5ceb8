//! Core ASR domain types.
//!
//! This module defines the vocabulary shared read-only by the data pipeline, the
//! greedy decoder and the loss.

use crate::error::{AppError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Index of the blank / no-output symbol.
pub const BLANK_INDEX: usize = 0;

/// Ordered single-character vocabulary. Index 0 is the blank symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
    tokens: Vec<char>,
    char_to_id: HashMap<char, usize>,
}

impl Vocabulary {
    /// Load vocabulary from a file.
    ///
    /// The file must hold a JSON array of one-character strings, for example
    /// `["_", "a", "b", " "]`. The first entry is the blank.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            AppError::Vocabulary(format!("cannot read {}: {}", path.display(), e))
        })?;
        let vocabulary = Self::from_json_str(&content)?;
        debug!("Loaded vocabulary with {} tokens", vocabulary.len());
        Ok(vocabulary)
    }

    /// Parse the JSON list-of-strings serialization.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw: Vec<String> = serde_json::from_str(content)
            .map_err(|e| AppError::Vocabulary(format!("expected a JSON array of strings: {}", e)))?;
        Self::from_tokens(raw)
    }

    /// Build from already-split tokens, validating every entry.
    pub fn from_tokens<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut chars = Vec::new();
        let mut char_to_id = HashMap::new();

        for (id, token) in tokens.into_iter().enumerate() {
            let token = token.as_ref();
            let mut it = token.chars();
            let c = match (it.next(), it.next()) {
                (Some(c), None) => c,
                _ => {
                    return Err(AppError::Vocabulary(format!(
                        "token {} ({:?}) must be exactly one character",
                        id, token
                    )))
                }
            };
            if char_to_id.insert(c, id).is_some() {
                return Err(AppError::Vocabulary(format!(
                    "duplicate token {:?} at index {}",
                    c, id
                )));
            }
            chars.push(c);
        }

        if chars.len() < 2 {
            return Err(AppError::Vocabulary(
                "vocabulary needs the blank plus at least one symbol".to_string(),
            ));
        }

        Ok(Self {
            tokens: chars,
            char_to_id,
        })
    }

    /// Get the character for a given index, or None if out of range.
    pub fn token(&self, id: usize) -> Option<char> {
        self.tokens.get(id).copied()
    }

    /// Index of a character, or None if it is not in the vocabulary.
    pub fn index_of(&self, c: char) -> Option<usize> {
        self.char_to_id.get(&c).copied()
    }

    /// Map a transcript to label indices, dropping characters the vocabulary
    /// lacks and the blank character.
    pub fn encode(&self, transcript: &str) -> Vec<usize> {
        transcript
            .chars()
            .filter_map(|c| self.index_of(c))
            .filter(|&id| id != BLANK_INDEX)
            .collect()
    }

    /// The blank character (entry 0).
    pub fn blank(&self) -> char {
        self.tokens[BLANK_INDEX]
    }

    /// All tokens in index order, as strings, for persisting alongside checkpoints.
    pub fn to_strings(&self) -> Vec<String> {
        self.tokens.iter().map(|c| c.to_string()).collect()
    }

    /// Get the number of tokens in the vocabulary.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Check if the vocabulary is empty.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
