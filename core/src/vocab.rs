use std::{collections::HashMap, ops::Range, path::Path};

use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Token id for unconditional samples.
pub const UNCONDITIONAL: usize = 0;

/// Conditioning vocabulary: token strings mapped to embedding rows.
///
/// Row 0 is reserved for the empty (unconditional) token.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenVocab {
    tokens: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Default for TokenVocab {
    fn default() -> Self {
        Self::from_names(std::iter::empty::<String>())
    }
}

impl TokenVocab {
    /// Build a vocabulary from class names; duplicates are dropped.
    pub fn from_names<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        let mut vocab = Self {
            tokens: vec![String::new()],
            index: HashMap::new(),
        };
        for name in names {
            let name = name.into();
            if !name.is_empty() && !vocab.index.contains_key(&name) {
                vocab.push(name);
            }
        }
        vocab.reindex();
        vocab
    }

    fn push(&mut self, name: String) {
        self.index.insert(name.clone(), self.tokens.len());
        self.tokens.push(name);
    }

    fn reindex(&mut self) {
        self.index = self
            .tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.len() <= 1
    }

    #[must_use]
    pub fn id(&self, token: &str) -> Option<usize> {
        self.index.get(token).copied()
    }

    /// Id for a prompt; unknown prompts map to the unconditional row.
    #[must_use]
    pub fn encode(&self, prompt: &str) -> usize {
        self.id(prompt.trim()).unwrap_or(UNCONDITIONAL)
    }

    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Append new tokens and return the rows they occupy.
    pub fn extend(&mut self, tokens: &[String]) -> Result<Range<usize>, ModelError> {
        for token in tokens {
            if token.is_empty() || self.index.contains_key(token) {
                return Err(ModelError::DuplicateToken(token.clone()));
            }
        }
        let start = self.tokens.len();
        for token in tokens {
            self.push(token.clone());
        }
        Ok(start..self.tokens.len())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let json = std::fs::read_to_string(path).map_err(|e| ModelError::io(path, e))?;
        let mut vocab: Self = serde_json::from_str(&json).map_err(|e| ModelError::Metadata {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if vocab.tokens.first().is_none_or(|t| !t.is_empty()) {
            vocab.tokens.insert(0, String::new());
        }
        vocab.reindex();
        Ok(vocab)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| ModelError::Metadata {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, json).map_err(|e| ModelError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_names_reserves_unconditional_row() {
        let vocab = TokenVocab::from_names(["cat", "dog", "cat", ""]);
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.id(""), Some(UNCONDITIONAL));
        assert_eq!(vocab.id("cat"), Some(1));
        assert_eq!(vocab.id("dog"), Some(2));
        assert_eq!(vocab.encode("  dog "), 2);
        assert_eq!(vocab.encode("bird"), UNCONDITIONAL);
    }

    #[test]
    fn test_extend() {
        let mut vocab = TokenVocab::from_names(["cat"]);
        let rows = vocab.extend(&["<toy>".to_string(), "<hat>".to_string()]).unwrap();
        assert_eq!(rows, 2..4);
        assert_eq!(vocab.id("<hat>"), Some(3));

        let err = vocab.extend(&["cat".to_string()]).unwrap_err();
        assert!(matches!(err, ModelError::DuplicateToken(t) if t == "cat"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let vocab = TokenVocab::from_names(["a", "b"]);
        vocab.save(&path).unwrap();
        let loaded = TokenVocab::load(&path).unwrap();
        assert_eq!(loaded.id("b"), Some(2));
        assert_eq!(loaded, vocab);
    }

    #[test]
    fn test_load_without_unconditional_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, r#"{"tokens": ["a", "b"]}"#).unwrap();
        let vocab = TokenVocab::load(&path).unwrap();
        assert_eq!(vocab.id("a"), Some(1));
        assert_eq!(vocab.len(), 3);
    }
}
