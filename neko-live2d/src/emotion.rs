//! Emotion → motion/expression mapping

use crate::error::{Live2DError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Candidate motion groups and expression ids per emotion label
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionMapping {
    pub motions: HashMap<String, Vec<String>>,
    pub expressions: HashMap<String, Vec<String>>,
}

impl EmotionMapping {
    pub fn with_motions(mut self, emotion: impl Into<String>, motions: &[&str]) -> Self {
        self.motions
            .insert(emotion.into(), motions.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_expressions(mut self, emotion: impl Into<String>, expressions: &[&str]) -> Self {
        self.expressions
            .insert(emotion.into(), expressions.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn motions_for(&self, emotion: &str) -> &[String] {
        self.motions.get(emotion).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn expressions_for(&self, emotion: &str) -> &[String] {
        self.expressions.get(emotion).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Resolves the mapping for a model
#[async_trait]
pub trait EmotionMappingProvider: Send + Sync {
    async fn emotion_mapping(&self, model_uri: &str) -> Result<Option<EmotionMapping>>;
}

/// Fixed table: per-model mappings plus an optional fallback for unknown models
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticEmotionMapping {
    pub models: HashMap<String, EmotionMapping>,
    pub fallback: Option<EmotionMapping>,
}

impl StaticEmotionMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model_uri: impl Into<String>, mapping: EmotionMapping) -> Self {
        self.models.insert(model_uri.into(), mapping);
        self
    }

    pub fn with_fallback(mut self, mapping: EmotionMapping) -> Self {
        self.fallback = Some(mapping);
        self
    }

    /// Load a table from a JSON, TOML or YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        neko_core::config::load_from_file(path).map_err(|e| Live2DError::Config(e.to_string()))
    }
}

#[async_trait]
impl EmotionMappingProvider for StaticEmotionMapping {
    async fn emotion_mapping(&self, model_uri: &str) -> Result<Option<EmotionMapping>> {
        Ok(self.models.get(model_uri).or(self.fallback.as_ref()).cloned())
    }
}
