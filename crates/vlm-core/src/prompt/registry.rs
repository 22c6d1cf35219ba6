//! Named system-prompt templates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::SamplingParams;

pub const DEFAULT_TEMPLATE: &str = "default";

/// Upper bounds a template imposes on request sampling parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingPolicy {
    #[serde(default)]
    pub max_temperature: Option<f32>,
    #[serde(default)]
    pub max_top_p: Option<f32>,
    #[serde(default)]
    pub max_top_k: Option<usize>,
}

impl SamplingPolicy {
    pub fn apply(&self, params: &mut SamplingParams) {
        if let Some(max) = self.max_temperature {
            params.temperature = params.temperature.min(max);
        }
        if let Some(max) = self.max_top_p {
            params.top_p = params.top_p.min(max);
        }
        if let Some(max) = self.max_top_k {
            params.top_k = params.top_k.min(max);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub template: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub sampling_policy: SamplingPolicy,
}

fn default_category() -> String {
    "custom".to_string()
}

fn default_version() -> String {
    "1.0".to_string()
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            description: String::new(),
            category: default_category(),
            version: default_version(),
            sampling_policy: SamplingPolicy::default(),
        }
    }
}

/// Partial update for an existing template. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptUpdate {
    pub template: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub sampling_policy: Option<SamplingPolicy>,
}

#[derive(Debug, Clone)]
pub struct PromptRegistry {
    prompts: BTreeMap<String, PromptTemplate>,
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl PromptRegistry {
    pub fn with_builtins() -> Self {
        let mut prompts = BTreeMap::new();
        prompts.insert(
            DEFAULT_TEMPLATE.to_string(),
            PromptTemplate {
                template: String::new(),
                description: "General conversation mode with no specific context".to_string(),
                category: "general".to_string(),
                version: "1.0".to_string(),
                sampling_policy: SamplingPolicy::default(),
            },
        );
        prompts.insert(
            "lab_protocol_guide".to_string(),
            PromptTemplate {
                template: include_str!("templates/lab_protocol_guide.md")
                    .trim_end()
                    .to_string(),
                description: "Specialized assistant for laboratory protocols, equipment analysis, and safety guidance".to_string(),
                category: "laboratory".to_string(),
                version: "1.1".to_string(),
                sampling_policy: SamplingPolicy::default(),
            },
        );
        prompts.insert(
            "structured_data_extraction".to_string(),
            PromptTemplate {
                template: include_str!("templates/structured_data_extraction.md")
                    .trim_end()
                    .to_string(),
                description: "Extracts structured pathogen genomic data from laboratory sources as JSON".to_string(),
                category: "bioinformatics".to_string(),
                version: "1.2".to_string(),
                sampling_policy: SamplingPolicy {
                    max_temperature: Some(0.2),
                    max_top_p: Some(0.8),
                    max_top_k: Some(40),
                },
            },
        );
        Self { prompts }
    }

    /// Template by name; unknown names resolve to the default template.
    pub fn get_prompt(&self, name: &str) -> &PromptTemplate {
        self.prompts
            .get(name)
            .or_else(|| self.prompts.get(DEFAULT_TEMPLATE))
            .unwrap_or(&EMPTY_TEMPLATE)
    }

    pub fn get_info(&self, name: &str) -> Option<&PromptTemplate> {
        self.prompts.get(name)
    }

    /// Name to description.
    pub fn list(&self) -> BTreeMap<String, String> {
        self.prompts
            .iter()
            .map(|(name, prompt)| (name.clone(), prompt.description.clone()))
            .collect()
    }

    /// Name to template text, for one category.
    pub fn by_category(&self, category: &str) -> BTreeMap<String, String> {
        self.prompts
            .iter()
            .filter(|(_, prompt)| prompt.category == category)
            .map(|(name, prompt)| (name.clone(), prompt.template.clone()))
            .collect()
    }

    /// Returns `false` if the name is taken.
    pub fn add(&mut self, name: impl Into<String>, prompt: PromptTemplate) -> bool {
        let name = name.into();
        if self.prompts.contains_key(&name) {
            return false;
        }
        self.prompts.insert(name, prompt);
        true
    }

    /// Returns `false` if the name is unknown.
    pub fn update(&mut self, name: &str, update: PromptUpdate) -> bool {
        let Some(prompt) = self.prompts.get_mut(name) else {
            return false;
        };
        if let Some(template) = update.template {
            prompt.template = template;
        }
        if let Some(description) = update.description {
            prompt.description = description;
        }
        if let Some(version) = update.version {
            prompt.version = version;
        }
        if let Some(policy) = update.sampling_policy {
            prompt.sampling_policy = policy;
        }
        true
    }
}

static EMPTY_TEMPLATE: PromptTemplate = PromptTemplate {
    template: String::new(),
    description: String::new(),
    category: String::new(),
    version: String::new(),
    sampling_policy: SamplingPolicy {
        max_temperature: None,
        max_top_p: None,
        max_top_k: None,
    },
};

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SamplingParams {
        SamplingParams {
            max_tokens: 128,
            temperature: 1.0,
            top_k: 64,
            top_p: 0.95,
        }
    }

    #[test]
    fn unknown_names_fall_back_to_default() {
        let registry = PromptRegistry::default();
        assert!(registry.get_prompt("no_such_prompt").template.is_empty());
        assert!(registry.get_info("no_such_prompt").is_none());
        assert!(registry
            .get_prompt("lab_protocol_guide")
            .template
            .starts_with("You are a helpful laboratory assistant"));
    }

    #[test]
    fn extraction_template_clamps_sampling() {
        let registry = PromptRegistry::default();
        let mut sampling = params();
        registry
            .get_prompt("structured_data_extraction")
            .sampling_policy
            .apply(&mut sampling);
        assert_eq!(sampling.temperature, 0.2);
        assert_eq!(sampling.top_p, 0.8);
        assert_eq!(sampling.top_k, 40);

        let mut cold = SamplingParams {
            temperature: 0.1,
            top_k: 10,
            ..params()
        };
        registry
            .get_prompt("structured_data_extraction")
            .sampling_policy
            .apply(&mut cold);
        assert_eq!(cold.temperature, 0.1);
        assert_eq!(cold.top_k, 10);
    }

    #[test]
    fn default_policy_leaves_params_alone() {
        let registry = PromptRegistry::default();
        let mut sampling = params();
        registry.get_prompt(DEFAULT_TEMPLATE).sampling_policy.apply(&mut sampling);
        assert_eq!(sampling, params());
    }

    #[test]
    fn add_and_update() {
        let mut registry = PromptRegistry::default();
        assert!(!registry.add("default", PromptTemplate::new("nope")));
        assert!(registry.add("pirate", PromptTemplate::new("Talk like a pirate.")));
        assert_eq!(registry.list().len(), 4);
        assert_eq!(registry.by_category("custom").len(), 1);

        assert!(registry.update(
            "pirate",
            PromptUpdate {
                version: Some("2.0".to_string()),
                ..Default::default()
            }
        ));
        let pirate = registry.get_info("pirate").unwrap();
        assert_eq!(pirate.version, "2.0");
        assert_eq!(pirate.template, "Talk like a pirate.");

        assert!(!registry.update("missing", PromptUpdate::default()));
    }
}
