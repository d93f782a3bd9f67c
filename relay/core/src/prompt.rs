//! Prompt Synthesis
//!
//! Wraps a request's question text in the instructional template sent
//! upstream. The template is plain text with two placeholders:
//!
//! - `{question}`: the request text (required)
//! - `{source}`: where the text came from, derived from the request kind

use crate::config::ConfigError;
use crate::events::RequestKind;

/// Built-in template asking for a markdown answer
pub const DEFAULT_TEMPLATE: &str = "You are a helpful assistant. The following text has been {source} and contains a question.

Your task is to respond in markdown format, no matter the type of question. This could include explanations, bullet points, lists, code snippets, or any other relevant format. Be sure to structure the response clearly in markdown.

Question: {question}

Answer in markdown:";

/// A validated prompt template
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptTemplate {
    template: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl PromptTemplate {
    /// Create a template, requiring a `{question}` placeholder
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if the placeholder is missing.
    pub fn new(template: impl Into<String>) -> Result<Self, ConfigError> {
        let template = template.into();
        if !template.contains("{question}") {
            return Err(ConfigError::Invalid(
                "gateway.prompt_template must contain {question}".to_string(),
            ));
        }
        Ok(Self { template })
    }

    /// Raw template text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Render the prompt for one request
    #[must_use]
    pub fn render(&self, kind: RequestKind, question: &str) -> String {
        self.template
            .replace("{source}", kind.source_description())
            .replace("{question}", question)
    }
}
