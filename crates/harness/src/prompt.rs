//! ChatML prompt construction

use std::path::Path;

use lorastage_model::{ChatFormat, ChatMessage};
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Question used by the regression suite
pub const SAMPLE_QUESTION: &str = "Give me a short introduction to large language model.";

/// One entry of a prompt case file: optional context plus a question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptCase {
    #[serde(default)]
    pub content: Option<String>,
    pub question: String,
}

/// Load a JSON array of prompt cases
pub fn load_cases(path: &Path) -> Result<Vec<PromptCase>> {
    let data = std::fs::read_to_string(path)?;
    let cases: Vec<PromptCase> = serde_json::from_str(&data)?;
    if cases.is_empty() {
        return Err(HarnessError::InvalidInput(format!(
            "{} holds no prompt cases",
            path.display()
        )));
    }
    Ok(cases)
}

/// System prompt plus chat template
#[derive(Debug, Clone)]
pub struct ChatPrompt {
    pub system: String,
    pub format: ChatFormat,
}

impl Default for ChatPrompt {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM_PROMPT.to_string(),
            format: ChatFormat::ChatML,
        }
    }
}

impl ChatPrompt {
    pub fn with_format(mut self, format: ChatFormat) -> Self {
        self.format = format;
        self
    }

    /// Single user turn, ending with an open assistant turn
    pub fn render(&self, user: &str) -> String {
        self.format.render(&[
            ChatMessage::system(self.system.clone()),
            ChatMessage::user(user),
        ])
    }

    /// Context (if any) directly followed by the question in one user turn
    pub fn render_case(&self, case: &PromptCase) -> String {
        match &case.content {
            Some(content) => self.render(&format!("{}{}", content, case.question)),
            None => self.render(&case.question),
        }
    }

    /// The regression suite's sample prompt
    pub fn sample(&self) -> String {
        self.render(SAMPLE_QUESTION)
    }
}
