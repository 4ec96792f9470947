//! lorastage harness
//!
//! Request pipeline, adapter regression fixtures and the suite that checks
//! a runtime against recorded reference traces.

mod error;
mod fixtures;
mod pipeline;
mod prompt;
mod reference;
mod suite;

pub use error::{HarnessError, Result};
pub use fixtures::{
    adapter_file_name, case_name, reference_file_name, write_fixtures, FixtureCase,
    FixtureOptions, FixtureSet, EMBEDDING_SCALES, LAYER_SCALES,
};
pub use pipeline::{AdapterRequest, GenerationRequest, LoraPipeline};
pub use prompt::{load_cases, ChatPrompt, PromptCase, DEFAULT_SYSTEM_PROMPT, SAMPLE_QUESTION};
pub use reference::{cosine_similarity, ReferenceTrace};
pub use suite::{CaseResult, RegressionSuite, SuiteOptions, SuiteReport};
