mod client;
pub mod pricing;
pub mod usage;

pub use client::{
    CompletionRequest, ModelProvider, ModelSource, OpenAiCompatProvider, ProviderRegistry,
    ProviderTurn, ResolvedModel, ScriptedProvider,
};
pub use usage::{accumulate, accumulate_raw, normalize_usage};
