//! LLM client for AI listing validation.
//!
//! One chat-completions call per articulum; the model answers with a
//! JSON verdict. Transport and protocol failures are surfaced as
//! `LlmError` — the caller rolls the articulum back rather than
//! rejecting items.

mod client;

pub use client::{
    AiVerdict, ChatValidator, ListingForReview, ListingValidator, LlmError, RejectedItem,
    NO_DECISION_REASON,
};
