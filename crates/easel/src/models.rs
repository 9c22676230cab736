//! These models represent the objects passed around by the orchestrator
//!
//! There are several different related formats we need to interact with:
//! - openai chat completions and responses messages/tools
//! - anthropic messages/tools
//! - gemini contents/function declarations
//! - ollama chat messages/tools
//! - the tool registry, which executes calls on behalf of the model
//!
//! These all overlap to varying degrees. We always immediately convert those data models
//! into the internal structs using to/from helpers. Because of the need for compatibility,
//! the internal models are not an exact match to any of these formats.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
