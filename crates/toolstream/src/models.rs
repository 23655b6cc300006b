//! These models represent the objects passed around by the agent
//!
//! There are several different related formats we need to interact with:
//! - AI SDK `UIMessage`s, sent from the browser to the server (see [`crate::ui`])
//! - AI SDK UI message stream chunks, sent from the server to the browser (see [`crate::protocol`])
//! - openai messages/tools, sent from the agent to the LLM
//! - tool handler inputs and outputs, exchanged with the tool registry
//!
//! These all overlap to varying degrees. We always immediately convert those data models
//! into the internal structs using to/from helpers. Because of the need for compatibility,
//! the internal models are not an exactly match to any of these formats.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
