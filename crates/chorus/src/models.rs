//! These models represent the objects passed around by the orchestration layer
//!
//! There are several different related formats we need to interact with:
//! - anthropic messages/tools, sent from an adapter to the messages api
//! - openai messages/tools, sent from an adapter to the chat completions api
//! - flat text prompts, sent from an adapter to a local completion endpoint
//! - tool descriptors and results, exchanged with the capability provider
//! - events and envelopes, sent from the adapters to the transport shell
//!
//! We always immediately convert those data models into the internal structs
//! using to/from helpers. Because of the need for compatibility, the internal
//! models are not an exact match to any of these formats.
pub mod event;
pub mod message;
pub mod role;
pub mod tool;
