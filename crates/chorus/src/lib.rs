pub mod capability;
pub mod errors;
pub mod models;
pub mod multiplexer;
pub mod orchestrator;
pub mod prompt_template;
pub mod providers;
pub mod session;
