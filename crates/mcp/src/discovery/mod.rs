//! Smart discovery: the embedding index and the synthetic find/ask layer.

pub mod index;
mod smart;

pub use smart::SmartDiscovery;

/// Name of the synthetic semantic-search tool.
pub const FIND_TOOL_NAME: &str = "metamcp__find";

/// Name of the synthetic ask-agent tool.
pub const ASK_TOOL_NAME: &str = "metamcp__ask";
