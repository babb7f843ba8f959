//! Tool registry and dispatcher.
//!
//! Tools are declared once at startup in a static registry and dispatched by
//! name — no reflection. Memory tools are first-class: the model reads and
//! writes the fact store through them. External HTTP tools surface failures
//! to the model as structured `{"status": "error", ...}` payloads so it can
//! respond gracefully.

pub mod calculator;
pub mod external;
pub mod memory_tools;
pub mod registry;
pub mod search;
pub mod tool;

pub use registry::{build_registry, ToolDispatcher, ToolRegistry};
pub use tool::{ScratchState, Tool, ToolContext, ToolResult};
