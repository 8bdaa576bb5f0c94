//! Built-in tool implementations for Parley.
//!
//! Tools give the agent a few concrete capabilities: analyzing text,
//! generating files into an output directory, and asking the user for a
//! recording (which pauses the turn until the user answers).

pub mod generate_file;
pub mod request_recording;
pub mod text_stats;

use std::path::PathBuf;

use parley_core::error::ToolError;
use parley_core::tool::ToolRegistry;

pub use generate_file::GenerateFileTool;
pub use request_recording::RequestRecordingTool;
pub use text_stats::TextStatsTool;

/// Create a registry with all built-in tools.
///
/// `generate_file` writes into `output_dir` and nowhere else.
pub fn default_registry(output_dir: impl Into<PathBuf>) -> Result<ToolRegistry, ToolError> {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(TextStatsTool))?;
    registry.register(Box::new(GenerateFileTool::new(output_dir)))?;
    registry.register(Box::new(RequestRecordingTool))?;
    Ok(registry)
}
