//! 工具契约：Agent 对外暴露的工具集

pub mod declared;
pub mod registry;

pub use declared::DeclaredTool;
pub use registry::{Tool, ToolInfo, ToolRegistry};
