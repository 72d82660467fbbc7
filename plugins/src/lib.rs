//! Attack modules: the plugin contract, manifest loading and the registry
//! that owns plugin lifecycles.

pub mod contract;
pub mod external;
pub mod manifest;
pub mod registry;
pub mod tool;

pub use contract::{Plugin, PluginContext, PluginMetadata, PluginOutput};
pub use registry::{Invocation, PluginInfo, PluginRegistry, RegistrySettings};
pub use tool::{CommandJob, JobOutcome, JobParams, ToolJob};
