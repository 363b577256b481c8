mod host_config;
mod scripting_config;

use directories::ProjectDirs;

pub use host_config::{ConfigLoadError, HostConfig};
pub use scripting_config::ScriptingConfig;

/// Platform directories for the `homescript` application
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "homescript")
}
