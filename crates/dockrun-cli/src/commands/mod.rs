//! CLI command implementations.

pub mod run;
pub mod serve;

use dockrun_config::RunnerConfig;
use dockrun_scheduler::PipelineSettings;

pub fn pipeline_settings(config: &RunnerConfig) -> PipelineSettings {
    PipelineSettings {
        projects_root: config.folder_projects.clone(),
        workspace_root: config.folder_tar.clone(),
        command_timeout: config.command_timeout(),
        remove_images: config.remove_images,
    }
}
