#![forbid(unsafe_code)]

use std::path::Path;
use std::process::Command;

use crate::adapters::ReviewAdapter;
use crate::error::TaskqError;

/// Interactive review UI attached to the task's agent server.
#[derive(Debug, Clone)]
pub struct ReviewCli {
    command: String,
    args: Vec<String>,
    host: String,
}

impl ReviewCli {
    #[must_use]
    pub fn new(command: String, args: Vec<String>, host: String) -> Self {
        Self {
            command,
            args,
            host,
        }
    }

    fn build(&self, config_dir: &Path, data_dir: &Path, port: u16) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env("OPENCODE_HOST", format!("http://{}:{port}", self.host))
            .env("OPENCODE_SKIP_START", "true")
            .env("OPENCODE_CONFIG_DIR", config_dir)
            .env("OPENCODE_DATA_DIR", data_dir);
        cmd
    }
}

impl ReviewAdapter for ReviewCli {
    fn launch(&self, config_dir: &Path, data_dir: &Path, port: u16) -> Result<i32, TaskqError> {
        let status = self
            .build(config_dir, data_dir, port)
            .status()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    TaskqError::Other(format!("{} not found in PATH", self.command))
                }
                _ => TaskqError::Other(format!("failed to run {}: {e}", self.command)),
            })?;
        Ok(status.code().unwrap_or(1))
    }
}
