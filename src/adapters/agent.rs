#![forbid(unsafe_code)]

use std::process::Command;
use std::time::Duration;

use tracing::info;

use crate::adapters::{AgentAdapter, AgentOutput};
use crate::core::process::run_captured;
use crate::error::TaskqError;

/// Runs the agent's plan/execute commands inside the task container via `<runtime> exec`.
#[derive(Debug, Clone)]
pub struct ContainerExecAgent {
    runtime: String,
    workdir: String,
    plan_command: Vec<String>,
    execute_command: Vec<String>,
    timeout: Option<Duration>,
}

impl ContainerExecAgent {
    #[must_use]
    pub fn new(
        runtime: String,
        workdir: String,
        plan_command: Vec<String>,
        execute_command: Vec<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            runtime,
            workdir,
            plan_command,
            execute_command,
            timeout,
        }
    }

    fn exec_args(&self, handle: &str, agent_cmd: &[String], prompt: &str) -> Vec<String> {
        let mut args = vec![
            "exec".to_owned(),
            "-w".to_owned(),
            self.workdir.clone(),
            handle.to_owned(),
        ];
        args.extend(agent_cmd.iter().cloned());
        args.push(prompt.to_owned());
        args
    }

    fn exec(&self, handle: &str, agent_cmd: &[String], prompt: &str) -> Result<AgentOutput, TaskqError> {
        let mut cmd = Command::new(&self.runtime);
        cmd.args(self.exec_args(handle, agent_cmd, prompt));
        let out = run_captured(cmd, self.timeout)?;
        info!(container = handle, exit_code = out.code, "agent command finished");
        Ok(AgentOutput {
            exit_code: out.code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }
}

impl AgentAdapter for ContainerExecAgent {
    fn make_plan(&self, handle: &str, prompt: &str) -> Result<AgentOutput, TaskqError> {
        self.exec(handle, &self.plan_command, prompt)
    }

    fn execute_plan(&self, handle: &str, prompt: &str) -> Result<AgentOutput, TaskqError> {
        self.exec(handle, &self.execute_command, prompt)
    }
}
