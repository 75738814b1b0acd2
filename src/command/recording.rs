//! In-memory runner that records commands and replays scripted responses.

use std::sync::Mutex;

use super::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::{BootstrapError, BootstrapResult};

#[derive(Clone)]
enum Response {
    Output(CommandOutput),
    TimedOut,
}

struct Rule {
    pattern: String,
    response: Response,
}

/// Records every command; the first rule whose pattern is contained in the
/// rendered command line decides the output, otherwise the command succeeds
/// with empty output.
#[derive(Default)]
pub struct RecordingRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, pattern: &str, response: Response) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            response,
        });
        self
    }

    pub fn respond(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.push(pattern, Response::Output(output))
    }

    /// Behave like a command that overran its timeout.
    pub fn time_out_on(&self, pattern: &str) -> &Self {
        self.push(pattern, Response::TimedOut)
    }

    pub fn fail_on(&self, pattern: &str, status: i32) -> &Self {
        self.respond(pattern, CommandOutput::failure(status, "scripted failure"))
    }

    /// Drop every scripted rule.
    pub fn clear_rules(&self) {
        self.rules.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Rendered command lines, in execution order.
    pub fn rendered(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::render).collect()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.rendered()
            .iter()
            .filter(|line| line.contains(pattern))
            .count()
    }
}

impl CommandRunner for RecordingRunner {
    async fn run(&self, spec: &CommandSpec) -> BootstrapResult<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());

        let rendered = spec.render();
        let rules = self.rules.lock().unwrap();
        let response = rules
            .iter()
            .find(|rule| rendered.contains(&rule.pattern))
            .map(|rule| rule.response.clone());

        match response {
            Some(Response::Output(output)) => Ok(output),
            Some(Response::TimedOut) => Err(BootstrapError::CommandFailed {
                command: rendered,
                status: None,
                stderr: "timed out".to_string(),
            }),
            None => Ok(CommandOutput::success()),
        }
    }
}
