use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::Utc;

use crate::wire::command::{Answer, AnswerBody, Command};
use crate::wire::envelope::{Request, Routing};

/// Where an inbound command came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerContext {
    pub connection_id: u64,
    pub sequence: u64,
    pub routing: Routing,
}

/// Executes one inbound command. Unknown commands never reach a handler.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, command: &Command, context: &HandlerContext) -> Answer;
}

/// Handler on the management-server side: agents may probe it with `Ping` and
/// `ReadyCheck`; everything else is an agent's job to run.
#[derive(Debug, Default)]
pub struct ServerCommandHandler;

impl CommandHandler for ServerCommandHandler {
    fn handle(&self, command: &Command, _context: &HandlerContext) -> Answer {
        match command {
            Command::Ping(_) => Answer::with_body(
                command,
                true,
                "pong",
                AnswerBody::Pong {
                    server_time_ms: Utc::now().timestamp_millis(),
                },
            ),
            Command::ReadyCheck(_) => Answer::success(command, "management server ready"),
            _ => Answer::unsupported(command),
        }
    }
}

/// Runs every command of a batch in order and returns one answer per
/// command. With `stop_on_error`, commands after the first failure are
/// answered as skipped.
pub fn execute_batch(handler: &dyn CommandHandler, request: &Request, connection_id: u64) -> Vec<Answer> {
    let context = HandlerContext {
        connection_id,
        sequence: request.sequence,
        routing: request.routing,
    };
    let mut answers = Vec::with_capacity(request.commands.len());
    let mut failed = false;

    for command in &request.commands {
        if failed && request.stop_on_error {
            answers.push(Answer::skipped(command));
            continue;
        }

        let answer = if command.kind().is_none() {
            Answer::unsupported(command)
        } else {
            catch_unwind(AssertUnwindSafe(|| handler.handle(command, &context))).unwrap_or_else(|_| {
                tracing::error!(
                    target: "transport::handler",
                    connection_id,
                    sequence = request.sequence,
                    command = command.name(),
                    "command handler panicked"
                );
                Answer::failure(command, "command handler panicked")
            })
        };

        failed |= !answer.success;
        answers.push(answer);
    }

    answers
}
