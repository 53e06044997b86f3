//! Startup negotiation. A freshly accepted connection is anonymous until the
//! agent's first control request announces it with a `Startup` command.

use thiserror::Error;

use crate::wire::command::{Answer, AnswerBody, Command, StartupCommand};
use crate::wire::envelope::{Request, Routing};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("first request on a connection must be a control request")]
    NotAControlRequest,
    #[error("first request must carry exactly one startup command, got {count} commands")]
    UnexpectedBatchSize { count: usize },
    #[error("first request must be a startup command, got '{found}'")]
    NotStartup { found: &'static str },
    #[error("startup announced reserved agent id 0")]
    ZeroAgentId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartupAnnouncement {
    pub agent_id: u64,
    pub host_name: String,
    pub agent_version: String,
}

/// Validates an agent's opening request and builds the `StartupAccepted`
/// answer for it.
pub fn accept_startup(
    request: &Request,
    management_server_id: u64,
) -> Result<(StartupAnnouncement, Answer), HandshakeError> {
    if !request.control {
        return Err(HandshakeError::NotAControlRequest);
    }
    let [command] = request.commands.as_slice() else {
        return Err(HandshakeError::UnexpectedBatchSize {
            count: request.commands.len(),
        });
    };
    let Command::Startup(startup) = command else {
        return Err(HandshakeError::NotStartup {
            found: command.name(),
        });
    };
    if startup.agent_id == 0 {
        return Err(HandshakeError::ZeroAgentId);
    }

    let answer = Answer::with_body(
        command,
        true,
        format!("agent {} registered", startup.agent_id),
        AnswerBody::StartupAccepted {
            agent_id: startup.agent_id,
            management_server_id,
        },
    );
    let announcement = StartupAnnouncement {
        agent_id: startup.agent_id,
        host_name: startup.host_name.clone(),
        agent_version: startup.agent_version.clone(),
    };

    Ok((announcement, answer))
}

/// One failed answer per command in a rejected opening request.
pub fn rejection_answers(request: &Request, error: &HandshakeError) -> Vec<Answer> {
    request
        .commands
        .iter()
        .map(|command| Answer::failure(command, format!("startup rejected: {error}")))
        .collect()
}

/// Opening request an agent sends on a new connection.
pub fn startup_request(agent_id: u64, host_name: &str, agent_version: &str) -> Request {
    Request::new(
        Routing {
            agent_id,
            management_server_id: 0,
            via_id: agent_id,
        },
        vec![Command::Startup(StartupCommand {
            agent_id,
            host_name: host_name.to_owned(),
            agent_version: agent_version.to_owned(),
        })],
    )
    .control()
}

#[cfg(test)]
mod tests {
    use crate::wire::command::{AnswerBody, Command, PingCommand};
    use crate::wire::envelope::{Request, Routing};

    use super::{accept_startup, rejection_answers, startup_request, HandshakeError};

    #[test]
    fn startup_request_is_accepted_with_server_identity() {
        let request = startup_request(12, "kvm-host-12", "4.19.0");

        let (announcement, answer) = accept_startup(&request, 345).expect("startup should pass");
        assert_eq!(announcement.agent_id, 12);
        assert_eq!(announcement.host_name, "kvm-host-12");
        assert!(answer.success);
        assert_eq!(
            answer.body,
            AnswerBody::StartupAccepted {
                agent_id: 12,
                management_server_id: 345
            }
        );
    }

    #[test]
    fn non_control_or_non_startup_first_request_is_rejected() {
        let mut plain = startup_request(12, "kvm-host-12", "4.19.0");
        plain.control = false;
        assert_eq!(
            accept_startup(&plain, 1).expect_err("payload request should fail"),
            HandshakeError::NotAControlRequest
        );

        let ping = Request::new(
            Routing::default(),
            vec![Command::Ping(PingCommand { host_id: 12 })],
        )
        .control();
        let err = accept_startup(&ping, 1).expect_err("ping should fail");
        assert_eq!(err, HandshakeError::NotStartup { found: "ping" });

        let answers = rejection_answers(&ping, &err);
        assert_eq!(answers.len(), 1);
        assert!(!answers[0].success);
    }

    #[test]
    fn zero_agent_id_is_rejected() {
        let request = startup_request(0, "ghost", "4.19.0");
        assert_eq!(
            accept_startup(&request, 1).expect_err("agent id 0 should fail"),
            HandshakeError::ZeroAgentId
        );
    }
}
