use std::fmt;

use crate::wire::command::{Answer, Command};

pub const PROTOCOL_MAJOR: u8 = 3;
pub const PROTOCOL_MINOR: u8 = 1;

pub const FLAG_RESPONSE: u16 = 1 << 0;
pub const FLAG_CONTROL: u16 = 1 << 1;
pub const FLAG_STOP_ON_ERROR: u16 = 1 << 2;
pub const FLAG_IN_SEQUENCE: u16 = 1 << 3;
pub const FLAG_FROM_SERVER: u16 = 1 << 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const CURRENT: Self = Self {
        major: PROTOCOL_MAJOR,
        minor: PROTOCOL_MINOR,
    };

    /// Minor versions only add optional fields and item types.
    pub fn is_compatible_with(self, other: Self) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Who a frame is about and which hop carried it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Routing {
    pub agent_id: u64,
    pub management_server_id: u64,
    pub via_id: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub version: ProtocolVersion,
    pub sequence: u64,
    pub routing: Routing,
    pub control: bool,
    pub stop_on_error: bool,
    pub execute_in_sequence: bool,
    pub from_server: bool,
    pub commands: Vec<Command>,
}

impl Request {
    /// Sequence number is assigned by the dispatcher at send time.
    pub fn new(routing: Routing, commands: Vec<Command>) -> Self {
        let execute_in_sequence = commands.iter().any(Command::execute_in_sequence);
        Self {
            version: ProtocolVersion::CURRENT,
            sequence: 0,
            routing,
            control: false,
            stop_on_error: true,
            execute_in_sequence,
            from_server: false,
            commands,
        }
    }

    pub fn control(mut self) -> Self {
        self.control = true;
        self
    }

    pub fn with_stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    pub fn in_sequence(mut self) -> Self {
        self.execute_in_sequence = true;
        self
    }

    pub fn flags(&self) -> u16 {
        let mut flags = 0;
        if self.control {
            flags |= FLAG_CONTROL;
        }
        if self.stop_on_error {
            flags |= FLAG_STOP_ON_ERROR;
        }
        if self.execute_in_sequence {
            flags |= FLAG_IN_SEQUENCE;
        }
        if self.from_server {
            flags |= FLAG_FROM_SERVER;
        }
        flags
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Seq {}-{}: {{ Cmd, MgmtId: {}, via: {}, Ver: v{}, Flags: {:#b}, [",
            self.routing.agent_id,
            self.sequence,
            self.routing.management_server_id,
            self.routing.via_id,
            self.version,
            self.flags()
        )?;
        for (index, command) in self.commands.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            f.write_str(command.name())?;
        }
        f.write_str("] }")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub version: ProtocolVersion,
    pub sequence: u64,
    pub routing: Routing,
    pub control: bool,
    pub from_server: bool,
    pub answers: Vec<Answer>,
}

impl Response {
    pub fn for_request(request: &Request, answers: Vec<Answer>, from_server: bool) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            sequence: request.sequence,
            routing: request.routing,
            control: request.control,
            from_server,
            answers,
        }
    }

    pub fn flags(&self) -> u16 {
        let mut flags = FLAG_RESPONSE;
        if self.control {
            flags |= FLAG_CONTROL;
        }
        if self.from_server {
            flags |= FLAG_FROM_SERVER;
        }
        flags
    }

    pub fn all_succeeded(&self) -> bool {
        self.answers.iter().all(|answer| answer.success)
    }

    pub fn first_failure(&self) -> Option<&Answer> {
        self.answers.iter().find(|answer| !answer.success)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Seq {}-{}: {{ Ans, MgmtId: {}, via: {}, Ver: v{}, Flags: {:#b}, [",
            self.routing.agent_id,
            self.sequence,
            self.routing.management_server_id,
            self.routing.via_id,
            self.version,
            self.flags()
        )?;
        for (index, answer) in self.answers.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", answer.command_tag, answer.success)?;
        }
        f.write_str("] }")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

#[cfg(test)]
mod tests {
    use crate::wire::command::{Answer, Command, PingCommand, StopVmCommand};

    use super::{
        ProtocolVersion, Request, Response, Routing, FLAG_IN_SEQUENCE, FLAG_RESPONSE,
        FLAG_STOP_ON_ERROR,
    };

    fn routing() -> Routing {
        Routing {
            agent_id: 7,
            management_server_id: 1,
            via_id: 7,
        }
    }

    #[test]
    fn request_inherits_sequencing_from_its_commands() {
        let query = Request::new(routing(), vec![Command::Ping(PingCommand { host_id: 7 })]);
        assert!(!query.execute_in_sequence);
        assert!(query.commands.iter().all(Command::is_query));

        let stop = Request::new(
            routing(),
            vec![Command::StopVm(StopVmCommand {
                vm_name: "i-2-10-VM".to_owned(),
                force: false,
            })],
        );
        assert!(stop.execute_in_sequence);
        assert_eq!(stop.flags(), FLAG_STOP_ON_ERROR | FLAG_IN_SEQUENCE);
    }

    #[test]
    fn response_mirrors_request_sequence_and_routing() {
        let mut request = Request::new(routing(), vec![Command::Ping(PingCommand { host_id: 7 })]);
        request.sequence = 42;
        let answer = Answer::success(&request.commands[0], "pong");

        let response = Response::for_request(&request, vec![answer], true);
        assert_eq!(response.sequence, 42);
        assert_eq!(response.routing, routing());
        assert_ne!(response.flags() & FLAG_RESPONSE, 0);
        assert!(response.all_succeeded());
    }

    #[test]
    fn version_compatibility_only_considers_major() {
        let current = ProtocolVersion::CURRENT;
        let newer_minor = ProtocolVersion {
            major: current.major,
            minor: current.minor + 4,
        };
        let next_major = ProtocolVersion {
            major: current.major + 1,
            minor: 0,
        };

        assert!(current.is_compatible_with(newer_minor));
        assert!(!current.is_compatible_with(next_major));
        assert_eq!(current.to_string(), "3.1");
    }

    #[test]
    fn display_summarizes_commands_for_logs() {
        let mut request = Request::new(routing(), vec![Command::Ping(PingCommand { host_id: 7 })]);
        request.sequence = 3;

        let rendered = request.to_string();
        assert!(rendered.starts_with("Seq 7-3:"));
        assert!(rendered.contains("[ping]"));
    }
}
