//! Line-oriented control commands read from the operator's input.

/// One parsed control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// `broadcast:<text>`; everything after the first `:` is the content.
    Broadcast(String),
    /// `peers`: log the current peer set.
    Peers,
    /// Anything else. Ignored by the server.
    Unknown(String),
    /// Blank line.
    Empty,
}

impl ControlCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Self::Empty;
        }
        match line.split_once(':') {
            Some(("broadcast", content)) => Self::Broadcast(content.to_string()),
            Some(_) => Self::Unknown(line.to_string()),
            None if line.trim() == "peers" => Self::Peers,
            None => Self::Unknown(line.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_takes_rest_of_line() {
        assert_eq!(
            ControlCommand::parse("broadcast:hello"),
            ControlCommand::Broadcast("hello".into())
        );
        assert_eq!(
            ControlCommand::parse("broadcast:a:b:c\n"),
            ControlCommand::Broadcast("a:b:c".into())
        );
        assert_eq!(
            ControlCommand::parse("broadcast:"),
            ControlCommand::Broadcast(String::new())
        );
    }

    #[test]
    fn peers_and_blank() {
        assert_eq!(ControlCommand::parse("peers"), ControlCommand::Peers);
        assert_eq!(ControlCommand::parse("  \r\n"), ControlCommand::Empty);
    }

    #[test]
    fn everything_else_is_unknown() {
        assert_eq!(
            ControlCommand::parse("broadcast"),
            ControlCommand::Unknown("broadcast".into())
        );
        assert_eq!(
            ControlCommand::parse("quit:now"),
            ControlCommand::Unknown("quit:now".into())
        );
        assert_eq!(
            ControlCommand::parse("Broadcast:x"),
            ControlCommand::Unknown("Broadcast:x".into())
        );
    }
}
