//! Administrative commands queued for the session thread.

use std::net::SocketAddr;

use crate::server::notify::Notifier;

/// Administrative command lines waiting for the next tick. Shares its
/// storage with every clone.
pub type CommandQueue = Notifier;

const DEFAULT_KICK_REASON: &str = "Kicked by server";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// Broadcast a notification to every connected client.
    Notify(String),
    Kick { identity: SocketAddr, reason: String },
    /// Stop the server.
    Kill,
    /// Log the session status.
    Status,
    /// Anything else is handed to the simulation.
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("'{0}' needs an argument")]
    MissingArgument(&'static str),
    #[error("'{0}' is not an address")]
    BadAddress(String),
}

impl AdminCommand {
    /// Parses one command line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "notify" | "say" => {
                if rest.is_empty() {
                    return Err(CommandError::MissingArgument("notify"));
                }
                AdminCommand::Notify(rest.to_string())
            }
            "kick" => {
                let (target, reason) = match rest.split_once(char::is_whitespace) {
                    Some((target, reason)) => (target, reason.trim()),
                    None => (rest, ""),
                };
                if target.is_empty() {
                    return Err(CommandError::MissingArgument("kick"));
                }
                let identity = target
                    .parse()
                    .map_err(|_| CommandError::BadAddress(target.to_string()))?;
                let reason = if reason.is_empty() {
                    DEFAULT_KICK_REASON
                } else {
                    reason
                };
                AdminCommand::Kick {
                    identity,
                    reason: reason.to_string(),
                }
            }
            "kill" | "quit" => AdminCommand::Kill,
            "status" => AdminCommand::Status,
            _ => AdminCommand::Custom(line.to_string()),
        };
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_builtins() {
        assert_eq!(
            AdminCommand::parse("notify  Round over ").unwrap(),
            Some(AdminCommand::Notify("Round over".into()))
        );
        assert_eq!(AdminCommand::parse("KILL").unwrap(), Some(AdminCommand::Kill));
        assert_eq!(
            AdminCommand::parse("status").unwrap(),
            Some(AdminCommand::Status)
        );
        assert_eq!(AdminCommand::parse("   ").unwrap(), None);
    }

    #[test]
    fn parses_kick_with_and_without_reason() {
        let addr: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        assert_eq!(
            AdminCommand::parse("kick 10.0.0.2:5000 spamming chat").unwrap(),
            Some(AdminCommand::Kick {
                identity: addr,
                reason: "spamming chat".into()
            })
        );
        assert_eq!(
            AdminCommand::parse("kick 10.0.0.2:5000").unwrap(),
            Some(AdminCommand::Kick {
                identity: addr,
                reason: DEFAULT_KICK_REASON.into()
            })
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        assert_eq!(
            AdminCommand::parse("kick nobody"),
            Err(CommandError::BadAddress("nobody".into()))
        );
        assert_eq!(
            AdminCommand::parse("notify"),
            Err(CommandError::MissingArgument("notify"))
        );
    }

    #[test]
    fn unknown_verbs_go_to_the_simulation() {
        assert_eq!(
            AdminCommand::parse("spawn bot 3").unwrap(),
            Some(AdminCommand::Custom("spawn bot 3".into()))
        );
    }
}
