use thiserror::Error;

const SIGNIN_USAGE: &str = "/signin <email> <password>";
const SIGNUP_USAGE: &str = "/signup <email> <password> <full name>";
const FEED_USAGE: &str = "/feed [limit]";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Unknown command: {0} (try /help)")]
    Unknown(String),
}

/// One line of REPL input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ask { prompt: String },
    Help,
    Clear,
    Quit,
    Feed { limit: Option<usize> },
    SignIn { email: String, password: String },
    SignUp { email: String, password: String, full_name: String },
    SignOut,
    WhoAmI,
}

impl Command {
    /// Lines starting with `/` are commands; anything else is sent to the assistant.
    pub fn parse(input: &str) -> Result<Self, CommandError> {
        let trimmed = input.trim();
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Ok(Self::Ask {
                prompt: input.to_string(),
            });
        };

        let mut parts = rest.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        Ok(match (name, args.as_slice()) {
            ("help", []) => Self::Help,
            ("clear", []) => Self::Clear,
            ("quit" | "exit", []) => Self::Quit,
            ("signout", []) => Self::SignOut,
            ("whoami", []) => Self::WhoAmI,
            ("feed", []) => Self::Feed { limit: None },
            ("feed", [limit]) => Self::Feed {
                limit: Some(limit.parse().map_err(|_| CommandError::Usage(FEED_USAGE))?),
            },
            ("feed", _) => return Err(CommandError::Usage(FEED_USAGE)),
            ("signin", [email, password]) => Self::SignIn {
                email: email.to_string(),
                password: password.to_string(),
            },
            ("signin", _) => return Err(CommandError::Usage(SIGNIN_USAGE)),
            ("signup", [email, password, name @ ..]) if !name.is_empty() => Self::SignUp {
                email: email.to_string(),
                password: password.to_string(),
                full_name: name.join(" "),
            },
            ("signup", _) => return Err(CommandError::Usage(SIGNUP_USAGE)),
            _ => return Err(CommandError::Unknown(format!("/{}", name))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_prompt() {
        assert_eq!(
            Command::parse("Who painted the Night Watch?"),
            Ok(Command::Ask {
                prompt: "Who painted the Night Watch?".to_string()
            })
        );
    }

    #[test]
    fn simple_commands() {
        assert_eq!(Command::parse("/help"), Ok(Command::Help));
        assert_eq!(Command::parse("  /clear "), Ok(Command::Clear));
        assert_eq!(Command::parse("/exit"), Ok(Command::Quit));
        assert_eq!(Command::parse("/whoami"), Ok(Command::WhoAmI));
        assert_eq!(Command::parse("/feed"), Ok(Command::Feed { limit: None }));
        assert_eq!(Command::parse("/feed 3"), Ok(Command::Feed { limit: Some(3) }));
    }

    #[test]
    fn signup_joins_full_name() {
        assert_eq!(
            Command::parse("/signup ada@example.com pw Ada King Lovelace"),
            Ok(Command::SignUp {
                email: "ada@example.com".to_string(),
                password: "pw".to_string(),
                full_name: "Ada King Lovelace".to_string(),
            })
        );
    }

    #[test]
    fn bad_arguments_show_usage() {
        assert_eq!(
            Command::parse("/signin ada@example.com"),
            Err(CommandError::Usage(SIGNIN_USAGE))
        );
        assert_eq!(Command::parse("/signup a b"), Err(CommandError::Usage(SIGNUP_USAGE)));
        assert_eq!(Command::parse("/feed many"), Err(CommandError::Usage(FEED_USAGE)));
    }

    #[test]
    fn unknown_command() {
        assert_eq!(
            Command::parse("/paint"),
            Err(CommandError::Unknown("/paint".to_string()))
        );
    }
}
