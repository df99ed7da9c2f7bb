use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// An IRC protocol message per RFC 2812, with IRCv3 message tags.
///
/// Wire format: `[@tags ][:prefix ]COMMAND [params...] [:trailing]\r\n`
///
/// Examples:
///   `:nick!user@host PRIVMSG #channel :Hello world\r\n`
///   `@time=2024-01-01T00:00:00.000Z :nick!u@h PRIVMSG #chan :hi\r\n`
///   `PING :irc.example.org\r\n`
#[derive(Debug, Clone, PartialEq)]
pub struct IrcMessage {
    pub tags: HashMap<String, String>,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcMessage {
    /// Parse a single IRC line (trailing \r\n tolerated).
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut remaining = line;
        let mut tags = HashMap::new();
        let mut prefix = None;

        // Parse optional tags
        if let Some(rest) = remaining.strip_prefix('@') {
            match rest.find(' ') {
                Some(idx) => {
                    tags = parse_tags(&rest[..idx]);
                    remaining = rest[idx..].trim_start();
                }
                None => return Err(ParseError::MissingCommand),
            }
        }

        // Parse optional prefix
        if let Some(rest) = remaining.strip_prefix(':') {
            match rest.find(' ') {
                Some(idx) => {
                    prefix = Some(rest[..idx].to_string());
                    remaining = rest[idx..].trim_start();
                }
                None => return Err(ParseError::MissingCommand),
            }
        }

        // Parse command
        let command;
        match remaining.find(' ') {
            Some(idx) => {
                command = remaining[..idx].to_uppercase();
                remaining = remaining[idx..].trim_start();
            }
            None => {
                command = remaining.to_uppercase();
                remaining = "";
            }
        }

        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        // Parse parameters
        let mut params = Vec::new();
        while !remaining.is_empty() {
            if let Some(trailing) = remaining.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }

            match remaining.find(' ') {
                Some(idx) => {
                    params.push(remaining[..idx].to_string());
                    remaining = remaining[idx..].trim_start();
                }
                None => {
                    params.push(remaining.to_string());
                    break;
                }
            }
        }

        Ok(IrcMessage {
            tags,
            prefix,
            command,
            params,
        })
    }

    /// Sender nick: the prefix up to `!`, or the whole prefix for server
    /// sources. Empty when there is no prefix.
    pub fn nick(&self) -> &str {
        match &self.prefix {
            Some(prefix) => prefix.split('!').next().unwrap_or(""),
            None => "",
        }
    }

    /// The `time=` tag (IRCv3 server-time), when present and well-formed.
    pub fn server_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.tags.get("time")?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Format this message back to IRC wire format (without trailing \r\n).
    pub fn format(&self) -> String {
        let mut out = String::with_capacity(512);

        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        for (i, param) in self.params.iter().enumerate() {
            out.push(' ');
            // Last param gets colon prefix if it contains spaces or is empty
            if i == self.params.len() - 1
                && (param.contains(' ') || param.is_empty() || param.starts_with(':'))
            {
                out.push(':');
            }
            out.push_str(param);
        }

        out
    }
}

/// Parse an IRCv3 tag string: `key=value;key2;key3=v`. Escapes per the
/// message-tags spec: `\:` `\s` `\\` `\r` `\n`.
fn parse_tags(raw: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for pair in raw.split(';') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => tags.insert(key.to_string(), unescape_tag_value(value)),
            None => tags.insert(pair.to_string(), String::new()),
        };
    }
    tags
}

fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[derive(Debug, PartialEq)]
pub enum ParseError {
    Empty,
    MissingCommand,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty message"),
            ParseError::MissingCommand => write!(f, "missing command"),
        }
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_command() {
        let msg = IrcMessage::parse("NICK alice").unwrap();
        assert!(msg.tags.is_empty());
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "NICK");
        assert_eq!(msg.params, vec!["alice"]);
    }

    #[test]
    fn test_parse_with_prefix() {
        let msg = IrcMessage::parse(":alice!alice@host PRIVMSG #general :Hello world").unwrap();
        assert_eq!(msg.prefix, Some("alice!alice@host".into()));
        assert_eq!(msg.nick(), "alice");
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#general", "Hello world"]);
    }

    #[test]
    fn test_parse_numeric_reply() {
        let msg =
            IrcMessage::parse(":irc.example.org 353 alice = #lobby :@alice +bob carol").unwrap();
        assert_eq!(msg.command, "353");
        assert_eq!(msg.nick(), "irc.example.org");
        assert_eq!(msg.params, vec!["alice", "=", "#lobby", "@alice +bob carol"]);
    }

    #[test]
    fn test_parse_server_time_tag() {
        let msg = IrcMessage::parse(
            "@time=2024-06-01T12:30:00.000Z :bob!b@host PRIVMSG #lobby :hi",
        )
        .unwrap();
        let time = msg.server_time().unwrap();
        assert_eq!(time.to_rfc3339(), "2024-06-01T12:30:00+00:00");
    }

    #[test]
    fn test_parse_tag_escapes() {
        let msg = IrcMessage::parse("@msg=a\\sb\\:c;flag :bob PRIVMSG #x :y").unwrap();
        assert_eq!(msg.tags.get("msg").unwrap(), "a b;c");
        assert_eq!(msg.tags.get("flag").unwrap(), "");
    }

    #[test]
    fn test_malformed_time_tag_is_none() {
        let msg = IrcMessage::parse("@time=yesterday :bob PRIVMSG #x :y").unwrap();
        assert!(msg.server_time().is_none());
    }

    #[test]
    fn test_parse_no_params() {
        let msg = IrcMessage::parse("QUIT").unwrap();
        assert_eq!(msg.command, "QUIT");
        assert!(msg.params.is_empty());
    }

    #[test]
    fn test_parse_strips_crlf() {
        let msg = IrcMessage::parse("PING :irc.example.org\r\n").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["irc.example.org"]);
    }

    #[test]
    fn test_parse_command_case_insensitive() {
        let msg = IrcMessage::parse("privmsg #test :hello").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(IrcMessage::parse(""), Err(ParseError::Empty));
    }

    #[test]
    fn test_parse_prefix_only() {
        assert_eq!(IrcMessage::parse(":prefix"), Err(ParseError::MissingCommand));
    }

    #[test]
    fn test_format_with_trailing() {
        let msg = IrcMessage {
            tags: HashMap::new(),
            prefix: None,
            command: "PRIVMSG".into(),
            params: vec!["#general".into(), "Hello world".into()],
        };
        assert_eq!(msg.format(), "PRIVMSG #general :Hello world");
    }

    #[test]
    fn test_roundtrip() {
        let original = ":server PRIVMSG #channel :Hello world";
        let msg = IrcMessage::parse(original).unwrap();
        assert_eq!(msg.format(), original);
    }
}
