//! Line protocol of the relay.
//!
//! Every message the relay emits is two lines: an envelope line `**<sender>**` naming the
//! sender identity, followed by the payload line. Clients send single lines which are
//! either commands (`@quit`, `@wantBeAdmin`, `@kick <id>`, `@<id> <text>`) or plain text
//! to broadcast.

use std::borrow::Cow;
use std::sync::LazyLock;

use encoding_rs::Encoding;
use regex::Regex;

use super::identity::ConnectionId;

/// Marker surrounding the sender identity on an envelope line.
pub const ENVELOPE_MARKER: &str = "**";

pub const QUIT_COMMAND: &str = "@quit";
pub const CLAIM_ADMIN_COMMAND: &str = "@wantBeAdmin";

static KICK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*@kick\s+([0-9]+)\s*").expect("valid kick pattern"));

static DIRECT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*@([0-9]+)\s*").expect("valid direct pattern"));

/// Frame `message` as coming from `sender`: envelope line, line break, payload.
///
/// The result carries no trailing line break; the connection adds it on write.
pub fn sign(sender: ConnectionId, message: &str) -> String {
    format!("{ENVELOPE_MARKER}{sender}{ENVELOPE_MARKER}\n{message}")
}

/// Recover the sender identity from an envelope line.
///
/// A line is an envelope only when it starts and ends with the marker and the text
/// between the markers is an unsigned integer. Anything else is payload text.
pub fn parse_envelope(line: &str) -> Option<ConnectionId> {
    let inner = line
        .strip_prefix(ENVELOPE_MARKER)?
        .strip_suffix(ENVELOPE_MARKER)?;
    if inner.is_empty() || !inner.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    inner.parse().ok()
}

/// Decode one raw line read up to and including `\n`.
///
/// The line break (`\n` or `\r\n`) is dropped; malformed sequences are replaced.
pub fn decode_line(encoding: &'static Encoding, raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let (text, _) = encoding.decode_without_bom_handling(raw);
    text.into_owned()
}

/// Encode `text` plus a trailing line break for the wire.
pub fn encode_line(encoding: &'static Encoding, text: &str) -> Vec<u8> {
    let (bytes, _, _) = encoding.encode(text);
    let mut line = match bytes {
        Cow::Borrowed(b) => b.to_vec(),
        Cow::Owned(b) => b,
    };
    line.push(b'\n');
    line
}

/// Result of removing the first command token from the front of a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted<'a> {
    /// The whole matched token, including surrounding whitespace.
    pub token: &'a str,
    /// The identity digits inside the token.
    pub digits: &'a str,
    /// The line with the token removed. May be empty.
    pub residual: String,
}

/// Remove the first match of `pattern` from `input`.
///
/// `pattern` must have one capture group holding the identity digits.
pub fn extract_first<'a>(input: &'a str, pattern: &Regex) -> Option<Extracted<'a>> {
    let captures = pattern.captures(input)?;
    let whole = captures.get(0)?;
    let digits = captures.get(1)?.as_str();

    let mut residual = String::with_capacity(input.len() - whole.len());
    residual.push_str(&input[..whole.start()]);
    residual.push_str(&input[whole.end()..]);

    Some(Extracted {
        token: whole.as_str(),
        digits,
        residual,
    })
}

fn extract_target(input: &str, pattern: &Regex) -> Option<(ConnectionId, String)> {
    let extracted = extract_first(input, pattern)?;
    let target = extracted.digits.parse().ok()?;
    Some((target, extracted.residual))
}

/// A decoded inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Leave the chat.
    Quit,
    /// Disconnect `target`. Only recognized for the current admin.
    Kick { target: ConnectionId, rest: String },
    /// Ask for the admin role.
    ClaimAdmin,
    /// Deliver `body` to `target` only.
    Direct { target: ConnectionId, body: String },
    /// Deliver the whole line to everyone else.
    Broadcast(&'a str),
}

impl<'a> Command<'a> {
    /// Decode a raw inbound line.
    ///
    /// Rules are tried in order: quit, kick (only when `privileged`), claim-admin,
    /// direct-address, broadcast. Surrounding whitespace does not affect recognition.
    pub fn parse(raw: &'a str, privileged: bool) -> Self {
        let trimmed = raw.trim();

        if trimmed == QUIT_COMMAND {
            return Command::Quit;
        }

        if privileged {
            if let Some((target, rest)) = extract_target(raw, &KICK_PATTERN) {
                return Command::Kick { target, rest };
            }
        }

        if trimmed == CLAIM_ADMIN_COMMAND {
            return Command::ClaimAdmin;
        }

        if let Some((target, body)) = extract_target(raw, &DIRECT_PATTERN) {
            return Command::Direct { target, body };
        }

        Command::Broadcast(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_produces_envelope_and_payload_lines() {
        assert_eq!(sign(ConnectionId::new(3), "hello"), "**3**\nhello");
        assert_eq!(sign(ConnectionId::SYSTEM, ""), "**0**\n");
    }

    #[test]
    fn test_envelope_round_trip() {
        for raw in [0, 1, 2, 42, 1_000_000, u64::MAX] {
            let id = ConnectionId::new(raw);
            for payload in ["", "text"] {
                let signed = sign(id, payload);
                let envelope = signed.lines().next().unwrap();
                assert_eq!(parse_envelope(envelope), Some(id));
            }
        }
    }

    #[test]
    fn test_envelope_requires_both_markers() {
        assert_eq!(parse_envelope("**12"), None);
        assert_eq!(parse_envelope("12**"), None);
        assert_eq!(parse_envelope("*12*"), None);
        assert_eq!(parse_envelope("**"), None);
        assert_eq!(parse_envelope("***"), None);
    }

    #[test]
    fn test_envelope_rejects_non_numeric() {
        assert_eq!(parse_envelope("**abc**"), None);
        assert_eq!(parse_envelope("****"), None);
        assert_eq!(parse_envelope("**-1**"), None);
        assert_eq!(parse_envelope("**+1**"), None);
        assert_eq!(parse_envelope("** 1**"), None);
        assert_eq!(parse_envelope("hello"), None);
    }

    #[test]
    fn test_parse_quit_and_claim_admin_ignore_whitespace() {
        assert_eq!(Command::parse("@quit", false), Command::Quit);
        assert_eq!(Command::parse("  @quit \t", true), Command::Quit);
        assert_eq!(Command::parse(" @wantBeAdmin ", false), Command::ClaimAdmin);
        assert_eq!(Command::parse("@wantBeAdmin", true), Command::ClaimAdmin);
    }

    #[test]
    fn test_commands_must_match_exactly() {
        assert_eq!(Command::parse("@quit now", false), Command::Broadcast("@quit now"));
        assert_eq!(Command::parse("@QUIT", false), Command::Broadcast("@QUIT"));
        assert_eq!(
            Command::parse("@wantBeAdmin please", false),
            Command::Broadcast("@wantBeAdmin please")
        );
    }

    #[test]
    fn test_kick_only_for_privileged_sender() {
        assert_eq!(
            Command::parse("@kick 2", true),
            Command::Kick {
                target: ConnectionId::new(2),
                rest: String::new(),
            }
        );
        assert_eq!(Command::parse("@kick 2", false), Command::Broadcast("@kick 2"));
    }

    #[test]
    fn test_kick_keeps_residual_text() {
        assert_eq!(
            Command::parse("  @kick   15  bye now", true),
            Command::Kick {
                target: ConnectionId::new(15),
                rest: "bye now".to_string(),
            }
        );
    }

    #[test]
    fn test_malformed_kick_falls_through() {
        assert_eq!(Command::parse("@kick", true), Command::Broadcast("@kick"));
        assert_eq!(Command::parse("@kick abc", true), Command::Broadcast("@kick abc"));
        assert_eq!(Command::parse("@kick2", true), Command::Broadcast("@kick2"));
    }

    #[test]
    fn test_direct_address() {
        assert_eq!(
            Command::parse("@7 hi there", false),
            Command::Direct {
                target: ConnectionId::new(7),
                body: "hi there".to_string(),
            }
        );
        assert_eq!(
            Command::parse("  @7", true),
            Command::Direct {
                target: ConnectionId::new(7),
                body: String::new(),
            }
        );
        assert_eq!(
            Command::parse("@7hello", false),
            Command::Direct {
                target: ConnectionId::new(7),
                body: "hello".to_string(),
            }
        );
    }

    #[test]
    fn test_direct_address_must_lead() {
        assert_eq!(Command::parse("hi @7", false), Command::Broadcast("hi @7"));
    }

    #[test]
    fn test_overflowing_identity_is_not_a_command() {
        let line = "@99999999999999999999999 hi";
        assert_eq!(Command::parse(line, false), Command::Broadcast(line));
    }

    #[test]
    fn test_plain_text_broadcasts_raw_line() {
        assert_eq!(Command::parse("  hello  ", false), Command::Broadcast("  hello  "));
        assert_eq!(Command::parse("", false), Command::Broadcast(""));
    }

    #[test]
    fn test_line_decoding_strips_line_break() {
        assert_eq!(decode_line(encoding_rs::UTF_8, b"hello\r\n"), "hello");
        assert_eq!(decode_line(encoding_rs::UTF_8, b"hello\n"), "hello");
        assert_eq!(decode_line(encoding_rs::UTF_8, b"tail"), "tail");
        assert_eq!(decode_line(encoding_rs::UTF_8, b"\n"), "");
    }

    #[test]
    fn test_line_coding_honors_charset() {
        let cp1251 = encoding_rs::WINDOWS_1251;
        let wire = encode_line(cp1251, "Привет");
        assert_eq!(wire, vec![0xCF, 0xF0, 0xE8, 0xE2, 0xE5, 0xF2, b'\n']);
        assert_eq!(decode_line(cp1251, &wire), "Привет");
        assert_eq!(encode_line(encoding_rs::UTF_8, "**1**\nhi"), b"**1**\nhi\n");
    }

    #[test]
    fn test_extract_first_removes_only_leading_token() {
        let extracted = extract_first(" @4 say @5 hi", &DIRECT_PATTERN).unwrap();
        assert_eq!(extracted.token, " @4 ");
        assert_eq!(extracted.digits, "4");
        assert_eq!(extracted.residual, "say @5 hi");

        assert!(extract_first("no command", &DIRECT_PATTERN).is_none());
    }
}
