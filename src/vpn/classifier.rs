//! Classification of VPN process output
//!
//! openconnect has no machine-readable output mode, so the daemon infers what
//! is happening from the text it prints. [`classify`] maps one line to a
//! [`LineEvent`]; anything it does not recognise is just a log line.
//!
//! Keyword and phrase tables are plain data so they can be extended and
//! tested on their own.

use regex::Regex;
use std::sync::LazyLock;

/// Case-insensitive substrings that mean the tunnel is up
pub const CONNECTED_PHRASES: &[&str] = &[
    "continuing in background",
    "configured as",
    "established dtls connection",
    "dtls established",
    "ssl established",
    "tunnel is up",
    "session authentication will expire",
];

/// Words that mark a line ending in `:` or `?` as an interactive prompt
pub const PROMPT_KEYWORDS: &[&str] = &[
    "password",
    "passwd",
    "passcode",
    "username",
    "user",
    "token",
    "otp",
    "code",
    "response",
    "answer",
    "enter",
    "input",
    "login",
    "credential",
    "secret",
    "pin",
];

/// Words that mean the prompt wants something the client should mask
pub const PASSWORD_KEYWORDS: &[&str] = &[
    "password",
    "passwd",
    "passcode",
    "secret",
    "key",
    "token",
    "pin",
    "otp",
    "credential",
];

/// Keyword-less lines shorter than this are still treated as prompts
pub const PROMPT_FALLBACK_MAX_LEN: usize = 60;

static IP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Configured as (\d+\.\d+\.\d+\.\d+)").expect("valid IP pattern")
});

static PID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pid (\d+)").expect("valid PID pattern"));

static TUN_DEVICE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:set up|using) (?:tun|DTLS) (?:device|connection) (\S+)")
        .expect("valid tunnel device pattern")
});

/// What a line of VPN output means for the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// The VPN is waiting for input
    Prompt { is_password: bool },
    /// The tunnel came up. Either field may be missing from the line.
    Connected { ip: Option<String>, pid: Option<u32> },
    None,
}

/// Classify one complete line. Connected phrases take precedence over
/// prompt detection.
pub fn classify(line: &str) -> LineEvent {
    if is_connected(line) {
        return LineEvent::Connected {
            ip: extract_ip(line),
            pid: extract_pid(line),
        };
    }
    if is_prompt(line) {
        return LineEvent::Prompt {
            is_password: is_password_prompt(line),
        };
    }
    LineEvent::None
}

pub fn is_connected(line: &str) -> bool {
    let lower = line.to_lowercase();
    CONNECTED_PHRASES.iter().any(|p| lower.contains(p))
}

/// Does this (possibly unterminated) text look like an interactive prompt?
pub fn is_prompt(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || !(trimmed.ends_with(':') || trimmed.ends_with('?')) {
        return false;
    }

    let lower = trimmed.to_lowercase();
    if PROMPT_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return true;
    }

    trimmed.chars().count() < PROMPT_FALLBACK_MAX_LEN
}

pub fn is_password_prompt(line: &str) -> bool {
    let lower = line.to_lowercase();
    PASSWORD_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

pub fn extract_ip(line: &str) -> Option<String> {
    IP_PATTERN
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn extract_pid(line: &str) -> Option<u32> {
    PID_PATTERN
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .filter(|pid| *pid != 0)
}

/// Tunnel device name announced by the VPN (`Set up tun device tun0`)
pub fn tunnel_device(line: &str) -> Option<String> {
    TUN_DEVICE_PATTERN
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Output chunk split into lines
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Split {
    /// Lines terminated by `\n` or `\r`
    pub lines: Vec<String>,
    /// An unterminated tail that looks like a prompt, flushed early because
    /// prompts never get a trailing newline
    pub prompt: Option<String>,
}

/// Accumulates raw pty bytes into lines
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk. Empty lines (e.g. the `\n` of a `\r\n`) are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Split {
        let mut split = Split::default();

        for &b in chunk {
            if b == b'\n' || b == b'\r' {
                if !self.buf.is_empty() {
                    split.lines.push(String::from_utf8_lossy(&self.buf).into_owned());
                    self.buf.clear();
                }
            } else {
                self.buf.push(b);
            }
        }

        if !self.buf.is_empty() {
            let partial = String::from_utf8_lossy(&self.buf);
            if is_prompt(&partial) {
                split.prompt = Some(partial.into_owned());
                self.buf.clear();
            }
        }

        split
    }

    /// Whatever is left once the stream ends
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(rest)
    }
}
