//! # Message
//!
//! Parses a single PSX protocol line into a tagged union instead of
//! matching on a bare `key` string scattered through the Rule Engine. Every
//! line is `key` or `key=value`; a handful of keys are protocol verbs with
//! their own meaning, everything else is a plain network variable update.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `name=` or `name=id:display` — a peer announcing itself.
    Name(String),
    /// `clientName=...` — same shape as `name=`, different wire keyword.
    ClientName(String),
    /// `addon:payload` sent as the value of an `addon=` line.
    Addon(String),
    Demand(String),
    Again,
    Start,
    PleaseBeSoKindAndQuit,
    Layout,
    Load1,
    Load2,
    Load3,
    Bang,
    Exit,
    NoLong,
    /// A plain `key=value` network variable update.
    KeyValue { key: String, value: String },
}

impl Message {
    /// Returns `None` for an empty line or one containing an embedded
    /// newline, both of which the original protocol treats as malformed.
    pub fn parse(line: &str) -> Option<Self> {
        if line.is_empty() || line.contains('\n') || line.contains('\r') {
            return None;
        }
        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k, v.to_string()),
            None => (line, String::new()),
        };
        Some(match key {
            "name" => Message::Name(value),
            "clientName" => Message::ClientName(value),
            "addon" => Message::Addon(value),
            "demand" => Message::Demand(value),
            "again" => Message::Again,
            "start" => Message::Start,
            "pleaseBeSoKindAndQuit" => Message::PleaseBeSoKindAndQuit,
            "layout" => Message::Layout,
            "load1" => Message::Load1,
            "load2" => Message::Load2,
            "load3" => Message::Load3,
            "bang" => Message::Bang,
            "exit" => Message::Exit,
            "nolong" => Message::NoLong,
            _ => Message::KeyValue {
                key: key.to_string(),
                value,
            },
        })
    }
}
