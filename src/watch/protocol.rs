//! Inbound observer messages.
//!
//! `<target>@<client_key>` (re)subscribes the connection; any other text is a
//! keepalive. Messages longer than [`MAX_MESSAGE_LEN`] bytes end the
//! connection.

/// Longest inbound message accepted, in bytes.
pub const MAX_MESSAGE_LEN: usize = 50;

/// A parsed inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound<'a> {
    Subscribe { target: &'a str, client_key: &'a str },
    Keepalive,
    Oversized,
}

/// Classify one inbound text frame.
pub fn parse(msg: &str) -> Inbound<'_> {
    if msg.len() > MAX_MESSAGE_LEN {
        return Inbound::Oversized;
    }

    match msg.split_once('@') {
        Some((target, client_key)) if !target.is_empty() && !client_key.is_empty() => {
            Inbound::Subscribe { target, client_key }
        }
        _ => Inbound::Keepalive,
    }
}
