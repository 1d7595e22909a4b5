//! FSD wire packet codec.
//!
//! Packets are `\r\n`-terminated lines of colon-separated fields. The first
//! field carries a short command head glued directly onto the first real
//! field with no separator (e.g. `#APCALLSIGN:...` is command `#AP` with
//! first field `CALLSIGN`). Everything here works on bytes rather than
//! `String` since legacy clients are not guaranteed to send valid UTF-8.

use std::fmt;

/// A command head, as it appears glued to the front of a packet's first field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    AddAtc,
    RemoveAtc,
    AddPilot,
    RemovePilot,
    RequestHandoff,
    Message,
    RequestWeather,
    PilotPosition,
    AtcPosition,
    Ping,
    Pong,
    AcHandoff,
    Plan,
    Sb,
    Pc,
    Weather,
    CloudData,
    WindData,
    TempData,
    RequestComm,
    ReplyComm,
    RequestAcars,
    ReplyAcars,
    Error,
    Cq,
    Cr,
    Kill,
    WindDelta,
}

/// All known command heads, longest-prefix-safe: every head below is
/// either 1, 2 or 3 bytes, and no head is itself a prefix of another, so
/// scan order does not matter for correctness (it does for speed, hence
/// `CLIENT_USED_COMMANDS` listing the hot path first).
const ALL_COMMANDS: &[(Command, &[u8])] = &[
    (Command::AddAtc, b"#AA"),
    (Command::RemoveAtc, b"#DA"),
    (Command::AddPilot, b"#AP"),
    (Command::RemovePilot, b"#DP"),
    (Command::RequestHandoff, b"$HO"),
    (Command::Message, b"#TM"),
    (Command::RequestWeather, b"#RW"),
    (Command::PilotPosition, b"@"),
    (Command::AtcPosition, b"%"),
    (Command::Ping, b"$PI"),
    (Command::Pong, b"$PO"),
    (Command::AcHandoff, b"$HA"),
    (Command::Plan, b"$FP"),
    (Command::Sb, b"#SB"),
    (Command::Pc, b"#PC"),
    (Command::Weather, b"#WX"),
    (Command::CloudData, b"#CD"),
    (Command::WindData, b"#WD"),
    (Command::TempData, b"#TD"),
    (Command::RequestComm, b"$C?"),
    (Command::ReplyComm, b"$CI"),
    (Command::RequestAcars, b"$AX"),
    (Command::ReplyAcars, b"$AR"),
    (Command::Error, b"$ER"),
    (Command::Cq, b"$CQ"),
    (Command::Cr, b"$CR"),
    (Command::Kill, b"$!!"),
    (Command::WindDelta, b"#DL"),
];

/// Commands a connected client is allowed to send to us. Anything else
/// (server-to-client-only commands like `WEATHER`/`CLOUD_DATA`/`ERROR`)
/// is rejected with a syntax error if a client sends it.
pub const CLIENT_USED_COMMANDS: &[Command] = &[
    Command::AddAtc,
    Command::RemoveAtc,
    Command::AddPilot,
    Command::RemovePilot,
    Command::RequestHandoff,
    Command::PilotPosition,
    Command::AtcPosition,
    Command::Ping,
    Command::Pong,
    Command::Message,
    Command::AcHandoff,
    Command::Plan,
    Command::Sb,
    Command::Pc,
    Command::Weather,
    Command::RequestComm,
    Command::ReplyComm,
    Command::RequestAcars,
    Command::Cq,
    Command::Cr,
    Command::Kill,
];

impl Command {
    /// The literal bytes glued to the front of a packet's first field.
    pub fn head(self) -> &'static [u8] {
        ALL_COMMANDS
            .iter()
            .find(|(cmd, _)| *cmd == self)
            .map(|(_, head)| *head)
            .expect("ALL_COMMANDS covers every Command variant")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(std::str::from_utf8(self.head()).unwrap_or("?"))
    }
}

/// Glue a command head onto the front of a field, for use as the first
/// argument to [`encode`].
pub fn concat(command: Command, first_field: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(command.head().len() + first_field.len());
    out.extend_from_slice(command.head());
    out.extend_from_slice(first_field);
    out
}

/// Join fields with `:`, dropping the trailing separator. The first field
/// normally already carries a command head produced by [`concat`].
pub fn encode<'a, I>(fields: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut out = Vec::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(b':');
        }
        out.extend_from_slice(field);
    }
    out
}

/// Split a received line into its command head (if any of `heads` is a
/// prefix of it) and its colon-separated fields, with the head stripped
/// from the first field. Returns `None` for the head when nothing in
/// `heads` matches - the caller should treat that as a syntax error.
pub fn decode<'a>(line: &'a [u8], heads: &[Command]) -> (Option<Command>, Vec<&'a [u8]>) {
    for &command in heads {
        let head = command.head();
        if line.starts_with(head) {
            let rest = &line[head.len()..];
            return (Some(command), split_fields(rest));
        }
    }
    (None, split_fields(line))
}

fn split_fields(bytes: &[u8]) -> Vec<&[u8]> {
    if bytes.is_empty() {
        return vec![b""];
    }
    bytes.split(|&b| b == b':').collect()
}

/// Parse an ASCII integer field, falling back to `default` on any
/// malformed input rather than failing the whole packet - legacy clients
/// routinely send garbage in optional numeric fields.
pub fn str_to_int(field: &[u8], default: i64) -> i64 {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Parse an ASCII float field, falling back to `default` on malformed input.
pub fn str_to_float(field: &[u8], default: f64) -> f64 {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// A callsign is valid if it's 2-12 bytes and contains none of the
/// characters FSD reserves for packet framing.
pub fn is_callsign_valid(callsign: &[u8]) -> bool {
    if callsign.len() < 2 || callsign.len() > 12 {
        return false;
    }
    !callsign
        .iter()
        .any(|&b| matches!(b, b'!' | b'@' | b'#' | b'$' | b'%' | b'*' | b':' | b'&' | b' ' | b'\t'))
}

/// Join multiple already-encoded lines with `\r\n`, with a trailing
/// `\r\n` after the last one.
pub fn join_lines<'a, I>(lines: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut out = Vec::new();
    for line in lines {
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_when_fields_hold_no_colon_or_crlf() {
        let head = concat(Command::AddPilot, b"N123AB");
        let packet = encode([head.as_slice(), b"SERVER", b"1234", b""]);
        assert_eq!(packet, b"#APN123AB:SERVER:1234:".to_vec());

        let (command, fields) = decode(&packet, &[Command::AddPilot]);
        assert_eq!(command, Some(Command::AddPilot));
        assert_eq!(fields, vec![b"N123AB".as_slice(), b"SERVER", b"1234", b""]);
    }

    #[test]
    fn unknown_head_yields_none() {
        let (command, _) = decode(b"garbage:data", CLIENT_USED_COMMANDS);
        assert_eq!(command, None);
    }

    #[test]
    fn pilot_position_head_is_a_single_at_sign() {
        let packet = encode([concat(Command::PilotPosition, b"N1").as_slice(), b"1"]);
        let (command, fields) = decode(&packet, &[Command::PilotPosition]);
        assert_eq!(command, Some(Command::PilotPosition));
        assert_eq!(fields[0], b"N1");
    }

    #[test]
    fn str_to_int_falls_back_on_garbage() {
        assert_eq!(str_to_int(b"42", 0), 42);
        assert_eq!(str_to_int(b"nope", -1), -1);
        assert_eq!(str_to_int(b"", 7), 7);
    }

    #[test]
    fn str_to_float_falls_back_on_garbage() {
        assert_eq!(str_to_float(b"1.5", 0.0), 1.5);
        assert_eq!(str_to_float(b"nope", -1.0), -1.0);
    }

    #[test]
    fn callsign_validation_boundaries() {
        assert!(!is_callsign_valid(b"A"));
        assert!(is_callsign_valid(b"N1AB"));
        assert!(is_callsign_valid(b"ABCDEFGHIJKL"));
        assert!(!is_callsign_valid(b"ABCDEFGHIJKLM"));
        assert!(!is_callsign_valid(b"HAS SPACE"));
        assert!(!is_callsign_valid(b"HAS:COLON"));
    }

    #[test]
    fn join_lines_appends_crlf_to_every_line() {
        let joined = join_lines([b"a".as_slice(), b"b"]);
        assert_eq!(joined, b"a\r\nb\r\n".to_vec());
    }
}
