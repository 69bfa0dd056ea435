//! Protocol codec: parses a request line into a typed [`Command`] and
//! formats a [`Response`] back into the wire line shape.
//!
//! PV and motor names may themselves contain colons (`BL02:SAMPLE:X`);
//! for the value-bearing verbs the *last* colon in the line separates
//! the numeric tail from the target.

use crate::numeric::{format_g6, parse_double};

/// A parsed, dispatch-ready command. `Invalid` is the sentinel the codec
/// returns for anything malformed; the server surfaces it as
/// `ERR:UNKNOWN_CMD` without closing the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Quit,
    Stop,
    List(String),
    Get(String),
    Put(String, f64),
    Move(String, f64),
    Status(String),
    Monitor(String, u64),
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnknownCmd,
    UnknownPv,
    InvalidValue,
    MotorFault,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnknownCmd => "UNKNOWN_CMD",
            ErrorCode::UnknownPv => "UNKNOWN_PV",
            ErrorCode::InvalidValue => "INVALID_VALUE",
            ErrorCode::MotorFault => "MOTOR_FAULT",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    OkPayload(String),
    Err(ErrorCode),
    Data(f64),
}

impl Response {
    pub fn ok_value(value: f64) -> Self {
        Response::OkPayload(format_g6(value))
    }
}

/// Truncates a name to at most `pv_name_max - 1` bytes on a char
/// boundary. Names this long simply fail to resolve later; truncation
/// itself never errors.
fn truncate_name(name: &str, pv_name_max: usize) -> String {
    let limit = pv_name_max.saturating_sub(1);
    if name.len() <= limit {
        return name.to_owned();
    }
    let mut end = limit;
    while end > 0 && !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_owned()
}

/// Splits `rest` on its *last* colon into `(target, numeric_tail)`.
/// Returns `None` if there is no colon (missing value field).
fn split_last_colon(rest: &str) -> Option<(&str, &str)> {
    let idx = rest.rfind(':')?;
    Some((&rest[..idx], &rest[idx + 1..]))
}

/// Parses one request line (already stripped of its trailing `\n`/`\r`).
pub fn parse_line(line: &str, pv_name_max: usize) -> Command {
    if line.is_empty() {
        return Command::Invalid;
    }
    let (verb, rest) = match line.find(':') {
        Some(idx) => (&line[..idx], Some(&line[idx + 1..])),
        None => (line, None),
    };

    match (verb, rest) {
        ("PING", None) => Command::Ping,
        ("QUIT", None) => Command::Quit,
        ("STOP", None) => Command::Stop,
        ("LIST", None) => Command::List(String::new()),
        ("LIST", Some(pattern)) => Command::List(pattern.to_owned()),
        ("GET", Some(target)) if !target.is_empty() => {
            Command::Get(truncate_name(target, pv_name_max))
        }
        ("STATUS", Some(target)) if !target.is_empty() => {
            Command::Status(truncate_name(target, pv_name_max))
        }
        ("PUT", Some(rest)) => match split_last_colon(rest) {
            Some((target, value_str)) if !target.is_empty() => match parse_double(value_str) {
                Some(value) => Command::Put(truncate_name(target, pv_name_max), value),
                None => Command::Invalid,
            },
            _ => Command::Invalid,
        },
        ("MOVE", Some(rest)) => match split_last_colon(rest) {
            Some((target, value_str)) if !target.is_empty() => match parse_double(value_str) {
                Some(value) => Command::Move(truncate_name(target, pv_name_max), value),
                None => Command::Invalid,
            },
            _ => Command::Invalid,
        },
        ("MONITOR", Some(rest)) => match split_last_colon(rest) {
            Some((target, interval_str)) if !target.is_empty() => {
                match parse_double(interval_str) {
                    Some(value) if value >= 0.0 => {
                        Command::Monitor(truncate_name(target, pv_name_max), value as u64)
                    }
                    _ => Command::Invalid,
                }
            }
            _ => Command::Invalid,
        },
        _ => Command::Invalid,
    }
}

/// Formats a response line, truncating the payload if it would overflow
/// `response_buffer_size` (header + terminator always fit; only the
/// payload is ever cut, silently).
pub fn format_response(response: &Response, response_buffer_size: usize) -> String {
    let (header, payload): (&str, Option<String>) = match response {
        Response::Ok => ("OK", None),
        Response::OkPayload(p) => ("OK", Some(p.clone())),
        Response::Err(code) => ("ERR", Some(code.as_str().to_owned())),
        Response::Data(value) => ("DATA", Some(format_g6(*value))),
    };

    match payload {
        None => format!("{header}\n"),
        Some(p) => {
            // header + ':' + payload + '\n' must fit in response_buffer_size
            let overhead = header.len() + 1 + 1;
            let max_payload = response_buffer_size.saturating_sub(overhead);
            let mut end = p.len().min(max_payload);
            while end > 0 && !p.is_char_boundary(end) {
                end -= 1;
            }
            format!("{header}:{}\n", &p[..end])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME_MAX: usize = 64;

    #[test]
    fn parses_bare_verbs() {
        assert_eq!(parse_line("PING", NAME_MAX), Command::Ping);
        assert_eq!(parse_line("QUIT", NAME_MAX), Command::Quit);
        assert_eq!(parse_line("STOP", NAME_MAX), Command::Stop);
        assert_eq!(parse_line("LIST", NAME_MAX), Command::List(String::new()));
    }

    #[test]
    fn rejects_bare_verbs_with_trailing_fields() {
        assert_eq!(parse_line("PING:foo", NAME_MAX), Command::Invalid);
        assert_eq!(parse_line("QUIT:foo", NAME_MAX), Command::Invalid);
    }

    #[test]
    fn parses_get_and_status_with_colons_in_target() {
        assert_eq!(
            parse_line("GET:BL02:MONO:ENERGY", NAME_MAX),
            Command::Get("BL02:MONO:ENERGY".to_owned())
        );
        assert_eq!(
            parse_line("STATUS:BL02:SAMPLE:X", NAME_MAX),
            Command::Status("BL02:SAMPLE:X".to_owned())
        );
    }

    #[test]
    fn parses_list_with_pattern() {
        assert_eq!(
            parse_line("LIST:BL02:*", NAME_MAX),
            Command::List("BL02:*".to_owned())
        );
    }

    #[test]
    fn parses_put_splitting_on_last_colon() {
        assert_eq!(
            parse_line("PUT:BL02:MONO:ENERGY:7112", NAME_MAX),
            Command::Put("BL02:MONO:ENERGY".to_owned(), 7112.0)
        );
    }

    #[test]
    fn parses_move_and_monitor() {
        assert_eq!(
            parse_line("MOVE:BL02:SAMPLE:X:1000", NAME_MAX),
            Command::Move("BL02:SAMPLE:X".to_owned(), 1000.0)
        );
        assert_eq!(
            parse_line("MONITOR:BL02:DET:I0:100", NAME_MAX),
            Command::Monitor("BL02:DET:I0".to_owned(), 100)
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(parse_line("", NAME_MAX), Command::Invalid);
        assert_eq!(parse_line("PUT:NOVALUE", NAME_MAX), Command::Invalid);
        assert_eq!(parse_line("PUT:BAD:notanumber", NAME_MAX), Command::Invalid);
        assert_eq!(parse_line("FROB:x", NAME_MAX), Command::Invalid);
        assert_eq!(parse_line("lowercase", NAME_MAX), Command::Invalid);
    }

    #[test]
    fn truncates_overlong_names() {
        let long = "A".repeat(200);
        match parse_line(&format!("GET:{long}"), NAME_MAX) {
            Command::Get(name) => assert_eq!(name.len(), NAME_MAX - 1),
            other => panic!("expected Get, got {other:?}"),
        }
    }

    #[test]
    fn formats_responses() {
        assert_eq!(format_response(&Response::Ok, 4096), "OK\n");
        assert_eq!(
            format_response(&Response::OkPayload("PONG".into()), 4096),
            "OK:PONG\n"
        );
        assert_eq!(
            format_response(&Response::Err(ErrorCode::UnknownPv), 4096),
            "ERR:UNKNOWN_PV\n"
        );
        assert_eq!(
            format_response(&Response::Data(7112.0), 4096),
            "DATA:7112\n"
        );
    }

    #[test]
    fn truncates_oversized_payload_silently() {
        let huge = "x".repeat(100);
        let out = format_response(&Response::OkPayload(huge), 10);
        assert!(out.len() <= 10);
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn round_trips_ping() {
        let cmd = parse_line("PING", NAME_MAX);
        assert_eq!(cmd, Command::Ping);
        let response = Response::OkPayload("PONG".into());
        assert_eq!(format_response(&response, 4096), "OK:PONG\n");
    }
}
