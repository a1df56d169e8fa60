#![forbid(unsafe_code)]

use super::{JsonRpcRequest, json_rpc_error};
use serde_json::Value;
use std::io::{BufRead, Write};

const MAX_CONTENT_LENGTH_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TransportMode {
    NewlineJson,
    ContentLength,
}

pub(crate) fn detect_mode_from_first_line(line: &str) -> Option<TransportMode> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(TransportMode::NewlineJson);
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("content-length:") || lower.starts_with("content-type:") {
        return Some(TransportMode::ContentLength);
    }
    None
}

pub(crate) fn parse_content_length_header(line: &str) -> Option<usize> {
    let (key, value) = line.trim().split_once(':')?;
    if !key.trim().eq_ignore_ascii_case("content-length") {
        return None;
    }
    value.trim().parse::<usize>().ok()
}

/// Read one Content-Length frame. `first_header` is a header line already
/// consumed while detecting the transport mode.
pub(crate) fn read_content_length_frame<R: BufRead>(
    reader: &mut R,
    first_header: Option<String>,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = match first_header {
        Some(seed) => seed,
        None => {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            line
        }
    };

    let mut content_length = parse_content_length_header(&header);
    while !header.trim_end().is_empty() {
        header.clear();
        if reader.read_line(&mut header)? == 0 {
            return Ok(None);
        }
        if content_length.is_none() {
            content_length = parse_content_length_header(&header);
        }
    }

    let Some(len) = content_length else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        ));
    };
    if len > MAX_CONTENT_LENGTH_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Content-Length exceeds max allowed size",
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

/// Read the next frame in `mode`, skipping blank lines in newline mode.
pub(crate) fn read_frame<R: BufRead>(
    reader: &mut R,
    mode: TransportMode,
) -> std::io::Result<Option<Vec<u8>>> {
    match mode {
        TransportMode::ContentLength => read_content_length_frame(reader, None),
        TransportMode::NewlineJson => loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.as_bytes().to_vec()));
            }
        },
    }
}

pub(crate) fn write_frame<W: Write>(
    writer: &mut W,
    mode: TransportMode,
    value: &Value,
) -> std::io::Result<()> {
    let body = serde_json::to_vec(value).map_err(std::io::Error::other)?;
    match mode {
        TransportMode::NewlineJson => {
            writer.write_all(&body)?;
            writer.write_all(b"\n")?;
        }
        TransportMode::ContentLength => {
            write!(writer, "Content-Length: {}\r\n\r\n", body.len())?;
            writer.write_all(&body)?;
        }
    }
    writer.flush()
}

pub(crate) fn request_expects_response(body: &[u8]) -> bool {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return true;
    };
    let Some(obj) = value.as_object() else {
        return true;
    };
    !matches!(obj.get("id"), Some(Value::Null) | None)
}

pub(crate) fn parse_request(body: &[u8]) -> Result<JsonRpcRequest, Value> {
    let data: Value = serde_json::from_slice(body)
        .map_err(|e| json_rpc_error(None, -32700, &format!("Parse error: {e}")))?;

    let (id, has_method) = match data.as_object() {
        Some(obj) => (obj.get("id").cloned(), obj.contains_key("method")),
        None => return Err(json_rpc_error(None, -32600, "Invalid Request")),
    };
    if !has_method {
        return Err(json_rpc_error(id, -32600, "Invalid Request"));
    }

    serde_json::from_value::<JsonRpcRequest>(data)
        .map_err(|e| json_rpc_error(id, -32600, &format!("Invalid Request: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn detects_both_transports() {
        assert_eq!(
            detect_mode_from_first_line("  {\"method\":\"x\"}"),
            Some(TransportMode::NewlineJson)
        );
        assert_eq!(
            detect_mode_from_first_line("Content-Length: 12\r\n"),
            Some(TransportMode::ContentLength)
        );
        assert_eq!(detect_mode_from_first_line("\r\n"), None);
    }

    #[test]
    fn content_length_frames_round_trip() {
        let mut out = Vec::new();
        let value = json!({ "jsonrpc": "2.0", "id": 1, "method": "get_concurrent" });
        write_frame(&mut out, TransportMode::ContentLength, &value).expect("write");
        let mut reader = Cursor::new(out);
        let body = read_frame(&mut reader, TransportMode::ContentLength)
            .expect("read")
            .expect("frame");
        let request = parse_request(&body).expect("request");
        assert_eq!(request.method, "get_concurrent");
        assert_eq!(request.id, Some(json!(1)));
        assert!(read_frame(&mut reader, TransportMode::ContentLength).expect("eof").is_none());
    }

    #[test]
    fn oversized_and_headerless_frames_are_rejected() {
        let mut reader = Cursor::new(b"Content-Length: 999999999\r\n\r\n".to_vec());
        assert!(read_content_length_frame(&mut reader, None).is_err());
        let mut reader = Cursor::new(b"Content-Type: json\r\n\r\n{}".to_vec());
        assert!(read_content_length_frame(&mut reader, None).is_err());
    }

    #[test]
    fn bad_requests_map_to_json_rpc_errors() {
        let err = parse_request(b"not json").expect_err("parse");
        assert_eq!(err["error"]["code"], json!(-32700));
        let err = parse_request(br#"{"id":4}"#).expect_err("method");
        assert_eq!(err["error"]["code"], json!(-32600));
        assert_eq!(err["id"], json!(4));
        assert!(!request_expects_response(br#"{"method":"x"}"#));
        assert!(request_expects_response(br#"{"method":"x","id":"a"}"#));
    }
}
