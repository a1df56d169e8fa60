#![forbid(unsafe_code)]

use super::framing::{TransportMode, read_frame, write_frame};
use crate::error::ControllerError;
use serde_json::{Map as JsonMap, Value, json};
use std::collections::VecDeque;
use std::io::BufReader;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Blocking client for the controller RPC. Console notifications that
/// arrive while waiting for a response are buffered.
pub struct RpcClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    token: String,
    next_id: u64,
    notifications: VecDeque<Value>,
}

impl RpcClient {
    pub fn connect(addr: impl ToSocketAddrs, token: impl Into<String>) -> Result<Self, ControllerError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
            token: token.into(),
            next_id: 1,
            notifications: VecDeque::new(),
        })
    }

    pub fn call(&mut self, method: &str, params: Value) -> Result<Value, ControllerError> {
        let mut params = match params {
            Value::Object(map) => map,
            Value::Null => JsonMap::new(),
            other => {
                return Err(ControllerError::Config(format!(
                    "params must be an object, got {other}"
                )));
            }
        };
        params.insert("token".to_string(), json!(self.token));
        let id = self.next_id;
        self.next_id += 1;
        let request = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        write_frame(&mut self.writer, TransportMode::NewlineJson, &request)?;

        loop {
            let message = self.read_message()?.ok_or_else(|| ControllerError::Rpc {
                code: -32000,
                message: "connection closed".to_string(),
            })?;
            if message.get("id").is_none_or(Value::is_null) && message.get("method").is_some() {
                self.notifications.push_back(message);
                continue;
            }
            if message.get("id").and_then(Value::as_u64) != Some(id) {
                tracing::debug!(%message, "dropping unexpected rpc message");
                continue;
            }
            if let Some(error) = message.get("error") {
                return Err(ControllerError::Rpc {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
            return Ok(message.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    /// Next buffered or incoming notification's params, waiting up to `timeout`.
    pub fn next_notification(&mut self, timeout: Duration) -> Result<Option<Value>, ControllerError> {
        if let Some(note) = self.notifications.pop_front() {
            return Ok(note.get("params").cloned());
        }
        self.writer.set_read_timeout(Some(timeout))?;
        let read = self.read_message();
        self.writer.set_read_timeout(None)?;
        match read {
            Ok(Some(message)) if message.get("method").is_some() => Ok(message.get("params").cloned()),
            Ok(_) => Ok(None),
            Err(ControllerError::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn take_notifications(&mut self) -> Vec<Value> {
        self.notifications
            .drain(..)
            .filter_map(|note| note.get("params").cloned())
            .collect()
    }

    fn read_message(&mut self) -> Result<Option<Value>, ControllerError> {
        let Some(body) = read_frame(&mut self.reader, TransportMode::NewlineJson)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&body)?))
    }
}
