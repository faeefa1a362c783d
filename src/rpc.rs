//! Request/response RPC between the plugin and the daemon.
//!
//! Each message is one JSON object on its own line. A request names a method
//! and carries its parameters; the matching response echoes the request id
//! and holds either a result or an error string.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const METHOD_ALLOCATE: &str = "Ipam.Allocate";
pub const METHOD_RELEASE: &str = "Ipam.Release";

/// RPC errors, client or server side
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Failed to connect to '{path}': {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Socket I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed RPC message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Connection closed before a reply was received")]
    Closed,

    #[error("Reply id {got} does not match request id {expected}")]
    MismatchedId { expected: u64, got: u64 },

    /// The daemon handled the call and reported a failure
    #[error("{0}")]
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Write one message followed by a newline
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), RpcError> {
    serde_json::to_writer(&mut *writer, message)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Read the next message, skipping blank lines. `None` means end of stream.
pub fn read_frame<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, RpcError> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    Ok(Some(serde_json::from_str(line.trim())?))
}

/// Blocking client for the daemon socket
pub struct RpcClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
    next_id: u64,
}

impl RpcClient {
    /// Connect to `path`; every subsequent read and write is bounded by `timeout`
    pub fn dial(path: &Path, timeout: Duration) -> Result<Self, RpcError> {
        let stream = UnixStream::connect(path).map_err(|source| RpcError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_stream(stream, timeout)
    }

    pub fn from_stream(stream: UnixStream, timeout: Duration) -> Result<Self, RpcError> {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            writer: stream,
            reader,
            next_id: 1,
        })
    }

    /// Issue one call and wait for its reply
    pub fn call<P: Serialize, R: DeserializeOwned>(
        &mut self,
        method: &str,
        params: &P,
    ) -> Result<R, RpcError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Request {
            id,
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        };
        write_frame(&mut self.writer, &request)?;

        let response: Response = read_frame(&mut self.reader)?.ok_or(RpcError::Closed)?;
        if response.id != id {
            return Err(RpcError::MismatchedId {
                expected: id,
                got: response.id,
            });
        }
        if let Some(error) = response.error {
            return Err(RpcError::Remote(error));
        }
        Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
    }
}
