//! Control channel between CLI invocations and the daemon.
//!
//! One connection carries exactly one exchange: the client writes a
//! [`Request`] as a single JSON line, the daemon answers with one
//! [`Response`] line and closes the connection. A request that cannot be
//! decoded gets no response.

mod client;
mod server;

pub use client::Client;
pub use server::{ControlServer, dispatch};

use crate::error::ProtocolError;
use crate::spec::TaskSpec;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for one encoded message, newline included.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Lines returned by `log` when the request gives no count (or zero).
pub const DEFAULT_LOG_LINES: usize = 200;

/// Commands a CLI invocation can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    /// Start the given tasks. Answered before the tasks have started.
    Start { tasks: Vec<TaskSpec> },
    /// Stop the named tasks, or all tasks when `names` is empty. Answered
    /// after the tasks have been torn down.
    Stop {
        #[serde(default)]
        names: Vec<String>,
    },
    List,
    Log {
        name: String,
        #[serde(default)]
        count: Option<usize>,
    },
}

/// The daemon's answer. Fields a command does not use stay empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Running task names (`list`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<String>,
    /// Log lines, most recent last (`log`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lines: Vec<String>,
}

/// Read one newline-terminated JSON message.
pub async fn read_message<T, R>(reader: &mut R) -> Result<T, ProtocolError>
where
    T: DeserializeOwned,
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = MAX_MESSAGE_SIZE as u64 + 1;
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;

    if n == 0 {
        return Err(ProtocolError::Truncated);
    }
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge {
            limit: MAX_MESSAGE_SIZE,
        });
    }

    Ok(serde_json::from_slice(&buf)?)
}

/// Write one message as a JSON line and flush.
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut payload = serde_json::to_vec(message)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn requests_are_tagged_by_command() {
        let json = serde_json::to_value(Request::Log {
            name: "web".into(),
            count: Some(20),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"command": "log", "name": "web", "count": 20})
        );

        let stop: Request = serde_json::from_str(r#"{"command":"stop"}"#).unwrap();
        assert_eq!(stop, Request::Stop { names: vec![] });

        let list: Request = serde_json::from_str(r#"{"command":"list"}"#).unwrap();
        assert_eq!(list, Request::List);
    }

    #[test]
    fn unknown_commands_do_not_decode() {
        assert!(serde_json::from_str::<Request>(r#"{"command":"restart"}"#).is_err());
    }

    #[test]
    fn empty_response_serializes_to_empty_object() {
        assert_eq!(serde_json::to_string(&Response::default()).unwrap(), "{}");
    }

    #[tokio::test]
    async fn reads_one_message_per_line() {
        let mut payload = Vec::new();
        write_message(&mut payload, &Request::List).await.unwrap();
        write_message(
            &mut payload,
            &Request::Stop {
                names: vec!["web".into()],
            },
        )
        .await
        .unwrap();

        let mut reader = BufReader::new(payload.as_slice());
        let first: Request = read_message(&mut reader).await.unwrap();
        let second: Request = read_message(&mut reader).await.unwrap();
        assert_eq!(first, Request::List);
        assert_eq!(
            second,
            Request::Stop {
                names: vec!["web".into()]
            }
        );
        assert!(matches!(
            read_message::<Request, _>(&mut reader).await,
            Err(ProtocolError::Truncated)
        ));
    }

    #[tokio::test]
    async fn rejects_malformed_and_oversized_messages() {
        let mut reader = BufReader::new(&b"{not json}\n"[..]);
        assert!(matches!(
            read_message::<Request, _>(&mut reader).await,
            Err(ProtocolError::Json(_))
        ));

        let oversized = vec![b' '; MAX_MESSAGE_SIZE + 10];
        let mut reader = BufReader::new(oversized.as_slice());
        assert!(matches!(
            read_message::<Request, _>(&mut reader).await,
            Err(ProtocolError::TooLarge { .. })
        ));
    }
}
