//! CLI side of the control channel.

use super::{Request, Response, read_message, write_message};
use crate::error::ClientError;
use std::path::PathBuf;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

pub struct Client {
    path: PathBuf,
}

impl Client {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Send one request and wait for the daemon's answer.
    ///
    /// `stop` requests only return once the tasks are gone, so this can
    /// block for as long as the slowest task takes to exit.
    pub async fn send(&self, request: &Request) -> Result<Response, ClientError> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|source| ClientError::Unreachable {
                path: self.path.clone(),
                source,
            })?;

        let (read, mut write) = stream.into_split();
        write_message(&mut write, request).await?;
        write.shutdown().await.map_err(crate::error::ProtocolError::from)?;

        let mut reader = BufReader::new(read);
        Ok(read_message(&mut reader).await?)
    }
}
