use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::Mutex,
    time::timeout,
};
use tracing::{instrument, trace, warn};

use crate::{
    internals::core::ports::{DeviceLink, LinkError},
    models::device::DeviceHandle,
};

use super::message::{level_command, level_query, parse_level};

/// Two levels closer than this are the same level.
const ECHO_TOLERANCE: f64 = 1e-6;

#[derive(Debug)]
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// One open SSC connection. Each message is a JSON object on its own line and
/// every request gets exactly one response line.
///
/// A timed-out or failed exchange may leave a reply unread on the stream, so
/// the connection is dropped and every later call fails with
/// [`LinkError::Closed`].
#[derive(Debug)]
pub struct SscLink {
    handle: DeviceHandle,
    io_timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

impl SscLink {
    pub fn new(handle: DeviceHandle, stream: TcpStream, io_timeout: Duration) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            handle,
            io_timeout,
            connection: Mutex::new(Some(Connection {
                reader: BufReader::new(reader),
                writer,
            })),
        }
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    /// Send one request line and wait for one response line.
    async fn exchange(&self, request: &str) -> Result<String, LinkError> {
        let mut slot = self.connection.lock().await;
        let Connection { reader, writer } = match slot.as_mut() {
            Some(connection) => connection,
            None => return Err(LinkError::Closed),
        };

        let exchange = async {
            trace!("TX {}: {}", self.handle, request);
            writer.write_all(request.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
            writer.flush().await?;

            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Err(LinkError::Closed);
            }
            let response = line.trim().to_string();
            trace!("RX {}: {}", self.handle, response);
            Ok::<String, LinkError>(response)
        };

        let result = match timeout(self.io_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!("No response from {} within {:?}.", self.handle, self.io_timeout);
                Err(LinkError::Timeout)
            }
        };

        if let Err(LinkError::Timeout | LinkError::Io(_) | LinkError::Closed) = &result {
            warn!("Dropping connection to {}.", self.handle);
            *slot = None;
        }
        result
    }
}

#[async_trait]
impl DeviceLink for SscLink {
    #[instrument(skip_all, fields(device = %self.handle))]
    async fn query(&self) -> Result<f64, LinkError> {
        let response = self.exchange(&level_query()?).await?;
        parse_level(&response)
    }

    /// The device echoes the level it accepted. Any other answer is a nack.
    #[instrument(skip(self), fields(device = %self.handle))]
    async fn apply(&self, value: f64) -> Result<(), LinkError> {
        let response = self.exchange(&level_command(value)?).await?;
        match parse_level(&response) {
            Ok(echoed) if (echoed - value).abs() < ECHO_TOLERANCE => Ok(()),
            _ => Err(LinkError::Rejected(response)),
        }
    }
}
