//! Client transports.
//!
//! A [`Connector`] knows how to fetch the stream description and how to open
//! one connection to the stream. Connections are read with a short timeout
//! so the consumer can notice a stop request while the server is quiet.

use super::ClientConfig;
use crate::channel::Framing;
use crate::error::{Result, StreamError};
use crate::serializers::StreamDescription;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{self, Runtime};
use tokio::time;
use tracing::debug;
use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::HandshakeError;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::{Message, WebSocket};

/// What a read on a stream connection produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming {
    /// Stream bytes (an arbitrary body piece, or one whole WebSocket frame).
    Data(Vec<u8>),
    /// Nothing arrived within the read timeout.
    Idle,
    /// The server ended the connection normally.
    End,
}

/// One open connection to the stream endpoint.
pub trait StreamConnection: Send {
    fn next(&mut self) -> Result<Incoming>;
}

/// Opens stream connections for a [`StreamConsumer`](super::StreamConsumer).
pub trait Connector: Send + Sync {
    /// How items are framed on this transport.
    fn framing(&self) -> Framing;

    fn fetch_description(&self) -> Result<StreamDescription>;

    fn connect(&self) -> Result<Box<dyn StreamConnection>>;
}

/// Fetches the stream description over plain HTTP.
struct DescriptionClient {
    client: reqwest::blocking::Client,
    url: String,
    timeout: Duration,
}

impl DescriptionClient {
    fn fetch(&self) -> Result<StreamDescription> {
        debug!(url = %self.url, "fetching stream description");
        let body = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()?
            .error_for_status()?
            .text()?;
        StreamDescription::from_json(&body)
    }
}

fn http_client(config: &ClientConfig) -> Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .connect_timeout(config.connect_timeout())
        .build()?)
}

// --- Chunked HTTP ---

/// Streams a long-lived chunked GET response.
///
/// The response is read on a small runtime owned by the connector. Waiting
/// for the response head is bounded by the connect timeout, and each read
/// by the read timeout. Dropping a connection drops its response, which
/// closes the socket.
pub struct HttpConnector {
    runtime: Arc<Runtime>,
    client: reqwest::Client,
    description: DescriptionClient,
    stream_url: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl HttpConnector {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        config.validate_endpoints()?;
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("sensorstream-http")
            .enable_all()
            .build()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            runtime: Arc::new(runtime),
            client,
            description: DescriptionClient {
                client: http_client(config)?,
                url: config.description_url.clone(),
                timeout: config.connect_timeout(),
            },
            stream_url: config.stream_url.clone(),
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
        })
    }
}

impl Connector for HttpConnector {
    fn framing(&self) -> Framing {
        Framing::Wrapped
    }

    fn fetch_description(&self) -> Result<StreamDescription> {
        self.description.fetch()
    }

    fn connect(&self) -> Result<Box<dyn StreamConnection>> {
        let send = async {
            time::timeout(self.connect_timeout, self.client.get(&self.stream_url).send()).await
        };
        let response = match self.runtime.block_on(send) {
            Ok(response) => response?,
            Err(_) => {
                return Err(StreamError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no response from stream endpoint",
                )))
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::HttpStatus(status.as_u16()));
        }
        debug!(url = %self.stream_url, "stream connected");

        Ok(Box::new(HttpConnection {
            response,
            runtime: self.runtime.clone(),
            read_timeout: self.read_timeout,
        }))
    }
}

struct HttpConnection {
    response: reqwest::Response,
    runtime: Arc<Runtime>,
    read_timeout: Duration,
}

impl StreamConnection for HttpConnection {
    fn next(&mut self) -> Result<Incoming> {
        let read_timeout = self.read_timeout;
        let response = &mut self.response;
        match self
            .runtime
            .block_on(async { time::timeout(read_timeout, response.chunk()).await })
        {
            Ok(Ok(Some(piece))) => Ok(Incoming::Data(piece.to_vec())),
            Ok(Ok(None)) => Ok(Incoming::End),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(Incoming::Idle),
        }
    }
}

// --- WebSocket ---

/// Streams items sent as one WebSocket frame each.
pub struct WebSocketConnector {
    description: DescriptionClient,
    stream_url: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        config.validate_endpoints()?;
        Ok(Self {
            description: DescriptionClient {
                client: http_client(config)?,
                url: config.description_url.clone(),
                timeout: config.connect_timeout(),
            },
            stream_url: config.stream_url.clone(),
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
        })
    }

    fn open_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(StreamError::Io(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host))
        })))
    }
}

impl Connector for WebSocketConnector {
    fn framing(&self) -> Framing {
        Framing::PerItem
    }

    fn fetch_description(&self) -> Result<StreamDescription> {
        self.description.fetch()
    }

    fn connect(&self) -> Result<Box<dyn StreamConnection>> {
        let request = self.stream_url.as_str().into_client_request()?;
        let host = request
            .uri()
            .host()
            .ok_or_else(|| StreamError::InvalidConfig(format!("no host in {}", self.stream_url)))?
            .to_string();
        let port = request.uri().port_u16().unwrap_or(80);

        let stream = self.open_tcp(&host, port)?;
        stream.set_read_timeout(Some(self.connect_timeout))?;

        let (socket, _response) = tungstenite::client(request, stream).map_err(|e| match e {
            HandshakeError::Failure(e) => StreamError::from(e),
            HandshakeError::Interrupted(_) => StreamError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "websocket handshake timed out",
            )),
        })?;
        socket.get_ref().set_read_timeout(Some(self.read_timeout))?;
        debug!(url = %self.stream_url, "stream connected");

        Ok(Box::new(WebSocketConnection { socket }))
    }
}

struct WebSocketConnection {
    socket: WebSocket<TcpStream>,
}

impl StreamConnection for WebSocketConnection {
    fn next(&mut self) -> Result<Incoming> {
        match self.socket.read() {
            Ok(Message::Binary(data)) => Ok(Incoming::Data(data)),
            Ok(Message::Text(text)) => Ok(Incoming::Data(text.into_bytes())),
            Ok(Message::Close(frame)) => match frame {
                None => Ok(Incoming::End),
                Some(frame) if frame.code == CloseCode::Normal => Ok(Incoming::End),
                Some(frame) => Err(StreamError::WebSocket(format!(
                    "closed by server: {} {}",
                    u16::from(frame.code),
                    frame.reason
                ))),
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                Ok(Incoming::Idle)
            }
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                Ok(Incoming::Idle)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        // Best effort: the peer may already be gone.
        if self.socket.can_write() {
            let _ = self.socket.close(None);
        }
        let _ = self.socket.flush();
    }
}
