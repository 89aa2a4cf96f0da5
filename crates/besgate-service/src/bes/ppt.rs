//! A client for the PPT ("point to point transport") exchange the BES
//! listens on.
//!
//! One transaction is one short-lived connection: a plain-text handshake,
//! the request document sent as a chunked message, and the response read
//! back the same way. Chunks carry an 8 byte header, 7 hex digits of payload
//! length followed by a kind octet (`d` for data, `x` for extension). A
//! zero-length data chunk terminates a message. An extension chunk carrying
//! `status=error` marks the rest of the message as a `<BESError>` document.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::config::BesConfig;

use super::{BesClient, BesCommand, BesError, BesPayload};

const HANDSHAKE_CLIENT: &[u8] = b"PPTCLIENT_TESTING_CONNECTION";
const HANDSHAKE_OK: &str = "PPTSERVER_CONNECTION_OK";
const HANDSHAKE_REFUSED: &str = "PPT_PROTOCOL_UNDEFINED";

const HEADER_SIZE: usize = 8;
const CHUNK_KIND_DATA: u8 = b'd';
const CHUNK_KIND_EXTENSION: u8 = b'x';
/// Payload bytes per data chunk when sending.
const SEND_CHUNK_SIZE: usize = 65535;

const ERROR_STATUS_EXTENSION: &str = "status=error";

fn encode_chunk_header(len: usize, kind: u8) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    let hex = format!("{len:07x}");
    header[..7].copy_from_slice(hex.as_bytes());
    header[7] = kind;
    header
}

fn parse_chunk_header(header: &[u8; HEADER_SIZE]) -> Result<(usize, u8), BesError> {
    let size_field = std::str::from_utf8(&header[..7])
        .map_err(|_| BesError::Protocol("chunk header is not valid UTF-8".to_owned()))?;
    let len = usize::from_str_radix(size_field, 16).map_err(|_| {
        BesError::Protocol(format!("invalid chunk size field: {size_field:?}"))
    })?;
    match header[7] {
        kind @ (CHUNK_KIND_DATA | CHUNK_KIND_EXTENSION) => Ok((len, kind)),
        other => Err(BesError::Protocol(format!(
            "unknown chunk kind: 0x{other:02x}"
        ))),
    }
}

async fn write_chunked<S>(stream: &mut S, data: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    for chunk in data.chunks(SEND_CHUNK_SIZE) {
        stream.write_all(&encode_chunk_header(chunk.len(), CHUNK_KIND_DATA)).await?;
        stream.write_all(chunk).await?;
    }
    // Zero-length data chunk closes the message.
    stream.write_all(&encode_chunk_header(0, CHUNK_KIND_DATA)).await?;
    stream.flush().await
}

/// Performs one request/response exchange over an established stream.
///
/// Split from the TCP plumbing so tests can drive it over an in-memory
/// duplex pipe.
pub(crate) async fn exchange<S>(stream: &mut S, request_doc: &str) -> Result<BesPayload, BesError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let io_err = |e: std::io::Error| BesError::Connection(e.to_string());

    stream.write_all(HANDSHAKE_CLIENT).await.map_err(io_err)?;
    stream.flush().await.map_err(io_err)?;

    let mut status = [0u8; 64];
    let read = stream.read(&mut status).await.map_err(io_err)?;
    if read == 0 {
        return Err(BesError::Connection(
            "BES closed the connection during the handshake".to_owned(),
        ));
    }
    let status = String::from_utf8_lossy(&status[..read]);
    let status = status.trim_end_matches(['\r', '\n', '\0']);
    if status == HANDSHAKE_REFUSED {
        return Err(BesError::Connection(
            "BES refused the connection (server busy or down)".to_owned(),
        ));
    }
    if status != HANDSHAKE_OK {
        return Err(BesError::Protocol(format!(
            "unexpected handshake status: {status:?}"
        )));
    }

    write_chunked(stream, request_doc.as_bytes())
        .await
        .map_err(io_err)?;

    let mut payload = Vec::new();
    let mut error_doc = Vec::new();
    let mut in_error = false;
    loop {
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).await.map_err(io_err)?;
        let (len, kind) = parse_chunk_header(&header)?;

        if kind == CHUNK_KIND_DATA && len == 0 {
            break;
        }

        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.map_err(io_err)?;

        if kind == CHUNK_KIND_EXTENSION {
            let extension = String::from_utf8_lossy(&body);
            if extension.contains(ERROR_STATUS_EXTENSION) {
                in_error = true;
            }
            continue;
        }

        if in_error {
            error_doc.extend_from_slice(&body);
        } else {
            payload.extend_from_slice(&body);
        }
    }

    if in_error {
        let doc = String::from_utf8_lossy(&error_doc);
        return Err(BesError::from_error_document(&doc));
    }

    String::from_utf8(payload)
        .map(BesPayload)
        .map_err(|_| BesError::Protocol("BES response is not valid UTF-8".to_owned()))
}

/// The TCP client used to run transactions against a live BES.
#[derive(Clone, Debug)]
pub struct PptClient {
    host: String,
    port: u16,
    default_timeout: Duration,
    max_response_size: u64,
}

impl PptClient {
    /// Creates a client from the `bes` config section.
    pub fn new(config: &BesConfig) -> Self {
        PptClient {
            host: config.host.clone(),
            port: config.port,
            default_timeout: config.timeout,
            max_response_size: config.max_response_size,
        }
    }
}

#[async_trait]
impl BesClient for PptClient {
    async fn transaction(&self, command: &BesCommand) -> Result<BesPayload, BesError> {
        let budget = command.timeout.unwrap_or(self.default_timeout);
        let req_id = Uuid::new_v4().to_string();
        let doc = command.render_with_limit(&req_id, Some(self.max_response_size));

        let run = async {
            let mut stream = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(|e| {
                    BesError::Connection(format!("{}:{}: {e}", self.host, self.port))
                })?;
            let result = exchange(&mut stream, &doc).await;
            // Best effort; the BES drops the session either way.
            let _ = stream.shutdown().await;
            result
        };

        match tokio::time::timeout(budget, run).await {
            Ok(result) => {
                if let Err(ref err) = result {
                    tracing::debug!(
                        resource = %command.resource,
                        error = %err,
                        "BES transaction failed"
                    );
                }
                result
            }
            Err(_elapsed) => Err(BesError::Timeout(format!(
                "transaction for {} exceeded its {budget:?} budget",
                command.resource
            ))),
        }
    }
}
