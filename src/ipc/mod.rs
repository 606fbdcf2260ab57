//! Length-framed local sockets for the peer process.
//!
//! Three endpoints: audio ingress (PCM frames plus a control sub-channel),
//! STT result egress (newline-delimited JSON), and TTS egress
//! (length-prefixed WAV blobs). Unix domain sockets on POSIX; `host:port`
//! strings select TCP anywhere.
//!
//! Ingress framing: a 4-byte LE `u32` header. The value `0xFFFFFFFF` opens
//! a control message (1 type byte + payload); any other value is a PCM
//! sample count followed by `count * 2` bytes of 16-bit LE mono audio.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{CoreError, Disposition, Result};

/// Length header value that opens a control message.
pub const CONTROL_SENTINEL: u32 = 0xFFFF_FFFF;

/// Upper bound on a single audio frame (30 s at 16 kHz); anything larger
/// is a corrupt stream.
const MAX_SAMPLES_PER_FRAME: u32 = 16_000 * 30;

/// Control message from the peer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Peer-reported silence duration; seeds the silence counter.
    Silence {
        /// Milliseconds of silence the peer observed.
        ms: u64,
    },
    /// End the current session gracefully.
    EndSession,
    /// Clear buffers and reset the state machine.
    ResetToInitial,
    /// Begin a fresh session.
    StartSession,
    /// Hard cancel: clear buffers, invalidate the epoch, drop queued TTS.
    Interrupt,
}

impl ControlMessage {
    /// Wire type byte.
    pub fn type_byte(self) -> u8 {
        match self {
            Self::Silence { .. } => 0x01,
            Self::EndSession => 0x02,
            Self::ResetToInitial => 0x03,
            Self::StartSession => 0x04,
            Self::Interrupt => 0x05,
        }
    }
}

/// One parsed ingress frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressFrame {
    /// Raw 16-bit LE PCM bytes.
    Audio(Vec<u8>),
    /// A control message.
    Control(ControlMessage),
}

/// Read one frame, or `None` on a clean end of stream.
///
/// # Errors
///
/// Returns a framing error on a truncated frame, an unknown control type,
/// or an implausible sample count.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<IngressFrame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CoreError::Framing(format!("failed to read frame header: {e}"))),
    }
    let length = u32::from_le_bytes(header);

    if length == CONTROL_SENTINEL {
        let mut type_byte = [0u8; 1];
        reader
            .read_exact(&mut type_byte)
            .await
            .map_err(|e| CoreError::Framing(format!("failed to read control type: {e}")))?;
        let message = match type_byte[0] {
            0x01 => {
                let mut payload = [0u8; 8];
                reader
                    .read_exact(&mut payload)
                    .await
                    .map_err(|e| CoreError::Framing(format!("failed to read silence payload: {e}")))?;
                ControlMessage::Silence {
                    ms: u64::from_le_bytes(payload),
                }
            }
            0x02 => ControlMessage::EndSession,
            0x03 => ControlMessage::ResetToInitial,
            0x04 => ControlMessage::StartSession,
            0x05 => ControlMessage::Interrupt,
            other => {
                return Err(CoreError::Framing(format!("unknown control type 0x{other:02x}")));
            }
        };
        return Ok(Some(IngressFrame::Control(message)));
    }

    if length > MAX_SAMPLES_PER_FRAME {
        return Err(CoreError::Framing(format!(
            "implausible audio frame of {length} samples"
        )));
    }
    let mut pcm = vec![0u8; length as usize * 2];
    reader
        .read_exact(&mut pcm)
        .await
        .map_err(|e| CoreError::Framing(format!("truncated audio frame: {e}")))?;
    Ok(Some(IngressFrame::Audio(pcm)))
}

/// Encode a frame as the peer would send it (tests and loopback tools).
pub fn encode_frame(frame: &IngressFrame) -> Vec<u8> {
    match frame {
        IngressFrame::Audio(pcm) => {
            let samples = (pcm.len() / 2) as u32;
            let mut out = samples.to_le_bytes().to_vec();
            out.extend_from_slice(&pcm[..samples as usize * 2]);
            out
        }
        IngressFrame::Control(message) => {
            let mut out = CONTROL_SENTINEL.to_le_bytes().to_vec();
            out.push(message.type_byte());
            if let ControlMessage::Silence { ms } = message {
                out.extend_from_slice(&ms.to_le_bytes());
            }
            out
        }
    }
}

/// A socket endpoint: `host:port` selects TCP, anything else is a Unix
/// socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket path.
    #[cfg(unix)]
    Unix(PathBuf),
    /// TCP address.
    Tcp(String),
}

impl Endpoint {
    /// Parse an endpoint string.
    pub fn parse(raw: &str) -> Self {
        #[cfg(unix)]
        {
            if !raw.starts_with('/') && raw.contains(':') {
                return Self::Tcp(raw.to_owned());
            }
            Self::Unix(PathBuf::from(raw))
        }
        #[cfg(not(unix))]
        {
            Self::Tcp(raw.to_owned())
        }
    }
}

/// Bound listener over either transport.
pub enum IpcListener {
    /// Unix domain socket listener.
    #[cfg(unix)]
    Unix(UnixListener),
    /// TCP listener.
    Tcp(TcpListener),
}

/// Boxed connection halves; ingress uses the read half, egress the write
/// half.
pub type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of an accepted connection.
pub type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

impl IpcListener {
    /// Bind the endpoint, removing a stale Unix socket file first.
    ///
    /// # Errors
    ///
    /// Returns a fatal IPC error if the address cannot be bound.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path)
                    .map_err(|e| CoreError::Ipc(format!("bind {}: {e}", path.display())))?;
                info!(path = %path.display(), "unix socket bound");
                Ok(Self::Unix(listener))
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| CoreError::Ipc(format!("bind {addr}: {e}")))?;
                info!(addr = %addr, "tcp socket bound");
                Ok(Self::Tcp(listener))
            }
        }
    }

    /// Accept one connection, returning boxed halves.
    ///
    /// # Errors
    ///
    /// Returns a transient I/O error if the accept fails; the listener
    /// itself stays usable.
    pub async fn accept(&self) -> Result<(ReadHalf, WriteHalf)> {
        match self {
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await.map_err(CoreError::Io)?;
                let (read, write) = tokio::io::split(stream);
                Ok((Box::new(read), Box::new(write)))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await.map_err(CoreError::Io)?;
                let (read, write) = tokio::io::split(stream);
                Ok((Box::new(read), Box::new(write)))
            }
        }
    }
}

/// Single-client egress socket.
///
/// Holds at most one peer; a new connection replaces the old one. Writes
/// go through an async mutex (one writer at a time) and fail fast when the
/// peer is gone — the socket then waits for the next connection.
pub struct EgressSocket {
    name: &'static str,
    writer: tokio::sync::Mutex<Option<WriteHalf>>,
}

impl EgressSocket {
    /// Create an egress socket with a name used in logs.
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            writer: tokio::sync::Mutex::new(None),
        })
    }

    /// Accept-loop: park accepted peers as the current writer until
    /// cancelled.
    pub async fn serve(self: Arc<Self>, listener: IpcListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((_read, write)) => {
                        info!(socket = self.name, "egress client connected");
                        *self.writer.lock().await = Some(write);
                    }
                    Err(e) => {
                        warn!(socket = self.name, error = %e, "egress accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    }
                },
            }
        }
    }

    /// Whether a peer is currently connected.
    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Send a length-prefixed blob. Returns `false` (and drops the peer)
    /// when no client is connected or the write fails.
    pub async fn send_framed(&self, payload: &[u8]) -> bool {
        let mut prefixed = (payload.len() as u32).to_le_bytes().to_vec();
        prefixed.extend_from_slice(payload);
        self.send_raw(&prefixed).await
    }

    /// Send a newline-terminated line (ndjson egress).
    pub async fn send_line(&self, payload: &[u8]) -> bool {
        let mut line = payload.to_vec();
        line.push(b'\n');
        self.send_raw(&line).await
    }

    async fn send_raw(&self, bytes: &[u8]) -> bool {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };
        match writer.write_all(bytes).await {
            Ok(()) => match writer.flush().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(socket = self.name, error = %e, "egress flush failed; dropping peer");
                    *guard = None;
                    false
                }
            },
            Err(e) => {
                warn!(socket = self.name, error = %e, "egress write failed; dropping peer");
                *guard = None;
                false
            }
        }
    }
}

/// Ingress accept-loop: parse frames from every audio-socket connection
/// and forward them in arrival order.
pub async fn run_ingress(
    listener: IpcListener,
    tx: mpsc::Sender<IngressFrame>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (mut read, _write) = match accepted {
            Ok(halves) => halves,
            Err(e) => {
                warn!(error = %e, "audio ingress accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                continue;
            }
        };
        info!("audio ingress client connected");
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = cancel.cancelled() => break,
                    frame = read_frame(&mut read) => frame,
                };
                match frame {
                    Ok(Some(frame)) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("audio ingress client disconnected");
                        break;
                    }
                    Err(e) => match e.disposition() {
                        // A corrupt stream costs only this connection; the
                        // accept loop keeps taking new clients.
                        Disposition::Logic | Disposition::Transient => {
                            warn!(error = %e, "audio ingress framing error; dropping connection");
                            break;
                        }
                        Disposition::Vendor | Disposition::Fatal => {
                            error!(error = %e, "unrecoverable ingress error; dropping connection");
                            break;
                        }
                    },
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(frame: IngressFrame) -> IngressFrame {
        let encoded = encode_frame(&frame);
        let mut reader = encoded.as_slice();
        read_frame(&mut reader)
            .await
            .expect("frame")
            .expect("not eof")
    }

    // ── Framing ───────────────────────────────────────────────

    #[tokio::test]
    async fn audio_frame_round_trip() {
        let pcm: Vec<u8> = (0..640u16).flat_map(|v| v.to_le_bytes()).collect();
        let frame = round_trip(IngressFrame::Audio(pcm.clone())).await;
        assert_eq!(frame, IngressFrame::Audio(pcm));
    }

    #[tokio::test]
    async fn control_frames_round_trip() {
        for message in [
            ControlMessage::Silence { ms: 1234 },
            ControlMessage::EndSession,
            ControlMessage::ResetToInitial,
            ControlMessage::StartSession,
            ControlMessage::Interrupt,
        ] {
            let frame = round_trip(IngressFrame::Control(message)).await;
            assert_eq!(frame, IngressFrame::Control(message));
        }
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let mut reader: &[u8] = &[];
        assert!(read_frame(&mut reader).await.expect("ok").is_none());
    }

    #[tokio::test]
    async fn truncated_audio_is_a_framing_error() {
        let mut encoded = encode_frame(&IngressFrame::Audio(vec![0u8; 64]));
        encoded.truncate(encoded.len() - 10);
        let mut reader = encoded.as_slice();
        let err = read_frame(&mut reader).await.expect_err("truncated");
        assert!(matches!(err, CoreError::Framing(_)));
        assert_eq!(err.disposition(), Disposition::Logic);
    }

    #[tokio::test]
    async fn unknown_control_type_is_a_framing_error() {
        let mut encoded = CONTROL_SENTINEL.to_le_bytes().to_vec();
        encoded.push(0x7f);
        let mut reader = encoded.as_slice();
        let err = read_frame(&mut reader).await.expect_err("unknown type");
        assert!(matches!(err, CoreError::Framing(_)));
    }

    #[tokio::test]
    async fn oversized_sample_count_is_a_framing_error() {
        let encoded = (MAX_SAMPLES_PER_FRAME + 1).to_le_bytes().to_vec();
        let mut reader = encoded.as_slice();
        let err = read_frame(&mut reader).await.expect_err("oversized");
        assert!(matches!(err, CoreError::Framing(_)));
    }

    #[tokio::test]
    async fn sequential_frames_parse_in_order() {
        let mut bytes = encode_frame(&IngressFrame::Audio(vec![1, 2, 3, 4]));
        bytes.extend(encode_frame(&IngressFrame::Control(ControlMessage::Interrupt)));
        let mut reader = bytes.as_slice();
        assert!(matches!(
            read_frame(&mut reader).await.expect("ok"),
            Some(IngressFrame::Audio(_))
        ));
        assert_eq!(
            read_frame(&mut reader).await.expect("ok"),
            Some(IngressFrame::Control(ControlMessage::Interrupt))
        );
        assert!(read_frame(&mut reader).await.expect("ok").is_none());
    }

    // ── Endpoint parsing ──────────────────────────────────────

    #[test]
    fn endpoint_parsing() {
        #[cfg(unix)]
        {
            assert_eq!(
                Endpoint::parse("/tmp/lumina_tts.sock"),
                Endpoint::Unix(PathBuf::from("/tmp/lumina_tts.sock"))
            );
        }
        assert_eq!(
            Endpoint::parse("127.0.0.1:8767"),
            Endpoint::Tcp("127.0.0.1:8767".to_owned())
        );
    }

    // ── Egress socket ─────────────────────────────────────────

    #[cfg(unix)]
    #[tokio::test]
    async fn egress_frames_to_connected_client() {
        use tokio::io::AsyncReadExt as _;
        use tokio::net::UnixStream;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("egress.sock");
        let endpoint = Endpoint::Unix(path.clone());
        let listener = IpcListener::bind(&endpoint).await.expect("bind");
        let socket = EgressSocket::new("test");
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&socket).serve(listener, cancel.clone()));

        let mut client = UnixStream::connect(&path).await.expect("connect");
        // Wait until the serve loop has parked the writer.
        for _ in 0..100 {
            if socket.is_connected().await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(socket.send_framed(b"wav-bytes").await);

        let mut header = [0u8; 4];
        client.read_exact(&mut header).await.expect("header");
        assert_eq!(u32::from_le_bytes(header), 9);
        let mut payload = vec![0u8; 9];
        client.read_exact(&mut payload).await.expect("payload");
        assert_eq!(&payload, b"wav-bytes");
        cancel.cancel();
    }

    #[tokio::test]
    async fn egress_without_client_fails_fast() {
        let socket = EgressSocket::new("lonely");
        assert!(!socket.send_framed(b"x").await);
        assert!(!socket.send_line(b"y").await);
    }
}
