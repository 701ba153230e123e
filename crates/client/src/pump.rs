//! Full-duplex relay between a logical stream and the local terminal.
//!
//! Two directions run concurrently:
//!
//! - **inbound** (spawned task): stream → decode → local output, re-checking
//!   the stream's closed state before every read.
//! - **outbound** (the caller's task): one line of local input → append
//!   `\n` → encode → stream.
//!
//! Each direction stops on its own errors without touching the other. The
//! stream closing is the one signal both observe: the outbound loop races
//! every input read and stream write against it, so a remote close also
//! ends a loop that is blocked waiting for the user to type. At end of
//! input the loop waits until the peer consumed what was sent, then the
//! relay keeps showing remote output until the stream closes.

use protocol::{LogicalStream, ProtocolError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use crate::encoding::TextEncoding;
use crate::error::RelayError;

/// Why the outbound direction stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundEnd {
    /// Local input reached end of file.
    EndOfInput,
    /// The stream closed.
    RemoteClosed,
}

/// Result of one relay run, once both directions stopped.
#[derive(Debug)]
pub struct RelayOutcome {
    /// How the outbound direction ended.
    pub outbound: Result<OutboundEnd, RelayError>,
    /// How the inbound direction ended.
    pub inbound: Result<(), RelayError>,
}

impl RelayOutcome {
    /// Whether the outbound direction ended without an error.
    pub fn is_clean(&self) -> bool {
        self.outbound.is_ok()
    }
}

/// Relays one stream to local I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamPump {
    encoding: TextEncoding,
}

impl StreamPump {
    /// Creates a pump using `encoding` in both directions.
    pub fn new(encoding: TextEncoding) -> Self {
        Self { encoding }
    }

    /// Runs the relay until both directions have stopped.
    ///
    /// The inbound direction only stops on an error or once the stream is
    /// closed, so after local input ends this keeps waiting for the peer.
    pub async fn run<I, O>(&self, stream: &LogicalStream, input: I, output: O) -> RelayOutcome
    where
        I: AsyncBufRead + Unpin,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let inbound = tokio::spawn(inbound_loop(stream.clone(), output, self.encoding));

        let outbound = outbound_loop(stream, input, self.encoding).await;
        match &outbound {
            Ok(end) => debug!(?end, "Outbound relay finished"),
            Err(e) => error!("Outbound relay failed: {}", e),
        }

        let inbound = inbound.await.unwrap_or_else(|e| {
            error!("Inbound relay task failed: {}", e);
            Err(RelayError::Task(e))
        });

        RelayOutcome { outbound, inbound }
    }
}

async fn inbound_loop<O>(
    stream: LogicalStream,
    mut output: O,
    encoding: TextEncoding,
) -> Result<(), RelayError>
where
    O: AsyncWrite + Unpin,
{
    let result = async {
        while !stream.is_closed() {
            let chunk = match stream.read().await {
                Ok(chunk) => chunk,
                // Closed while we were waiting.
                Err(ProtocolError::StreamClosed) => break,
                Err(e) => return Err(RelayError::Read(e)),
            };
            let text = encoding.decode(&chunk)?;
            output
                .write_all(text.as_bytes())
                .await
                .map_err(RelayError::Output)?;
            output.flush().await.map_err(RelayError::Output)?;
        }
        Ok(())
    }
    .await;

    match &result {
        Ok(()) => debug!("Remote stream closed"),
        Err(e) => error!("Inbound relay failed: {}", e),
    }
    result
}

async fn outbound_loop<I>(
    stream: &LogicalStream,
    input: I,
    encoding: TextEncoding,
) -> Result<OutboundEnd, RelayError>
where
    I: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        // Input first: a line that is already buffered is still attempted,
        // and end of input wins over a close that raced it.
        let line = tokio::select! {
            biased;
            line = lines.next_line() => line.map_err(RelayError::Input)?,
            _ = stream.closed() => return Ok(OutboundEnd::RemoteClosed),
        };
        let Some(mut line) = line else {
            // Let the peer consume what was already sent.
            match stream.flush().await {
                Ok(()) | Err(ProtocolError::StreamClosed) => {}
                Err(e) => return Err(RelayError::Write(e)),
            }
            return Ok(OutboundEnd::EndOfInput);
        };

        line.push('\n');
        let bytes = encoding.encode(&line)?;

        match stream.write(&bytes).await {
            Ok(()) => {}
            Err(ProtocolError::StreamClosed) => return Ok(OutboundEnd::RemoteClosed),
            Err(e) => return Err(RelayError::Write(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{KeyPair, ProtocolConfig, Session, SessionProtocol};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, BufReader};

    /// A client stream and the device's end of it, over an in-memory pipe.
    async fn stream_pair() -> (LogicalStream, LogicalStream, Session, Session) {
        let (client_io, device_io) = duplex(64 * 1024);
        let device = tokio::spawn(async move {
            SessionProtocol::new(ProtocolConfig::device("device::"))
                .accept(device_io, &KeyPair::generate(), |_| true)
                .await
                .unwrap()
        });
        let client = SessionProtocol::default()
            .authenticate(client_io, &KeyPair::generate())
            .await
            .unwrap();
        let device = device.await.unwrap();

        let stream = client.open_stream("shell:").await.unwrap();
        let remote = device.accept_stream().await.unwrap();
        (stream, remote, client, device)
    }

    #[tokio::test]
    async fn test_lines_are_sent_with_terminator() {
        let (stream, remote, _client, _device) = stream_pair().await;
        let input = BufReader::new(&b"echo hi\nexit\n"[..]);
        let (output, _terminal) = duplex(1024);

        // Reading acknowledges each write, which lets the next one through.
        let device = tokio::spawn(async move {
            let mut received = Vec::new();
            while received.len() < b"echo hi\nexit\n".len() {
                received.extend(remote.read().await.unwrap());
            }
            remote.close().await;
            received
        });

        let outcome = StreamPump::new(TextEncoding::Ascii)
            .run(&stream, input, output)
            .await;
        assert!(matches!(outcome.outbound, Ok(OutboundEnd::EndOfInput)));
        assert!(matches!(outcome.inbound, Ok(())));
        assert_eq!(device.await.unwrap(), b"echo hi\nexit\n");
    }

    #[tokio::test]
    async fn test_output_after_end_of_input_is_shown() {
        let (stream, remote, _client, _device) = stream_pair().await;
        let input = BufReader::new(&b"ls\n"[..]);
        let (output, mut terminal) = duplex(1024);

        let device = tokio::spawn(async move {
            assert_eq!(remote.read().await.unwrap(), b"ls\n");
            // Local input has ended by the time the command answers.
            tokio::time::sleep(Duration::from_millis(50)).await;
            remote.write(b"sdcard\n").await.unwrap();
            remote.flush().await.unwrap();
            remote.close().await;
        });

        let outcome = StreamPump::default().run(&stream, input, output).await;
        device.await.unwrap();

        assert!(matches!(outcome.outbound, Ok(OutboundEnd::EndOfInput)));
        assert!(matches!(outcome.inbound, Ok(())));
        let mut shown = String::new();
        terminal.read_to_string(&mut shown).await.unwrap();
        assert_eq!(shown, "sdcard\n");
    }

    #[tokio::test]
    async fn test_remote_close_ends_blocked_outbound() {
        let (stream, remote, _client, _device) = stream_pair().await;
        // Input that never produces a line.
        let (_typing, input) = duplex(64);
        let (output, mut terminal) = duplex(1024);

        let device = tokio::spawn(async move {
            remote.write(b"bye\n").await.unwrap();
            remote.flush().await.unwrap();
            remote.close().await;
        });

        let outcome = StreamPump::new(TextEncoding::Ascii)
            .run(&stream, BufReader::new(input), output)
            .await;
        device.await.unwrap();

        assert!(matches!(outcome.outbound, Ok(OutboundEnd::RemoteClosed)));
        assert!(matches!(outcome.inbound, Ok(())));

        let mut shown = vec![0u8; 4];
        terminal.read_exact(&mut shown).await.unwrap();
        assert_eq!(shown, b"bye\n");
    }

    #[tokio::test]
    async fn test_closed_stream_is_not_read() {
        let (stream, remote, _client, _device) = stream_pair().await;
        stream.close().await;
        remote.closed().await;

        let (_typing, input) = duplex(64);
        let (output, _terminal) = duplex(64);
        let outcome = StreamPump::default()
            .run(&stream, BufReader::new(input), output)
            .await;

        assert!(matches!(outcome.inbound, Ok(())));
        assert!(matches!(outcome.outbound, Ok(OutboundEnd::RemoteClosed)));
    }

    #[tokio::test]
    async fn test_undecodable_byte_ends_inbound_only() {
        let (stream, remote, _client, _device) = stream_pair().await;
        let (mut typing, input) = duplex(64);
        let (output, _terminal) = duplex(1024);

        let pump = tokio::spawn({
            let stream = stream.clone();
            async move {
                StreamPump::new(TextEncoding::Ascii)
                    .run(&stream, BufReader::new(input), output)
                    .await
            }
        });

        remote.write(b"caf\xe9\n").await.unwrap();
        remote.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The outbound direction still relays after the inbound one failed.
        typing.write_all(b"pwd\n").await.unwrap();
        assert_eq!(remote.read().await.unwrap(), b"pwd\n");
        assert!(!stream.is_closed());
        assert!(!pump.is_finished());

        remote.close().await;
        let outcome = pump.await.unwrap();
        assert!(matches!(
            outcome.inbound,
            Err(RelayError::Decode { byte: 0xe9, offset: 3 })
        ));
        assert!(matches!(outcome.outbound, Ok(OutboundEnd::RemoteClosed)));
    }

    #[tokio::test]
    async fn test_unencodable_input_is_outbound_error() {
        let (stream, _remote, _client, _device) = stream_pair().await;
        let input = BufReader::new("naïve\n".as_bytes());

        let outbound = outbound_loop(&stream, input, TextEncoding::Ascii).await;
        assert!(matches!(outbound, Err(RelayError::Encode { ch: 'ï' })));
        assert!(!stream.is_closed());
    }
}
