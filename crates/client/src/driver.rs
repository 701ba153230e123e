//! Top-level sequencing: identity, connect, open, relay.

use std::sync::Arc;

use protocol::{ProtocolConfig, SessionProtocol};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tracing::info;

use crate::config::Config;
use crate::error::ClientError;
use crate::identity::IdentityStore;
use crate::orchestrator::SessionOrchestrator;
use crate::pump::{RelayOutcome, StreamPump};

/// Runs the client against the process's stdin and stdout.
pub async fn run(config: &Config) -> Result<RelayOutcome, ClientError> {
    let input = BufReader::new(tokio::io::stdin());
    run_with_io(config, input, tokio::io::stdout()).await
}

/// Runs the client with the given local input and output.
///
/// Setup errors are returned before any relaying starts. The relay runs
/// until both directions stopped, then the session is closed.
pub async fn run_with_io<I, O>(
    config: &Config,
    input: I,
    output: O,
) -> Result<RelayOutcome, ClientError>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin + Send + 'static,
{
    config.validate()?;

    let provider = Arc::new(SessionProtocol::new(ProtocolConfig::default()));
    let identity = IdentityStore::new(Arc::clone(&provider));
    let orchestrator = SessionOrchestrator::new(Arc::clone(&provider))
        .with_connect_timeout(config.connect_timeout());

    let key_pair = identity.load(
        &config.identity.public_key_path,
        &config.identity.private_key_path,
    )?;
    let session = orchestrator
        .connect(&config.remote.host, config.remote.port, &key_pair)
        .await?;
    let stream = match orchestrator
        .open_stream(&session, &config.relay.service)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            session.close().await;
            return Err(e.into());
        }
    };
    info!("Opened {}", config.relay.service);

    let outcome = StreamPump::new(config.relay.encoding)
        .run(&stream, input, output)
        .await;

    stream.close().await;
    session.close().await;
    Ok(outcome)
}

/// Process exit code for a finished relay.
pub fn exit_code(outcome: &RelayOutcome) -> i32 {
    if outcome.is_clean() {
        0
    } else {
        1
    }
}
