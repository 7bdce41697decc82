//! Per-connection dispatch: reads the `INIT` handshake, stands up a
//! sandbox session, and restarts it on the same TCP connection whenever the
//! sandbox dies without the client disconnecting — mirroring the
//! original's `while True: comm = Comm(...); await comm.run()` loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

use shellbridge_core::config::BridgeConfig;
use shellbridge_protocol::wire::ClientMessage;
use shellbridge_terminal::error::SessionError;
use shellbridge_terminal::session::Session;
use shellbridge_terminal::SessionId;

pub async fn handle_connection(socket: TcpStream, config: Arc<BridgeConfig>) -> anyhow::Result<()> {
    let (read_half, write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let outbound = shellbridge_terminal::outbound::Outbound::new(
        write_half,
        Duration::from_millis(config.timing.rate_limit_ms),
    );

    loop {
        let init_line = match tokio::time::timeout(
            Duration::from_millis(config.timing.init_timeout_ms),
            lines.next_line(),
        )
        .await
        {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return Ok(()), // client closed
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => anyhow::bail!("timed out waiting for INIT"),
        };

        let (idname, reinit) = match serde_json::from_str::<ClientMessage>(&init_line) {
            Ok(ClientMessage::Init { idname, reinit }) => (idname, reinit),
            Ok(_) => anyhow::bail!("expected INIT as the first message"),
            Err(e) => anyhow::bail!("malformed INIT: {e}"),
        };

        let session_id = SessionId::new();
        let mut session = Session::start(&config, &idname, reinit, session_id.as_str()).await?;

        match session.run(&mut lines, &outbound).await {
            Ok(()) => return Ok(()),
            Err(SessionError::Restart) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
