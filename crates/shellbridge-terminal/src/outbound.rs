//! Rate-limited, serialized writer for outbound client messages.
//!
//! A single mutex plus a last-send timestamp, mirroring the monotonic
//! `min_delay` limiter wrapped around every write to the client connection:
//! only one writer proceeds at a time, and each send waits out whatever is
//! left of the minimum spacing before writing.

use std::time::{Duration, Instant};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use shellbridge_protocol::ServerMessage;

pub struct Outbound<W> {
    writer: Mutex<W>,
    min_delay: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl<W: AsyncWrite + Unpin> Outbound<W> {
    pub fn new(writer: W, min_delay: Duration) -> Self {
        Self {
            writer: Mutex::new(writer),
            min_delay,
            last_sent: Mutex::new(None),
        }
    }

    /// Serialize `msg` to its wire line, wait out the rate limit, then write
    /// it. Holds the send lock across the wait so concurrent senders queue
    /// in arrival order rather than racing the clock.
    pub async fn send(&self, msg: &ServerMessage) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;

        {
            let mut last_sent = self.last_sent.lock().await;
            if let Some(last) = *last_sent {
                let elapsed = last.elapsed();
                if elapsed < self.min_delay {
                    tokio::time::sleep(self.min_delay - elapsed).await;
                }
            }
            *last_sent = Some(Instant::now());
        }

        let line = msg.to_line();
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn send_writes_a_newline_terminated_line() {
        let (client, mut server) = duplex(4096);
        let outbound = Outbound::new(client, Duration::from_millis(0));

        outbound
            .send(&ServerMessage::Direct {
                payload: "hi".to_string(),
            })
            .await
            .unwrap();

        let mut buf = vec![0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..n]);
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"type\":\"DIRECT\""));
    }

    #[tokio::test]
    async fn consecutive_sends_are_spaced_by_min_delay() {
        let (client, _server) = duplex(65536);
        let outbound = Outbound::new(client, Duration::from_millis(50));

        let start = Instant::now();
        outbound
            .send(&ServerMessage::Direct { payload: "a".into() })
            .await
            .unwrap();
        outbound
            .send(&ServerMessage::Direct { payload: "b".into() })
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
