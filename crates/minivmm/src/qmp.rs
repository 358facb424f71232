//! QEMU Machine Protocol client over the per-VM Unix socket.
//!
//! QMP frames are newline-delimited JSON. A session starts with a
//! `{"QMP": ...}` greeting from QEMU and must complete the
//! `qmp_capabilities` handshake before any other command is accepted.
//! Every command, the connect included, runs under a 10-second deadline.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::error::{Error, Result};

pub const COMMAND_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct QmpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl QmpClient {
    /// Connect, consume the greeting, and complete the capabilities
    /// handshake. Callers interpret a connect failure as "no QEMU".
    pub async fn connect(socket: &Path) -> Result<Self> {
        let fut = async {
            let stream = UnixStream::connect(socket)
                .await
                .with_context(|| format!("connect {}", socket.display()))?;
            let (read_half, writer) = stream.into_split();
            let mut client = QmpClient {
                reader: BufReader::new(read_half),
                writer,
            };

            let greeting = client.read_message().await?;
            if greeting.get("QMP").is_none() {
                return Err(anyhow!("unexpected QMP greeting: {greeting}"));
            }

            client.send(&json!({ "execute": "qmp_capabilities" })).await?;
            client.read_return().await?;
            anyhow::Ok(client)
        };

        match timeout(COMMAND_DEADLINE, fut).await {
            Err(_) => Err(Error::timeout("QMP connect")),
            Ok(res) => res.map_err(|e| Error::upstream("QMP connect", e)),
        }
    }

    async fn send(&mut self, payload: &Value) -> anyhow::Result<()> {
        let mut data = serde_json::to_string(payload)?;
        data.push('\n');
        self.writer
            .write_all(data.as_bytes())
            .await
            .context("QMP write")
    }

    async fn read_message(&mut self) -> anyhow::Result<Value> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.context("QMP read")?;
        if n == 0 {
            return Err(anyhow!("QMP connection closed"));
        }
        serde_json::from_str(&line).context("QMP frame is not valid JSON")
    }

    /// Read until a `return` or `error` frame arrives, skipping the
    /// asynchronous event frames QEMU emits in between.
    async fn read_return(&mut self) -> anyhow::Result<Value> {
        loop {
            let msg = self.read_message().await?;
            if let Some(ret) = msg.get("return") {
                return Ok(ret.clone());
            }
            if let Some(err) = msg.get("error") {
                return Err(anyhow!("QMP error response: {err}"));
            }
        }
    }

    /// Execute a command under the 10-second deadline and return its
    /// `return` payload.
    pub async fn execute(&mut self, command: &str) -> Result<Value> {
        let fut = async {
            self.send(&json!({ "execute": command })).await?;
            self.read_return().await
        };
        match timeout(COMMAND_DEADLINE, fut).await {
            Err(_) => Err(Error::timeout(format!("QMP {command}"))),
            Ok(res) => res.map_err(|e| Error::upstream(format!("QMP {command}"), e)),
        }
    }

    /// `query-status` → the guest run state string ("running", "paused", …).
    pub async fn query_status(&mut self) -> Result<String> {
        let ret = self.execute("query-status").await?;
        ret.get("status")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::upstream("QMP query-status", anyhow!("malformed response: {ret}"))
            })
    }

    /// `query-vnc` → the TCP port ("service") the VNC server reports.
    pub async fn query_vnc_port(&mut self) -> Result<String> {
        let ret = self.execute("query-vnc").await?;
        ret.get("service")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::upstream("QMP query-vnc", anyhow!("malformed response: {ret}")))
    }

    pub async fn system_powerdown(&mut self) -> Result<()> {
        self.execute("system_powerdown").await.map(|_| ())
    }

    pub async fn quit(&mut self) -> Result<()> {
        self.execute("quit").await.map(|_| ())
    }

    /// Consume the session; the returned channel fires once QEMU closes
    /// its side of the socket, confirming teardown.
    pub fn into_disconnect_signal(self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let QmpClient {
            mut reader,
            mut writer,
        } = self;
        tokio::spawn(async move {
            let _ = writer.shutdown().await;
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            let _ = tx.send(());
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    const GREETING: &str =
        r#"{"QMP":{"version":{"qemu":{"major":8,"minor":2,"micro":0}},"capabilities":[]}}"#;

    /// Serve one QMP session: greeting, capabilities ack, then scripted
    /// replies keyed by command name.
    fn spawn_server(
        socket: std::path::PathBuf,
        replies: Vec<(&'static str, String)>,
    ) -> tokio::task::JoinHandle<()> {
        // Bind before spawning so the client can never race the listener.
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            write_half
                .write_all(format!("{GREETING}\n").as_bytes())
                .await
                .unwrap();

            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert!(line.contains("qmp_capabilities"), "got: {line}");
            write_half.write_all(b"{\"return\":{}}\n").await.unwrap();

            for (expect, reply) in replies {
                line.clear();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    return;
                }
                assert!(line.contains(expect), "expected {expect}, got {line}");
                write_half.write_all(reply.as_bytes()).await.unwrap();
            }
            // Hold the socket open until the client goes away; commands
            // arriving here are deliberately never answered.
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
    }

    #[tokio::test]
    async fn handshake_and_query_status() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("qmp.socket");
        let server = spawn_server(
            socket.clone(),
            vec![(
                "query-status",
                // An async event precedes the return frame and must be skipped.
                "{\"event\":\"NIC_RX_FILTER_CHANGED\"}\n{\"return\":{\"status\":\"running\",\"running\":true}}\n"
                    .to_string(),
            )],
        );

        let mut client = QmpClient::connect(&socket).await.unwrap();
        assert_eq!(client.query_status().await.unwrap(), "running");
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn query_vnc_returns_service_port() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("qmp.socket");
        let server = spawn_server(
            socket.clone(),
            vec![(
                "query-vnc",
                "{\"return\":{\"enabled\":true,\"service\":\"5900\",\"host\":\"0.0.0.0\"}}\n"
                    .to_string(),
            )],
        );

        let mut client = QmpClient::connect(&socket).await.unwrap();
        assert_eq!(client.query_vnc_port().await.unwrap(), "5900");
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn error_frames_become_upstream_errors() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("qmp.socket");
        let server = spawn_server(
            socket.clone(),
            vec![(
                "system_powerdown",
                "{\"error\":{\"class\":\"GenericError\",\"desc\":\"nope\"}}\n".to_string(),
            )],
        );

        let mut client = QmpClient::connect(&socket).await.unwrap();
        let err = client.system_powerdown().await.unwrap_err();
        assert!(matches!(err, Error::Upstream { .. }), "{err}");
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_to_missing_socket_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let err = QmpClient::connect(&dir.path().join("absent.socket"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn command_deadline_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("qmp.socket");
        // Server that never answers commands after the handshake.
        let _server = spawn_server(socket.clone(), vec![]);

        let mut client = QmpClient::connect(&socket).await.unwrap();
        let err = client.query_status().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err}");
    }

    #[tokio::test]
    async fn disconnect_signal_fires_on_peer_close() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("qmp.socket");
        let server = spawn_server(socket.clone(), vec![]);

        let client = QmpClient::connect(&socket).await.unwrap();
        let disconnected = client.into_disconnect_signal();
        // Dropping the writer makes the server's final read return 0 and
        // close the socket.
        server.await.unwrap();
        disconnected.await.unwrap();
    }
}
