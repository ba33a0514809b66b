//! Newline-delimited JSON request/response to a device's TCP control port.
//!
//! Connects with a timeout, writes `json + '\n'`, then reads until EOF, a
//! line ending in `'\n'`, or a timeout — whichever comes first.

use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug)]
pub enum DeviceClientError {
    Connect(std::io::Error),
    Write(std::io::Error),
    Read(std::io::Error),
    Timeout,
}

impl fmt::Display for DeviceClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClientError::Connect(e) => write!(f, "device connect failed: {e}"),
            DeviceClientError::Write(e) => write!(f, "device write failed: {e}"),
            DeviceClientError::Read(e) => write!(f, "device read failed: {e}"),
            DeviceClientError::Timeout => write!(f, "device request timed out"),
        }
    }
}

impl std::error::Error for DeviceClientError {}

/// Send `request` to `addr` and return its decoded JSON reply. A reply that
/// does not parse as JSON is wrapped as `{"raw": "<text>"}` rather than
/// treated as an error, matching the original's lenient fallback.
pub async fn request(
    addr: SocketAddr,
    request: &Value,
    connect_timeout: Duration,
    round_trip_timeout: Duration,
) -> Result<Value, DeviceClientError> {
    let mut stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| DeviceClientError::Timeout)?
        .map_err(DeviceClientError::Connect)?;

    let mut line = serde_json::to_vec(request).expect("Value always serializes");
    line.push(b'\n');
    timeout(round_trip_timeout, stream.write_all(&line))
        .await
        .map_err(|_| DeviceClientError::Timeout)?
        .map_err(DeviceClientError::Write)?;

    let reply_text = timeout(round_trip_timeout, read_reply(&mut stream))
        .await
        .map_err(|_| DeviceClientError::Timeout)??;

    Ok(serde_json::from_str(&reply_text)
        .unwrap_or_else(|_| serde_json::json!({ "raw": reply_text })))
}

/// Reads until EOF or a line terminated by `\n`, whichever comes first.
async fn read_reply(stream: &mut TcpStream) -> Result<String, DeviceClientError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(DeviceClientError::Read)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.last() == Some(&b'\n') {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf);
    Ok(text.trim_end_matches('\n').to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn round_trips_json_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = stream.into_split();
            let mut reader = BufReader::new(rd);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let req: Value = serde_json::from_str(line.trim_end()).unwrap();
            assert_eq!(req["license"], "?");
            wr.write_all(b"{\"ok\":true}\n").await.unwrap();
        });

        let reply = request(
            addr,
            &serde_json::json!({"license": "?"}),
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(reply["ok"], true);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn non_json_reply_is_wrapped_raw() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (_, mut wr) = stream.into_split();
            wr.write_all(b"not json\n").await.unwrap();
        });

        let reply = request(
            addr,
            &serde_json::json!({"license": "?"}),
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(reply["raw"], "not json");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_surfaces_as_error() {
        let result = request(
            "127.0.0.1:1".parse().unwrap(),
            &serde_json::json!({}),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .await;
        assert!(result.is_err());
    }
}
