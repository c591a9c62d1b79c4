//! Request head reading
//!
//! Reads the request line and headers off a public stream without touching
//! the body. Everything read, including any body bytes that arrived in the
//! same segments, is kept verbatim so it can be replayed as the first write
//! to the proxy channel.

use bytes::BytesMut;
use outpost_http_auth::{find_header, parse_request_headers};
use outpost_router::canonical_host;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Cap on the request head; larger heads are answered with a plain error
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Head reading errors
#[derive(Debug, Error)]
pub enum HeadError {
    #[error("request head exceeds {MAX_HEAD_SIZE} bytes")]
    TooLarge,

    #[error("connection closed before the request head completed")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The parsed head plus the raw bytes to replay
#[derive(Debug)]
pub struct RequestHead {
    /// Every byte read from the stream so far
    pub raw: Vec<u8>,
    /// Canonicalized Host header, when present
    pub host: Option<String>,
    /// Authorization header, verbatim
    pub authorization: Option<String>,
}

/// Read until the blank line that ends the header block
pub async fn read_request_head<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<RequestHead, HeadError> {
    let mut buf = BytesMut::with_capacity(2 * 1024);

    let head_end = loop {
        if let Some(pos) = find_terminator(&buf) {
            break pos + HEAD_TERMINATOR.len();
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HeadError::TooLarge);
        }

        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(HeadError::Truncated);
        }
    };

    let headers = parse_request_headers(&buf[..head_end]);
    let host = find_header(&headers, "host").map(canonical_host);
    let authorization = find_header(&headers, "authorization").map(str::to_string);

    Ok(RequestHead {
        raw: buf.to_vec(),
        host,
        authorization,
    })
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_reads_simple_request() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        tx.write_all(b"GET / HTTP/1.1\r\nHost: Demo.Example.com:8080\r\n\r\n")
            .await
            .unwrap();

        let head = read_request_head(&mut rx).await.unwrap();
        assert_eq!(head.host.as_deref(), Some("demo.example.com"));
        assert!(head.authorization.is_none());
        assert!(head.raw.ends_with(b"\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_keeps_body_bytes_for_replay() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        let request = b"POST /submit HTTP/1.1\r\nHost: a.example.com\r\nContent-Length: 4\r\n\r\nwxyz";
        tx.write_all(request).await.unwrap();

        let head = read_request_head(&mut rx).await.unwrap();
        assert_eq!(head.raw, request.to_vec());
    }

    #[tokio::test]
    async fn test_head_split_across_reads() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        let read = tokio::spawn(async move { read_request_head(&mut rx).await });

        tx.write_all(b"GET / HTTP/1.1\r\nHo").await.unwrap();
        tokio::task::yield_now().await;
        tx.write_all(b"st: a.example.com\r\n\r\n").await.unwrap();

        let head = read.await.unwrap().unwrap();
        assert_eq!(head.host.as_deref(), Some("a.example.com"));
    }

    #[tokio::test]
    async fn test_authorization_extracted() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        tx.write_all(
            b"GET / HTTP/1.1\r\nHost: a.example.com\r\nAuthorization: Basic YWxpY2U6cHc=\r\n\r\n",
        )
        .await
        .unwrap();

        let head = read_request_head(&mut rx).await.unwrap();
        assert_eq!(head.authorization.as_deref(), Some("Basic YWxpY2U6cHc="));
    }

    #[tokio::test]
    async fn test_missing_host() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        tx.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

        let head = read_request_head(&mut rx).await.unwrap();
        assert!(head.host.is_none());
    }

    #[tokio::test]
    async fn test_truncated_head() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        tx.write_all(b"GET / HTTP/1.1\r\nHost: a.ex").await.unwrap();
        drop(tx);

        let err = read_request_head(&mut rx).await.unwrap_err();
        assert!(matches!(err, HeadError::Truncated));
    }

    #[tokio::test]
    async fn test_oversized_head() {
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        request.extend_from_slice(&vec![b'a'; MAX_HEAD_SIZE + 16]);
        tx.write_all(&request).await.unwrap();

        let err = read_request_head(&mut rx).await.unwrap_err();
        assert!(matches!(err, HeadError::TooLarge));
    }
}
