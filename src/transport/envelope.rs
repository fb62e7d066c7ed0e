//! Wire envelope and framing (`spec.md` §6). No `h3` crate is available here,
//! so true HTTP/3 framing is not in play; this carries the same header
//! fields and status codes HTTP/3 would, length-prefixed as JSON
//! (`send_message`/`receive_message`) over quinn's bidirectional QUIC
//! streams. See `DESIGN.md` for the divergence note.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 1 MiB, the `/publish` body ceiling (`spec.md` §4.4); also the frame cap.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024 + 4096;

/// One request, carrying the envelope headers of `spec.md` §6 plus a body.
/// `path` stands in for the HTTP/3 method+path pair (e.g. `"POST /publish"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub path: String,
    pub remote_addr: Option<String>,
    pub action_id: Option<String>,
    pub node_id: Option<String>,
    pub identifier: Option<String>,
    pub signature: Option<String>,
    pub received_from: Option<String>,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            remote_addr: None,
            action_id: None,
            node_id: None,
            identifier: None,
            signature: None,
            received_from: None,
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { status, body: body.into() }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self { status, body: body.into().into_bytes() }
    }

    pub fn json<T: Serialize>(status: u16, value: &T) -> anyhow::Result<Self> {
        Ok(Self { status, body: serde_json::to_vec(value)? })
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin, T: Serialize>(writer: &mut W, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_vec(value)?;
    if json.len() > MAX_FRAME_SIZE {
        anyhow::bail!("frame size {} exceeds maximum {}", json.len(), MAX_FRAME_SIZE);
    }
    writer.write_all(&(json.len() as u32).to_be_bytes()).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin, T: for<'de> Deserialize<'de>>(reader: &mut R) -> anyhow::Result<T> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        anyhow::bail!("frame size {} exceeds maximum {}", len, MAX_FRAME_SIZE);
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_round_trips_through_frame() {
        let req = Request::new("POST /publish").with_body(b"MERGE (n)".to_vec());
        let mut buf = Vec::new();
        write_frame(&mut buf, &req).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Request = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded.path, "POST /publish");
        assert_eq!(decoded.body, b"MERGE (n)");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let req = Request::new("POST /publish").with_body(vec![0u8; MAX_FRAME_SIZE + 1]);
        let mut buf = Vec::new();
        assert!(write_frame(&mut buf, &req).await.is_err());
    }
}
