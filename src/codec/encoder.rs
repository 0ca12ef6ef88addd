//! リクエストエンコーダー

use bytes::{BufMut, BytesMut};

use super::OutboundEvent;

/// Chunked Transfer Encoding 用のチャンクをエンコード
///
/// 空のデータを渡すと終端チャンク (0\r\n\r\n) を書く。
pub fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        out.put_slice(b"0\r\n\r\n");
        return;
    }
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

/// 送信イベントをバイト列にする
///
/// ヘッダーの Transfer-Encoding を見て、以降のボディを chunked でフレーミングするか決める。
#[derive(Debug, Default)]
pub struct RequestEncoder {
    chunked: bool,
}

impl RequestEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 現在のボディを chunked でフレーミングしているか
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn encode(&mut self, event: &OutboundEvent, out: &mut BytesMut) {
        match event {
            OutboundEvent::Head(request) => {
                out.put_slice(&request.encode_head());
                self.chunked = request.is_chunked();
            }
            OutboundEvent::Content(data) => {
                // 空のチャンクは終端と区別できないので書かない
                if data.is_empty() {
                    return;
                }
                if self.chunked {
                    encode_chunk(data, out);
                } else {
                    out.put_slice(data);
                }
            }
            OutboundEvent::Last => {
                if self.chunked {
                    encode_chunk(&[], out);
                }
                self.chunked = false;
            }
            OutboundEvent::Full(request, body) => {
                out.put_slice(&request.encode_head());
                if request.is_chunked() {
                    if !body.is_empty() {
                        encode_chunk(body, out);
                    }
                    encode_chunk(&[], out);
                } else {
                    out.put_slice(body);
                }
                self.chunked = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::request::OutboundRequest;

    fn encode_all(events: &[OutboundEvent]) -> Vec<u8> {
        let mut encoder = RequestEncoder::new();
        let mut out = BytesMut::new();
        for event in events {
            encoder.encode(event, &mut out);
        }
        out.to_vec()
    }

    #[test]
    fn test_chunked_stream() {
        let request = OutboundRequest::new("POST", "/").header("Transfer-Encoding", "chunked");
        let bytes = encode_all(&[
            OutboundEvent::Head(request),
            OutboundEvent::Content(Bytes::from_static(b"hello")),
            OutboundEvent::Content(Bytes::new()),
            OutboundEvent::Last,
        ]);
        assert!(bytes.ends_with(b"\r\n\r\n5\r\nhello\r\n0\r\n\r\n"));
    }

    #[test]
    fn test_fixed_length_stream() {
        let request = OutboundRequest::new("POST", "/").header("Content-Length", "5");
        let bytes = encode_all(&[
            OutboundEvent::Head(request),
            OutboundEvent::Content(Bytes::from_static(b"hello")),
            OutboundEvent::Last,
        ]);
        assert!(bytes.ends_with(b"Content-Length: 5\r\n\r\nhello"));
    }

    #[test]
    fn test_full_message() {
        let request = OutboundRequest::new("GET", "/").header("Content-Length", "0");
        let bytes = encode_all(&[OutboundEvent::Full(request, Bytes::new())]);
        assert_eq!(bytes, b"GET / HTTP/1.1\r\nContent-Length: 0\r\n\r\n".to_vec());
    }
}
