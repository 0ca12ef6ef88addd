//! gzip 展開ステージ
//!
//! Content-Encoding: gzip / x-gzip のレスポンスボディを逐次展開する。
//! それ以外のレスポンスはそのまま通す。

use std::io::Write;

use bytes::Bytes;
use flate2::write::GzDecoder;

use crate::error::DecodeError;

use super::{InboundEvent, LastContent};

#[derive(Default)]
pub struct GzipDecompressor {
    decoder: Option<GzDecoder<Vec<u8>>>,
}

impl std::fmt::Debug for GzipDecompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GzipDecompressor")
            .field("active", &self.decoder.is_some())
            .finish()
    }
}

impl GzipDecompressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, event: InboundEvent) -> Vec<InboundEvent> {
        match event {
            InboundEvent::Head(mut head) => {
                let gzip = head
                    .headers
                    .get("Content-Encoding")
                    .map(|v| v.trim().to_ascii_lowercase())
                    .is_some_and(|v| v == "gzip" || v == "x-gzip");
                self.decoder = None;
                if gzip {
                    // 展開後の長さは分からないので Content-Length も外す
                    head.headers.remove("Content-Encoding");
                    head.headers.remove("Content-Length");
                    self.decoder = Some(GzDecoder::new(Vec::new()));
                }
                vec![InboundEvent::Head(head)]
            }
            InboundEvent::Content(data) if self.decoder.is_some() => {
                match self.write(&data) {
                    Ok(Some(out)) => vec![InboundEvent::Content(out)],
                    Ok(None) => Vec::new(),
                    Err(e) => vec![InboundEvent::Malformed(e)],
                }
            }
            InboundEvent::Last(last) if self.decoder.is_some() => {
                let mut events = Vec::new();
                if let LastContent::Data(data) = &last {
                    match self.write(data) {
                        Ok(Some(out)) => events.push(InboundEvent::Content(out)),
                        Ok(None) => {}
                        Err(e) => {
                            self.decoder = None;
                            return vec![InboundEvent::Malformed(e)];
                        }
                    }
                }
                match self.finish() {
                    Ok(Some(out)) => events.push(InboundEvent::Content(out)),
                    Ok(None) => {}
                    Err(e) => return vec![InboundEvent::Malformed(e)],
                }
                events.push(InboundEvent::Last(LastContent::Empty));
                events
            }
            other => vec![other],
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<Option<Bytes>, DecodeError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(None);
        };
        decoder
            .write_all(data)
            .map_err(|e| DecodeError::Decompress(e.to_string()))?;
        Ok(take_output(decoder.get_mut()))
    }

    fn finish(&mut self) -> Result<Option<Bytes>, DecodeError> {
        let Some(mut decoder) = self.decoder.take() else {
            return Ok(None);
        };
        decoder
            .try_finish()
            .map_err(|e| DecodeError::Decompress(e.to_string()))?;
        Ok(take_output(decoder.get_mut()))
    }
}

fn take_output(buf: &mut Vec<u8>) -> Option<Bytes> {
    if buf.is_empty() {
        None
    } else {
        Some(Bytes::from(std::mem::take(buf)))
    }
}
