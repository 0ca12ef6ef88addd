//! 大きな送信ボディを一定サイズの書き込みに分割するステージ

use super::OutboundEvent;

/// フォーム送信時の 1 回の書き込みサイズ
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ChunkedWriter {
    chunk_size: usize,
}

impl Default for ChunkedWriter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkedWriter {
    /// `chunk_size` が 0 の場合は 1 として扱う
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Content を chunk_size 以下の Content 列にする
    pub fn split(&self, event: OutboundEvent) -> Vec<OutboundEvent> {
        match event {
            OutboundEvent::Content(mut data) if data.len() > self.chunk_size => {
                let mut out = Vec::with_capacity(data.len().div_ceil(self.chunk_size));
                while !data.is_empty() {
                    let n = self.chunk_size.min(data.len());
                    out.push(OutboundEvent::Content(data.split_to(n)));
                }
                out
            }
            other => vec![other],
        }
    }
}
