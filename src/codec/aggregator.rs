//! レスポンス集約ステージ

use bytes::{BufMut, BytesMut};

use crate::error::DecodeError;
use crate::response::{FullResponse, ResponseHead};

use super::{InboundEvent, LastContent};

/// WebSocket ハンドシェイク用の集約上限
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 8192;

/// Head / Content / Last を 1 つの Full にまとめる
#[derive(Debug)]
pub struct Aggregator {
    max_content_length: usize,
    head: Option<ResponseHead>,
    body: BytesMut,
    /// 上限超過後は終端まで読み捨てる
    discarding: bool,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONTENT_LENGTH)
    }
}

impl Aggregator {
    pub fn new(max_content_length: usize) -> Self {
        Self {
            max_content_length,
            head: None,
            body: BytesMut::new(),
            discarding: false,
        }
    }

    pub fn max_content_length(&self) -> usize {
        self.max_content_length
    }

    pub fn process(&mut self, event: InboundEvent) -> Vec<InboundEvent> {
        match event {
            InboundEvent::Head(head) => {
                self.head = Some(head);
                self.body.clear();
                self.discarding = false;
                Vec::new()
            }
            InboundEvent::Content(data) => {
                self.append(&data).into_iter().collect()
            }
            InboundEvent::Last(last) => {
                let mut events: Vec<InboundEvent> = match &last {
                    LastContent::Data(data) => self.append(data).into_iter().collect(),
                    LastContent::Empty => Vec::new(),
                };
                if self.discarding {
                    self.discarding = false;
                    return events;
                }
                if let Some(head) = self.head.take() {
                    events.push(InboundEvent::Full(FullResponse {
                        head,
                        body: self.body.split().freeze(),
                    }));
                }
                events
            }
            other => vec![other],
        }
    }

    fn append(&mut self, data: &[u8]) -> Option<InboundEvent> {
        if self.discarding || self.head.is_none() {
            return None;
        }
        let size = self.body.len() + data.len();
        if size > self.max_content_length {
            self.head = None;
            self.body.clear();
            self.discarding = true;
            return Some(InboundEvent::Malformed(DecodeError::BodyTooLarge {
                size,
                limit: self.max_content_length,
            }));
        }
        self.body.put_slice(data);
        None
    }
}
