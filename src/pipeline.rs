//! 名前付きコーデックステージの並び
//!
//! 受信イベントは先頭から、送信イベントは末尾から順にステージを通る。
//! デコーダー、エンコーダー、展開ステージをまとめてコーデックと呼び、
//! [`Pipeline::add_handler_first`] はコーデックの直後に差し込む。

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::codec::{
    Aggregator, ChunkedWriter, GzipDecompressor, InboundEvent, OutboundEvent, RequestEncoder,
    ResponseDecoder,
};

/// ステージ名
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageName {
    HttpDecoder,
    HttpEncoder,
    HttpDecompressor,
    HttpAggregator,
    ChunkedWriter,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::HttpDecoder => "http-decoder",
            StageName::HttpEncoder => "http-encoder",
            StageName::HttpDecompressor => "http-decompressor",
            StageName::HttpAggregator => "http-aggregator",
            StageName::ChunkedWriter => "chunked-writer",
        }
    }

    fn is_codec(&self) -> bool {
        matches!(
            self,
            StageName::HttpDecoder | StageName::HttpEncoder | StageName::HttpDecompressor
        )
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// パイプラインのステージ
#[derive(Debug)]
pub enum Stage {
    Decoder(ResponseDecoder),
    Encoder(RequestEncoder),
    Decompressor(GzipDecompressor),
    Aggregator(Aggregator),
    ChunkedWriter(ChunkedWriter),
}

impl Stage {
    pub fn name(&self) -> StageName {
        match self {
            Stage::Decoder(_) => StageName::HttpDecoder,
            Stage::Encoder(_) => StageName::HttpEncoder,
            Stage::Decompressor(_) => StageName::HttpDecompressor,
            Stage::Aggregator(_) => StageName::HttpAggregator,
            Stage::ChunkedWriter(_) => StageName::ChunkedWriter,
        }
    }
}

#[derive(Debug, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// ステージ名の一覧 (受信方向の順)
    pub fn names(&self) -> Vec<StageName> {
        self.stages.iter().map(Stage::name).collect()
    }

    pub fn contains(&self, name: StageName) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: StageName) -> Option<usize> {
        self.stages.iter().position(|s| s.name() == name)
    }

    /// 同名のステージがなければ先頭に追加
    pub fn add_first(&mut self, stage: Stage) -> bool {
        if self.contains(stage.name()) {
            return false;
        }
        self.stages.insert(0, stage);
        true
    }

    /// 同名のステージがなければ末尾に追加
    pub fn add_last(&mut self, stage: Stage) -> bool {
        if self.contains(stage.name()) {
            return false;
        }
        self.stages.push(stage);
        true
    }

    /// `base` の直後に追加
    pub fn add_after(&mut self, base: StageName, stage: Stage) -> bool {
        if self.contains(stage.name()) {
            return false;
        }
        let Some(index) = self.position(base) else {
            return false;
        };
        self.stages.insert(index + 1, stage);
        true
    }

    /// コーデックの直後に追加
    ///
    /// 受信方向ではコーデックの出力を最初に受け取り、送信方向ではエンコーダーの直前に通る
    pub fn add_handler_first(&mut self, stage: Stage) -> bool {
        if self.contains(stage.name()) {
            return false;
        }
        let index = self
            .stages
            .iter()
            .rposition(|s| s.name().is_codec())
            .map_or(0, |i| i + 1);
        self.stages.insert(index, stage);
        true
    }

    /// 同名のステージを置き換え、古いステージを返す
    pub fn replace(&mut self, stage: Stage) -> Option<Stage> {
        let index = self.position(stage.name())?;
        Some(std::mem::replace(&mut self.stages[index], stage))
    }

    pub fn remove(&mut self, name: StageName) -> Option<Stage> {
        let index = self.position(name)?;
        Some(self.stages.remove(index))
    }

    pub fn decoder_mut(&mut self) -> Option<&mut ResponseDecoder> {
        self.stages.iter_mut().find_map(|s| match s {
            Stage::Decoder(d) => Some(d),
            _ => None,
        })
    }

    /// デコーダーが読んでいないバッファを取り出す
    pub fn take_decoder_remaining(&mut self) -> Bytes {
        self.decoder_mut()
            .map(ResponseDecoder::take_remaining)
            .unwrap_or_default()
    }

    /// 受信したバイト列をイベントにする
    pub fn decode(&mut self, data: &[u8]) -> Vec<InboundEvent> {
        let Some(decoder) = self.decoder_mut() else {
            return Vec::new();
        };
        let events = match decoder.feed(data) {
            Ok(()) => decoder.decode_all(),
            Err(e) => vec![InboundEvent::Malformed(e)],
        };
        self.run_inbound(events)
    }

    /// 接続終了を通知して残りのイベントを取り出す
    pub fn decode_eof(&mut self) -> Vec<InboundEvent> {
        let Some(decoder) = self.decoder_mut() else {
            return Vec::new();
        };
        decoder.mark_eof();
        let events = decoder.decode_all();
        self.run_inbound(events)
    }

    fn run_inbound(&mut self, mut events: Vec<InboundEvent>) -> Vec<InboundEvent> {
        for stage in self.stages.iter_mut() {
            events = match stage {
                Stage::Decompressor(d) => events.into_iter().flat_map(|e| d.process(e)).collect(),
                Stage::Aggregator(a) => events.into_iter().flat_map(|e| a.process(e)).collect(),
                _ => events,
            };
        }
        events
    }

    /// 送信イベントをバイト列にする
    ///
    /// HEAD リクエストを送るときはデコーダーにボディなしのレスポンスを待たせる
    pub fn encode(&mut self, event: OutboundEvent) -> Bytes {
        let head_method = match &event {
            OutboundEvent::Head(request) | OutboundEvent::Full(request, _) => {
                Some(request.method.eq_ignore_ascii_case("HEAD"))
            }
            _ => None,
        };
        if let (Some(is_head), Some(decoder)) = (head_method, self.decoder_mut()) {
            decoder.set_expect_no_body(is_head);
        }

        let mut events = vec![event];
        let mut out = BytesMut::new();
        for stage in self.stages.iter_mut().rev() {
            match stage {
                Stage::ChunkedWriter(w) => {
                    events = events.into_iter().flat_map(|e| w.split(e)).collect();
                }
                Stage::Encoder(encoder) => {
                    for event in events.drain(..) {
                        encoder.encode(&event, &mut out);
                    }
                }
                _ => {}
            }
        }
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LastContent;
    use crate::request::OutboundRequest;

    fn http_pipeline() -> Pipeline {
        let mut pipeline = Pipeline::new();
        pipeline.add_last(Stage::Decoder(ResponseDecoder::new()));
        pipeline.add_last(Stage::Encoder(RequestEncoder::new()));
        pipeline
    }

    #[test]
    fn test_add_handler_first_goes_after_codec() {
        let mut pipeline = http_pipeline();
        pipeline.add_after(
            StageName::HttpDecoder,
            Stage::Decompressor(GzipDecompressor::new()),
        );
        assert!(pipeline.add_handler_first(Stage::ChunkedWriter(ChunkedWriter::default())));
        assert!(pipeline.add_handler_first(Stage::Aggregator(Aggregator::default())));
        assert_eq!(
            pipeline.names(),
            vec![
                StageName::HttpDecoder,
                StageName::HttpDecompressor,
                StageName::HttpEncoder,
                StageName::HttpAggregator,
                StageName::ChunkedWriter,
            ]
        );
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let mut pipeline = http_pipeline();
        assert!(!pipeline.add_last(Stage::Decoder(ResponseDecoder::new())));
        assert_eq!(pipeline.names().len(), 2);
    }

    #[test]
    fn test_aggregated_decode() {
        let mut pipeline = http_pipeline();
        pipeline.add_handler_first(Stage::Aggregator(Aggregator::default()));
        let events = pipeline.decode(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        match &events[..] {
            [InboundEvent::Full(full)] => assert_eq!(full.body.as_ref(), b"ok"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_encode_splits_through_chunked_writer() {
        let mut pipeline = http_pipeline();
        pipeline.add_handler_first(Stage::ChunkedWriter(ChunkedWriter::new(2)));
        let request = OutboundRequest::new("POST", "/").header("Transfer-Encoding", "chunked");
        pipeline.encode(OutboundEvent::Head(request));
        let bytes = pipeline.encode(OutboundEvent::Content(Bytes::from_static(b"abcde")));
        assert_eq!(bytes.as_ref(), b"2\r\nab\r\n2\r\ncd\r\n1\r\ne\r\n");
    }

    #[test]
    fn test_head_request_expects_no_body() {
        let mut pipeline = http_pipeline();
        pipeline.encode(OutboundEvent::Head(OutboundRequest::new("HEAD", "/")));
        let events = pipeline.decode(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], InboundEvent::Last(LastContent::Empty));
    }

    #[test]
    fn test_remove_and_replace() {
        let mut pipeline = http_pipeline();
        assert!(pipeline.replace(Stage::Decoder(ResponseDecoder::new())).is_some());
        assert!(pipeline.remove(StageName::HttpDecoder).is_some());
        assert!(pipeline.decode(b"HTTP/1.1 200 OK\r\n\r\n").is_empty());
        assert!(pipeline.replace(Stage::Aggregator(Aggregator::default())).is_none());
    }
}
