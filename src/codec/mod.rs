//! パイプラインに並べるコーデックステージ
//!
//! 受信側は [`ResponseDecoder`] がバイト列を [`InboundEvent`] に分解し、
//! [`GzipDecompressor`] と [`Aggregator`] がそれを変換する。
//! 送信側は [`OutboundEvent`] を [`ChunkedWriter`] が分割し、[`RequestEncoder`] がバイト列にする。

mod aggregator;
mod chunked;
mod decoder;
mod decompress;
mod encoder;

use bytes::Bytes;

use crate::error::DecodeError;
use crate::request::OutboundRequest;
use crate::response::{FullResponse, ResponseHead};

pub use aggregator::{Aggregator, DEFAULT_MAX_CONTENT_LENGTH};
pub use chunked::{ChunkedWriter, DEFAULT_CHUNK_SIZE};
pub use decoder::ResponseDecoder;
pub use decompress::GzipDecompressor;
pub use encoder::{RequestEncoder, encode_chunk};

/// メッセージ終端
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastContent {
    /// データを持たない終端 (長さ 0 のボディ、chunked の終端チャンク、close-delimited の EOF)
    Empty,
    /// 最後の断片を含む終端
    Data(Bytes),
}

/// デコーダー側から上がってくるイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// ステータスラインとヘッダー
    Head(ResponseHead),
    /// ボディの断片
    Content(Bytes),
    /// メッセージ終端
    Last(LastContent),
    /// 集約済みのレスポンス
    Full(FullResponse),
    /// デコードに失敗した
    Malformed(DecodeError),
}

/// エンコーダーへ渡すイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    /// リクエストラインとヘッダー
    Head(OutboundRequest),
    /// ボディの断片
    Content(Bytes),
    /// ボディ終端
    Last,
    /// ヘッダーとボディを一度に送る
    Full(OutboundRequest, Bytes),
}
