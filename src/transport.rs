//! エクスチェンジから見た接続
//!
//! 実際のソケット I/O は実装側 (tokio ドライバーなど) が持つ。
//! エクスチェンジはこのトレイトを通してステージの入れ替え、書き込み、読み込み要求を行う。

use bytes::{Bytes, BytesMut};

use crate::codec::OutboundEvent;
use crate::context::ConnectionContext;
use crate::listener::ExchangeListener;
use crate::mode::ConnectionMode;
use crate::pipeline::Pipeline;

pub trait Transport {
    fn pipeline(&mut self) -> &mut Pipeline;

    /// エンコード済みのバイト列を送信キューに積む
    fn send_bytes(&mut self, bytes: Bytes);

    /// イベントをパイプラインでエンコードして送る
    fn write_and_flush(&mut self, event: OutboundEvent) {
        let bytes = self.pipeline().encode(event);
        if !bytes.is_empty() {
            self.send_bytes(bytes);
        }
    }

    /// 1 回分の読み込みを要求する
    fn read(&mut self);

    /// 要求がなくても読み続けるかどうか
    fn set_auto_read(&mut self, auto_read: bool);

    fn is_auto_read(&self) -> bool;

    /// 接続を直ちに閉じる
    fn close(&mut self);

    fn is_closed(&self) -> bool;

    /// 次のエクスチェンジに再利用できるか
    fn is_persistent(&self) -> bool;

    fn mark_persistent(&mut self, persistent: bool);

    fn context(&self) -> &ConnectionContext;

    /// TLS 上の接続かどうか
    fn is_secure(&self) -> bool {
        self.context().secure
    }
}

/// メモリ上の接続
///
/// 書き込まれたバイト列と読み込み要求の回数を記録する。
#[derive(Debug)]
pub struct MemoryTransport {
    pipeline: Pipeline,
    written: BytesMut,
    reads: usize,
    auto_read: bool,
    closed: bool,
    persistent: bool,
    context: ConnectionContext,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_context(ConnectionContext::default())
    }

    pub fn with_context(context: ConnectionContext) -> Self {
        Self {
            pipeline: Pipeline::new(),
            written: BytesMut::new(),
            reads: 0,
            auto_read: false,
            closed: false,
            persistent: true,
            context,
        }
    }

    /// これまでに書き込まれたバイト列を取り出す
    pub fn take_written(&mut self) -> Bytes {
        self.written.split().freeze()
    }

    /// 読み込み要求の回数
    pub fn read_requests(&self) -> usize {
        self.reads
    }

    /// 受信したバイト列をデコードして現在のモードに渡す
    pub fn receive<L: ExchangeListener>(
        &mut self,
        mode: &mut ConnectionMode,
        listener: &mut L,
        data: &[u8],
    ) {
        let events = self.pipeline.decode(data);
        for event in events {
            mode.on_inbound(self, listener, event);
        }
    }

    /// 相手が接続を閉じた
    pub fn receive_eof<L: ExchangeListener>(
        &mut self,
        mode: &mut ConnectionMode,
        listener: &mut L,
    ) {
        let events = self.pipeline.decode_eof();
        for event in events {
            mode.on_inbound(self, listener, event);
        }
    }
}

impl Transport for MemoryTransport {
    fn pipeline(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    fn send_bytes(&mut self, bytes: Bytes) {
        self.written.extend_from_slice(&bytes);
    }

    fn read(&mut self) {
        self.reads += 1;
    }

    fn set_auto_read(&mut self, auto_read: bool) {
        self.auto_read = auto_read;
    }

    fn is_auto_read(&self) -> bool {
        self.auto_read
    }

    fn close(&mut self) {
        self.closed = true;
        self.persistent = false;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn mark_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    fn context(&self) -> &ConnectionContext {
        &self.context
    }
}
