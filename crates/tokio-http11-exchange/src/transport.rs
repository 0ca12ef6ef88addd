//! tokio 接続側の [`Transport`] 実装
//!
//! エクスチェンジからの書き込みは送信バッファに積み、読み込み要求は回数として数える。
//! 実際のソケット I/O は [`crate::Connection`] が行う。

use bytes::{Bytes, BytesMut};
use http11_exchange::{ConnectionContext, Pipeline, Transport};

#[derive(Debug)]
pub struct TokioTransport {
    pipeline: Pipeline,
    outbox: BytesMut,
    pending_reads: usize,
    auto_read: bool,
    closed: bool,
    persistent: bool,
    context: ConnectionContext,
}

impl TokioTransport {
    pub fn new(context: ConnectionContext) -> Self {
        Self {
            pipeline: Pipeline::new(),
            outbox: BytesMut::new(),
            pending_reads: 0,
            auto_read: false,
            closed: false,
            persistent: true,
            context,
        }
    }

    /// 送信バッファを取り出す
    pub fn take_outbox(&mut self) -> Bytes {
        self.outbox.split().freeze()
    }

    /// 読み込み要求を 1 つ消費する。自動読み込み中は常に true
    pub fn take_read_request(&mut self) -> bool {
        if self.auto_read {
            return true;
        }
        if self.pending_reads == 0 {
            return false;
        }
        self.pending_reads -= 1;
        true
    }

    pub fn pending_reads(&self) -> usize {
        self.pending_reads
    }
}

impl Transport for TokioTransport {
    fn pipeline(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    fn send_bytes(&mut self, bytes: Bytes) {
        if self.closed {
            return;
        }
        self.outbox.extend_from_slice(&bytes);
    }

    fn read(&mut self) {
        self.pending_reads += 1;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_requests_are_counted() {
        let mut transport = TokioTransport::new(ConnectionContext::new());
        assert!(!transport.take_read_request());
        transport.read();
        transport.read();
        assert!(transport.take_read_request());
        assert!(transport.take_read_request());
        assert!(!transport.take_read_request());
        transport.set_auto_read(true);
        assert!(transport.take_read_request());
    }

    #[test]
    fn test_closed_drops_writes() {
        let mut transport = TokioTransport::new(ConnectionContext::new());
        transport.send_bytes(Bytes::from_static(b"a"));
        transport.close();
        transport.send_bytes(Bytes::from_static(b"b"));
        assert_eq!(&transport.take_outbox()[..], b"a");
        assert!(!transport.is_persistent());
    }
}
