//! 接続の現在のモード
//!
//! 接続は HTTP のエクスチェンジか WebSocket のハンドラーのどちらか一方を持つ。
//! アップグレードはこの値をその場で置き換える。

use bytes::Bytes;
use tracing::error;

use crate::codec::{Aggregator, DEFAULT_MAX_CONTENT_LENGTH, InboundEvent, OutboundEvent};
use crate::error::Error;
use crate::exchange::Exchange;
use crate::listener::ExchangeListener;
use crate::pipeline::Stage;
use crate::transport::Transport;
use crate::websocket::{HandshakeSignal, UpgradeError, WebSocketExchange};

#[derive(Debug)]
pub enum ConnectionMode {
    Http(Exchange),
    WebSocket(WebSocketExchange),
}

impl ConnectionMode {
    pub fn is_websocket(&self) -> bool {
        matches!(self, ConnectionMode::WebSocket(_))
    }

    pub fn exchange(&self) -> Option<&Exchange> {
        match self {
            ConnectionMode::Http(exchange) => Some(exchange),
            ConnectionMode::WebSocket(_) => None,
        }
    }

    pub fn exchange_mut(&mut self) -> Option<&mut Exchange> {
        match self {
            ConnectionMode::Http(exchange) => Some(exchange),
            ConnectionMode::WebSocket(_) => None,
        }
    }

    pub fn websocket(&self) -> Option<&WebSocketExchange> {
        match self {
            ConnectionMode::WebSocket(ws) => Some(ws),
            ConnectionMode::Http(_) => None,
        }
    }

    pub fn websocket_mut(&mut self) -> Option<&mut WebSocketExchange> {
        match self {
            ConnectionMode::WebSocket(ws) => Some(ws),
            ConnectionMode::Http(_) => None,
        }
    }

    /// WebSocket にアップグレードしてハンドシェイクリクエストを送る
    ///
    /// すでに WebSocket ならそのハンドシェイクの通知を返す。
    /// ヘッダー送信後は失敗し、パイプラインは変更しない。
    pub fn upgrade<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        protocols: &[&str],
    ) -> Result<HandshakeSignal, Error> {
        let exchange = match self {
            ConnectionMode::WebSocket(ws) => return Ok(ws.signal()),
            ConnectionMode::Http(exchange) => exchange,
        };

        if exchange.has_sent_headers() {
            return Err(headers_already_sent(exchange));
        }
        // URI の組み立てに失敗したときは送信フラグを消費しない
        let uri = exchange.websocket_uri()?;
        let ws = WebSocketExchange::new(uri, protocols, exchange.request())?;
        if !exchange.mark_sent_headers() {
            return Err(headers_already_sent(exchange));
        }

        transport
            .pipeline()
            .add_handler_first(Stage::Aggregator(Aggregator::new(DEFAULT_MAX_CONTENT_LENGTH)));
        let request = ws.handshake_request().clone();
        let signal = ws.signal();
        *self = ConnectionMode::WebSocket(ws);

        transport.write_and_flush(OutboundEvent::Full(request, Bytes::new()));
        transport.read();
        Ok(signal)
    }

    pub fn on_inbound<T, L>(&mut self, transport: &mut T, listener: &mut L, event: InboundEvent)
    where
        T: Transport + ?Sized,
        L: ExchangeListener + ?Sized,
    {
        match self {
            ConnectionMode::Http(exchange) => exchange.on_inbound(transport, listener, event),
            ConnectionMode::WebSocket(ws) => ws.on_inbound(transport, event),
        }
    }

    /// WebSocket では何もしない
    pub fn on_outbound_complete<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        if let ConnectionMode::Http(exchange) = self {
            exchange.on_outbound_complete(transport);
        }
    }

    pub fn on_outbound_error<T, L>(&mut self, transport: &mut T, listener: &mut L, err: Error)
    where
        T: Transport + ?Sized,
        L: ExchangeListener + ?Sized,
    {
        match self {
            ConnectionMode::Http(exchange) => exchange.on_outbound_error(transport, listener, err),
            ConnectionMode::WebSocket(ws) => {
                ws.signal()
                    .fire(Err(UpgradeError::HandshakeFailed(err.to_string())));
                transport.close();
            }
        }
    }
}

fn headers_already_sent(exchange: &Exchange) -> Error {
    error!(
        method = %exchange.method(),
        uri = %exchange.uri(),
        "cannot enable websocket, status and headers have already been sent"
    );
    Error::Upgrade(UpgradeError::HeadersAlreadySent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::NoopListener;
    use crate::pipeline::StageName;
    use crate::transport::MemoryTransport;
    use crate::websocket::compute_accept_key;

    fn http_mode(transport: &mut MemoryTransport) -> ConnectionMode {
        let mut exchange = Exchange::bind(transport);
        exchange.set_uri("/socket").unwrap();
        exchange.header("Host", "example.com").unwrap();
        ConnectionMode::Http(exchange)
    }

    #[test]
    fn test_upgrade_sends_handshake() {
        let mut transport = MemoryTransport::new();
        let mut mode = http_mode(&mut transport);
        let signal = mode.upgrade(&mut transport, &["chat"]).unwrap();
        assert!(mode.is_websocket());
        assert!(!signal.is_complete());
        assert_eq!(
            transport.pipeline().names(),
            vec![
                StageName::HttpDecoder,
                StageName::HttpEncoder,
                StageName::HttpAggregator
            ]
        );

        let sent = String::from_utf8(transport.take_written().to_vec()).unwrap();
        assert!(sent.starts_with("GET /socket HTTP/1.1\r\n"));
        assert!(sent.contains("Upgrade: websocket\r\n"));
        assert!(sent.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(!sent.contains("Transfer-Encoding"));
        assert_eq!(transport.read_requests(), 1);

        // 完了後の送信完了通知は無視される
        mode.on_outbound_complete(&mut transport);
        assert!(transport.take_written().is_empty());
    }

    #[test]
    fn test_upgrade_completes_with_leftover() {
        let mut transport = MemoryTransport::new();
        let mut mode = http_mode(&mut transport);
        let signal = mode.upgrade(&mut transport, &[]).unwrap();
        let key = mode.websocket().unwrap().key().to_string();

        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            compute_accept_key(&key)
        )
        .into_bytes();
        response.extend_from_slice(b"\x81\x02hi");
        transport.receive(&mut mode, &mut NoopListener, &response);

        assert_eq!(signal.result(), Some(&Ok(None)));
        assert!(transport.pipeline().names().is_empty());
        let ws = mode.websocket_mut().unwrap();
        assert!(ws.is_upgraded());
        assert_eq!(&ws.take_leftover()[..], b"\x81\x02hi");
    }

    #[test]
    fn test_upgrade_twice_returns_same_signal() {
        let mut transport = MemoryTransport::new();
        let mut mode = http_mode(&mut transport);
        let first = mode.upgrade(&mut transport, &[]).unwrap();
        transport.take_written();
        let second = mode.upgrade(&mut transport, &[]).unwrap();
        assert!(transport.take_written().is_empty());
        first.fire(Ok(None));
        assert!(second.is_complete());
    }

    #[test]
    fn test_upgrade_after_send_fails() {
        let mut transport = MemoryTransport::new();
        let mut mode = http_mode(&mut transport);
        mode.on_outbound_complete(&mut transport);
        let names = transport.pipeline().names();

        let result = mode.upgrade(&mut transport, &[]);
        assert!(matches!(
            result,
            Err(Error::Upgrade(UpgradeError::HeadersAlreadySent))
        ));
        assert!(!mode.is_websocket());
        assert_eq!(transport.pipeline().names(), names);
    }

    #[test]
    fn test_upgrade_after_send_without_host_reports_state() {
        let mut transport = MemoryTransport::new();
        let mut mode = ConnectionMode::Http(Exchange::bind(&mut transport));
        mode.on_outbound_complete(&mut transport);

        let result = mode.upgrade(&mut transport, &[]);
        assert!(matches!(
            result,
            Err(Error::Upgrade(UpgradeError::HeadersAlreadySent))
        ));
        assert!(!mode.is_websocket());
    }

    #[test]
    fn test_upgrade_without_host_fails() {
        let mut transport = MemoryTransport::new();
        let mut mode = ConnectionMode::Http(Exchange::bind(&mut transport));
        assert!(matches!(
            mode.upgrade(&mut transport, &[]),
            Err(Error::UriSynthesis(_))
        ));
        // URI を組み立てられなければヘッダーは送信済みにならない
        assert!(!mode.exchange().unwrap().has_sent_headers());
    }

    #[test]
    fn test_rejected_handshake_closes() {
        let mut transport = MemoryTransport::new();
        let mut mode = http_mode(&mut transport);
        let signal = mode.upgrade(&mut transport, &[]).unwrap();
        transport.receive(
            &mut mode,
            &mut NoopListener,
            b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n",
        );
        assert_eq!(
            signal.result(),
            Some(&Err(UpgradeError::NotSwitchingProtocols(403)))
        );
        assert!(transport.is_closed());
    }
}
