//! HTTP 接続 (Keep-Alive 対応)
//!
//! 1 本の TCP / TLS 接続の上でエクスチェンジを順に実行する。
//! エクスチェンジが要求した読み込みだけをソケットから行う。
//!
//! ```ignore
//! use tokio_http11_exchange::Connection;
//!
//! let mut conn = Connection::connect("http://example.com", None, timeout).await?;
//! conn.exchange()?.set_uri("/api")?;
//! conn.finish_request().await?;
//! let status = conn.response().await?.status();
//! let body = conn.body().await?;
//!
//! // 同じ接続で次のリクエスト
//! conn.next_exchange()?.set_uri("/next")?;
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http11_exchange::{
    ConnectionContext, ConnectionMode, Continuation, Exchange, ExchangeListener, ExchangeState,
    FormBody, FormBuilder, FormError, ReceiveError, ResponseState, Transport,
};
use rustls::ClientConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

use crate::client::parse_url;
use crate::error::{Error, Result};
use crate::io::Io;
use crate::transport::TokioTransport;
use crate::websocket::{WebSocketInbound, WebSocketOutbound, WebSocketSession};

const READ_BUFFER_SIZE: usize = 8192;

/// エクスチェンジからの通知をためておく
#[derive(Debug, Default)]
struct Inbox {
    started: bool,
    chunks: VecDeque<Bytes>,
    error: Option<ReceiveError>,
    terminated: bool,
}

impl ExchangeListener for Inbox {
    fn on_start(&mut self, _response: &ResponseState) {
        self.started = true;
    }

    fn on_data(&mut self, data: Bytes) {
        self.chunks.push_back(data);
    }

    fn on_receive_error(&mut self, error: ReceiveError) {
        self.error = Some(error);
    }

    fn on_terminate(&mut self) {
        self.terminated = true;
    }
}

fn http(mode: &mut ConnectionMode) -> Result<&mut Exchange> {
    mode.exchange_mut().ok_or(Error::Http(http11_exchange::Error::InvalidState(
        "connection has been upgraded to websocket",
    )))
}

/// HTTP 接続
pub struct Connection {
    io: Io,
    transport: TokioTransport,
    mode: ConnectionMode,
    inbox: Inbox,
    read_timeout: Duration,
    host: String,
    port: u16,
    eof: bool,
    buf: Vec<u8>,
}

impl Connection {
    /// URL から接続を確立
    ///
    /// URL のスキームに応じて HTTP または HTTPS で接続する。
    pub async fn connect(
        url: &str,
        tls_config: Option<Arc<ClientConfig>>,
        timeout: Duration,
    ) -> Result<Self> {
        let (scheme, host, port, _path) = parse_url(url)?;
        Self::connect_to(
            &host,
            port,
            scheme == "https",
            tls_config,
            timeout,
            ConnectionContext::new(),
        )
        .await
    }

    /// ホストとポートを指定して接続を確立
    ///
    /// リダイレクト履歴や gzip の指定は `context` で渡す
    pub async fn connect_to(
        host: &str,
        port: u16,
        use_tls: bool,
        tls_config: Option<Arc<ClientConfig>>,
        timeout: Duration,
        context: ConnectionContext,
    ) -> Result<Self> {
        let io = Io::connect(host, port, use_tls, tls_config, timeout).await?;
        Ok(Self::from_io(io, host, port, context))
    }

    /// 確立済みのストリームから作る
    pub fn from_io(io: Io, host: &str, port: u16, context: ConnectionContext) -> Self {
        let mut transport = TokioTransport::new(context.with_secure(io.is_tls()));
        let exchange = Exchange::bind(&mut transport);
        let mut connection = Self {
            io,
            transport,
            mode: ConnectionMode::Http(exchange),
            inbox: Inbox::default(),
            read_timeout: Duration::from_secs(60),
            host: host.to_string(),
            port,
            eof: false,
            buf: vec![0u8; READ_BUFFER_SIZE],
        };
        connection.install_host();
        connection
    }

    /// 新しいエクスチェンジに Host ヘッダーを付ける
    fn install_host(&mut self) {
        let host = self.host_header_value();
        if let Some(exchange) = self.mode.exchange_mut() {
            // まだ何も送っていないので失敗しない
            let _ = exchange.header("Host", &host);
        }
    }

    /// 読み取りタイムアウトを設定
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    /// TLS 接続かどうかを返す
    pub fn is_tls(&self) -> bool {
        self.io.is_tls()
    }

    /// 次のエクスチェンジに再利用できるか
    pub fn is_persistent(&self) -> bool {
        self.transport.is_persistent() && !self.transport.is_closed() && !self.eof
    }

    /// Host ヘッダー用の値を取得
    pub fn host_header_value(&self) -> String {
        if self.port == 80 || self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// 現在のエクスチェンジ
    pub fn exchange(&mut self) -> Result<&mut Exchange> {
        http(&mut self.mode)
    }

    pub fn state(&self) -> Option<ExchangeState> {
        self.mode.exchange().map(Exchange::state)
    }

    /// 終わったエクスチェンジの後に新しいエクスチェンジを始める
    pub fn next_exchange(&mut self) -> Result<&mut Exchange> {
        self.ensure_reusable()?;
        self.inbox = Inbox::default();
        self.mode = ConnectionMode::Http(Exchange::bind(&mut self.transport));
        self.install_host();
        http(&mut self.mode)
    }

    /// 引き継ぎ値から次のエクスチェンジを始める
    pub fn continue_exchange(&mut self, continuation: Continuation) -> Result<&mut Exchange> {
        self.ensure_reusable()?;
        self.inbox = Inbox::default();
        self.mode =
            ConnectionMode::Http(Exchange::from_continuation(&mut self.transport, continuation));
        self.install_host();
        http(&mut self.mode)
    }

    fn ensure_reusable(&self) -> Result<()> {
        let terminated = self.mode.exchange().is_some_and(Exchange::is_terminated);
        if !terminated {
            return Err(Error::Http(http11_exchange::Error::InvalidState(
                "previous exchange has not completed",
            )));
        }
        if !self.is_persistent() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// ボディを送る
    ///
    /// GET / HEAD は [`Connection::finish_request`] まで貯めて 1 回で送り、
    /// それ以外は断片として送る
    pub async fn send(&mut self, data: Bytes) -> Result<()> {
        let exchange = http(&mut self.mode)?;
        if exchange.request().is_buffered_method() {
            exchange.buffer_content(&data)?;
        } else {
            exchange.send_content(&mut self.transport, data)?;
        }
        self.flush().await
    }

    /// リクエストの送信を終える
    ///
    /// 何も送っていなければ空のリクエストを、ボディ途中なら終端を送る
    pub async fn finish_request(&mut self) -> Result<()> {
        self.mode.on_outbound_complete(&mut self.transport);
        self.flush().await
    }

    /// フォームボディの送信を始める
    pub async fn send_form<F>(&mut self, build: F) -> Result<FormUpload<'_>>
    where
        F: FnOnce(&mut FormBuilder) -> std::result::Result<(), FormError>,
    {
        let body = http(&mut self.mode)?.send_form(&mut self.transport, build)?;
        self.flush().await?;
        Ok(FormUpload::new(self, body))
    }

    /// レスポンスのステータスラインとヘッダーを待つ
    pub async fn response(&mut self) -> Result<&ResponseState> {
        loop {
            if let Some(e) = self.inbox.error.take() {
                return Err(Error::Receive(e));
            }
            if self.inbox.started {
                break;
            }
            if self.inbox.terminated {
                return Err(Error::ConnectionClosed);
            }
            self.read_once().await?;
        }
        self.mode
            .exchange()
            .and_then(Exchange::response)
            .ok_or(Error::ConnectionClosed)
    }

    /// ボディの次の断片
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(chunk) = self.inbox.chunks.pop_front() {
                return Ok(Some(chunk));
            }
            if let Some(e) = self.inbox.error.take() {
                return Err(Error::Receive(e));
            }
            if self.inbox.terminated {
                return Ok(None);
            }
            if !self.inbox.started {
                self.response().await?;
                continue;
            }
            self.read_once().await?;
        }
    }

    /// ボディを最後まで読む
    pub async fn body(&mut self) -> Result<Bytes> {
        let mut body = Vec::new();
        while let Some(chunk) = self.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(body))
    }

    /// 受信を打ち切って接続を閉じる
    pub async fn cancel(&mut self) -> Result<()> {
        if let Some(exchange) = self.mode.exchange_mut() {
            exchange.cancel_inbound(&mut self.transport);
        }
        self.io.shutdown().await?;
        Ok(())
    }

    /// WebSocket にアップグレードする
    ///
    /// 返したセッションは自動では閉じない
    pub async fn upgrade_websocket(mut self, protocols: &[&str]) -> Result<WebSocketSession> {
        let signal = self.mode.upgrade(&mut self.transport, protocols)?;
        self.flush().await?;
        while !signal.is_complete() {
            self.read_once().await?;
        }
        let protocol = match signal.result() {
            Some(Ok(protocol)) => protocol.clone(),
            Some(Err(e)) => return Err(Error::Http(http11_exchange::Error::Upgrade(e.clone()))),
            None => return Err(Error::ConnectionClosed),
        };
        let leftover = self
            .mode
            .websocket_mut()
            .map(|ws| ws.take_leftover())
            .unwrap_or_default();
        Ok(WebSocketSession::from_upgraded(self.io, leftover, protocol).await)
    }

    /// WebSocket にアップグレードしてハンドラーを実行する
    ///
    /// ハンドラーが終わるとセッションを閉じる
    pub async fn receive_websocket<F, Fut>(self, protocols: &[&str], handler: F) -> Result<()>
    where
        F: FnOnce(WebSocketInbound, WebSocketOutbound) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let session = self.upgrade_websocket(protocols).await?;
        let (inbound, outbound) = session.split();
        let result = handler(inbound, outbound.clone()).await;
        if let Err(e) = outbound.close().await {
            debug!(error = %e, "websocket already closed");
        }
        result
    }

    async fn flush(&mut self) -> Result<()> {
        let out = self.transport.take_outbox();
        if out.is_empty() {
            return Ok(());
        }
        let written = match self.io.write_all(&out).await {
            Ok(()) => self.io.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let reported = std::io::Error::new(e.kind(), e.to_string());
            self.mode.on_outbound_error(
                &mut self.transport,
                &mut self.inbox,
                http11_exchange::Error::Io(reported),
            );
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// 1 回だけソケットから読み、イベントを現在のモードに渡す
    async fn read_once(&mut self) -> Result<()> {
        if self.eof || self.transport.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if !self.transport.take_read_request() {
            // 待っている側がいるので下流の要求として 1 つ足す
            if let Some(exchange) = self.mode.exchange_mut() {
                exchange.request_more(&mut self.transport, 1);
            }
            self.transport.take_read_request();
        }

        let n = tokio::time::timeout(self.read_timeout, self.io.read(&mut self.buf)).await??;
        let events = if n == 0 {
            debug!("peer closed the connection");
            self.eof = true;
            self.transport.mark_persistent(false);
            self.transport.pipeline().decode_eof()
        } else {
            self.transport.pipeline().decode(&self.buf[..n])
        };
        for event in events {
            self.mode
                .on_inbound(&mut self.transport, &mut self.inbox, event);
        }
        Ok(())
    }
}

/// 送信中のフォーム
///
/// 進捗は最新の値だけを保持する。途中で破棄すると一時ファイルは後始末される。
pub struct FormUpload<'a> {
    connection: &'a mut Connection,
    body: FormBody,
    progress: watch::Sender<u64>,
}

impl<'a> FormUpload<'a> {
    fn new(connection: &'a mut Connection, body: FormBody) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            connection,
            body,
            progress,
        }
    }

    /// ボディ全体の長さ
    pub fn total(&self) -> u64 {
        self.body.len()
    }

    /// 送信済みバイト数の通知
    pub fn progress(&self) -> watch::Receiver<u64> {
        self.progress.subscribe()
    }

    /// 最後まで送り、送ったバイト数を返す
    pub async fn run(mut self) -> Result<u64> {
        loop {
            let exchange = http(&mut self.connection.mode)?;
            let step = exchange.send_form_chunk(&mut self.connection.transport, &mut self.body)?;
            self.connection.flush().await?;
            match step {
                Some(sent) => {
                    self.progress.send_replace(sent);
                }
                None => break,
            }
        }
        let sent = self.body.progress();
        self.progress.send_replace(sent);
        self.connection.finish_request().await?;
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    async fn serve_once(response: &'static [u8]) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            socket.write_all(response).await.unwrap();
            request
        });
        (port, handle)
    }

    /// ヘッダーと Content-Length 分のボディを読む
    async fn read_request(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&request[..end]).to_string();
                let length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("Content-Length: "))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    return request;
                }
            }
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return request;
            }
            request.extend_from_slice(&buf[..n]);
        }
    }

    async fn connect(port: u16) -> Connection {
        Connection::connect(
            &format!("http://127.0.0.1:{}", port),
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_empty_request() {
        let (port, server) =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
        let mut conn = connect(port).await;
        conn.exchange().unwrap().set_uri("/hello").unwrap();
        conn.finish_request().await.unwrap();

        assert_eq!(conn.response().await.unwrap().status(), 200);
        assert_eq!(&conn.body().await.unwrap()[..], b"hello");
        assert_eq!(conn.state(), Some(ExchangeState::Complete));

        let request = String::from_utf8(server.await.unwrap()).unwrap();
        assert!(request.starts_with("GET /hello HTTP/1.1\r\n"));
        assert!(request.contains("Content-Length: 0\r\n"));
        assert!(request.contains(&format!("Host: 127.0.0.1:{}\r\n", port)));
    }

    #[tokio::test]
    async fn test_get_body_in_pieces_is_buffered() {
        let (port, server) = serve_once(b"HTTP/1.1 204 No Content\r\n\r\n").await;
        let mut conn = connect(port).await;
        conn.send(Bytes::from_static(b"ab")).await.unwrap();
        conn.send(Bytes::from_static(b"cd")).await.unwrap();
        conn.send(Bytes::from_static(b"e")).await.unwrap();
        conn.finish_request().await.unwrap();
        assert_eq!(conn.response().await.unwrap().status(), 204);

        let request = String::from_utf8(server.await.unwrap()).unwrap();
        assert!(request.starts_with("GET / HTTP/1.1\r\n"));
        assert!(request.contains("Content-Length: 5\r\n"));
        assert!(!request.contains("Transfer-Encoding"));
        assert!(request.ends_with("\r\n\r\nabcde"));
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let (port, _server) =
            serve_once(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n").await;
        let mut conn = connect(port).await;
        conn.finish_request().await.unwrap();
        match conn.response().await {
            Err(Error::Receive(ReceiveError::ServerError(e))) => assert_eq!(e.status(), 503),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("expected server error"),
        }
    }

    #[tokio::test]
    async fn test_chunked_body() {
        let (port, _server) = serve_once(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
        )
        .await;
        let mut conn = connect(port).await;
        conn.finish_request().await.unwrap();
        assert_eq!(&conn.body().await.unwrap()[..], b"abcde");
        assert!(conn.is_persistent());
    }

    #[tokio::test]
    async fn test_next_exchange_requires_completion() {
        let (port, _server) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let mut conn = connect(port).await;
        assert!(conn.next_exchange().is_err());
        conn.finish_request().await.unwrap();
        conn.body().await.unwrap();
        let next = conn.next_exchange().unwrap();
        assert_eq!(next.state(), ExchangeState::Idle);
    }

    #[tokio::test]
    async fn test_form_upload_progress() {
        let (port, server) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let mut conn = connect(port).await;
        conn.exchange().unwrap().set_method("POST").unwrap();
        let upload = conn
            .send_form(|form| {
                form.attr("name", "value").attr("q", "a b");
                Ok(())
            })
            .await
            .unwrap();
        let total = upload.total();
        let progress = upload.progress();
        let sent = upload.run().await.unwrap();
        assert_eq!(sent, total);
        assert_eq!(*progress.borrow(), total);
        assert_eq!(conn.response().await.unwrap().status(), 200);

        let request = String::from_utf8(server.await.unwrap()).unwrap();
        assert!(request.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
        assert!(request.contains(&format!("Content-Length: {}\r\n", total)));
    }

    #[tokio::test]
    async fn test_receive_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            ws.send(Message::text("hi".to_string())).await.unwrap();
            let received = ws.next().await.unwrap().unwrap();
            received.into_text().unwrap().as_str().to_string()
        });

        let mut conn = connect(port).await;
        conn.exchange().unwrap().set_uri("/ws").unwrap();
        conn.receive_websocket(&[], |mut inbound, outbound| async move {
            let first = inbound.receive().await.ok_or(Error::ConnectionClosed)??;
            assert_eq!(first.into_text().unwrap().as_str(), "hi");
            outbound.send_text("hello").await?;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(server.await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_upgrade_rejected() {
        let (port, _server) =
            serve_once(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n").await;
        let mut conn = connect(port).await;
        conn.exchange().unwrap().set_uri("/ws").unwrap();
        match conn.upgrade_websocket(&[]).await {
            Err(Error::Http(http11_exchange::Error::Upgrade(e))) => {
                assert_eq!(e, http11_exchange::UpgradeError::NotSwitchingProtocols(400))
            }
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("expected failure"),
        }
    }
}
