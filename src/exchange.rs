//! 1 回のリクエスト/レスポンスの状態
//!
//! ```rust
//! use http11_exchange::{ConnectionMode, Exchange, MemoryTransport, NoopListener};
//!
//! let mut transport = MemoryTransport::new();
//! let mut exchange = Exchange::bind(&mut transport);
//! exchange.set_uri("/hello").unwrap();
//! exchange.header("Host", "example.com").unwrap();
//! exchange.on_outbound_complete(&mut transport);
//!
//! let sent = transport.take_written();
//! assert!(sent.starts_with(b"GET /hello HTTP/1.1\r\n"));
//!
//! let mut mode = ConnectionMode::Http(exchange);
//! transport.receive(&mut mode, &mut NoopListener, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
//! assert_eq!(mode.exchange().and_then(|e| e.status()), Some(200));
//! ```

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::{Bytes, BytesMut};
use tracing::debug;
use url::Url;

use crate::classify::{Classification, ResponseError, classify};
use crate::codec::{
    ChunkedWriter, GzipDecompressor, InboundEvent, LastContent, OutboundEvent, RequestEncoder,
    ResponseDecoder,
};
use crate::context::{Continuation, ExchangeOptions, USER_AGENT};
use crate::cookie::{Cookie, Cookies};
use crate::error::Error;
use crate::form::{FormBody, FormBuilder, FormError};
use crate::headers::Headers;
use crate::listener::{ExchangeListener, ReceiveError};
use crate::pipeline::{Stage, StageName};
use crate::prefetch::PrefetchBudget;
use crate::redirect::RedirectChain;
use crate::request::{OutboundRequest, Version};
use crate::response::ResponseState;
use crate::transport::Transport;
use crate::websocket;

const READY: u8 = 0;
const HEADERS_SENT: u8 = 1;
const BODY_SENT: u8 = 2;

/// ヘッダーとボディの送信済みフラグ
///
/// それぞれ 1 度だけ遷移し、遷移させた呼び出しだけが true を受け取る。
#[derive(Debug, Default)]
pub struct SendFlags(AtomicU8);

impl SendFlags {
    pub fn mark_sent_headers(&self) -> bool {
        self.transition(READY, HEADERS_SENT)
    }

    pub fn mark_sent_body(&self) -> bool {
        self.transition(HEADERS_SENT, BODY_SENT)
    }

    /// 何も送っていない状態からヘッダーとボディをまとめて送信済みにする
    pub fn mark_sent_header_and_body(&self) -> bool {
        self.transition(READY, BODY_SENT)
    }

    pub fn has_sent_headers(&self) -> bool {
        self.0.load(Ordering::Acquire) != READY
    }

    pub fn has_sent_body(&self) -> bool {
        self.0.load(Ordering::Acquire) == BODY_SENT
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.0
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// エクスチェンジの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    HeadersSent,
    BodySent,
    ResponseHeaderReceived,
    BodyReceiving,
    Complete,
}

/// 1 回のリクエスト/レスポンス
#[derive(Debug)]
pub struct Exchange {
    request: OutboundRequest,
    sent: SendFlags,
    response: OnceLock<ResponseState>,
    started: bool,
    receiving: bool,
    terminated: bool,
    inbound_cancelled: bool,
    /// chunked_transfer() で明示した値 (None はデフォルトの chunked)
    chunked_explicit: Option<bool>,
    /// GET / HEAD で送信完了まで貯めているボディ
    buffered: Option<BytesMut>,
    redirect_chain: RedirectChain,
    secure: bool,
    accept_gzip: bool,
    options: ExchangeOptions,
    prefetch: PrefetchBudget,
}

impl Exchange {
    /// 接続に HTTP コーデックを入れて最初のエクスチェンジを作る
    ///
    /// リダイレクト履歴と gzip の指定は接続のコンテキストから引き継ぐ
    pub fn bind<T: Transport + ?Sized>(transport: &mut T) -> Self {
        let context = transport.context();
        let continuation = Continuation {
            redirect_chain: context.redirect_chain.clone().unwrap_or_default(),
            secure: transport.is_secure(),
            options: ExchangeOptions::default(),
            accept_gzip: context.accept_gzip,
        };
        Self::from_continuation(transport, continuation)
    }

    /// 前のエクスチェンジの引き継ぎ値から次のエクスチェンジを作る
    pub fn from_continuation<T: Transport + ?Sized>(
        transport: &mut T,
        continuation: Continuation,
    ) -> Self {
        let pipeline = transport.pipeline();
        pipeline.add_first(Stage::Decoder(ResponseDecoder::new()));
        pipeline.add_after(StageName::HttpDecoder, Stage::Encoder(RequestEncoder::new()));

        let mut exchange = Self::new(continuation);
        if exchange.accept_gzip {
            transport.pipeline().add_after(
                StageName::HttpDecoder,
                Stage::Decompressor(GzipDecompressor::new()),
            );
            exchange.request.headers.set("Accept-Encoding", "gzip");
        }
        exchange
    }

    fn new(continuation: Continuation) -> Self {
        let mut request = OutboundRequest::new("GET", "/");
        request.headers.set("User-Agent", USER_AGENT);
        request.set_chunked(true);
        Self {
            request,
            sent: SendFlags::default(),
            response: OnceLock::new(),
            started: false,
            receiving: false,
            terminated: false,
            inbound_cancelled: false,
            chunked_explicit: None,
            buffered: None,
            redirect_chain: continuation.redirect_chain,
            secure: continuation.secure,
            accept_gzip: continuation.accept_gzip,
            prefetch: PrefetchBudget::new(continuation.options.prefetch),
            options: continuation.options,
        }
    }

    /// 次のエクスチェンジに渡す値
    pub fn continuation(&self) -> Continuation {
        Continuation {
            redirect_chain: self.redirect_chain.clone(),
            secure: self.secure,
            options: self.options,
            accept_gzip: self.accept_gzip,
        }
    }

    fn ensure_not_sent(&self) -> Result<(), Error> {
        if self.sent.has_sent_headers() {
            return Err(Error::InvalidState("status and headers already sent"));
        }
        Ok(())
    }

    /// ヘッダーを設定 (同名のヘッダーは置き換える)
    pub fn header(&mut self, name: &str, value: &str) -> Result<&mut Self, Error> {
        self.ensure_not_sent()?;
        self.request.headers.set(name, value);
        self.fixed_length_if_content_length(name);
        Ok(self)
    }

    /// ヘッダーを追加
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<&mut Self, Error> {
        self.ensure_not_sent()?;
        self.request.headers.add(name, value);
        self.fixed_length_if_content_length(name);
        Ok(self)
    }

    /// Content-Length を明示したら暗黙の chunked をやめる
    fn fixed_length_if_content_length(&mut self, name: &str) {
        if name.eq_ignore_ascii_case("Content-Length") && self.chunked_explicit.is_none() {
            self.request.headers.remove("Transfer-Encoding");
        }
    }

    /// ヘッダーをすべて置き換える (Host は残す)
    pub fn headers(&mut self, headers: &Headers) -> Result<&mut Self, Error> {
        self.ensure_not_sent()?;
        let host = self.request.headers.get("Host").map(str::to_string);
        self.request.headers.set_all(headers);
        if let Some(host) = host {
            self.request.headers.set("Host", &host);
        }
        Ok(self)
    }

    /// Cookie ヘッダーに追加
    pub fn add_cookie(&mut self, cookie: &Cookie) -> Result<&mut Self, Error> {
        self.ensure_not_sent()?;
        cookie.append_to(&mut self.request.headers);
        Ok(self)
    }

    /// chunked 転送を切り替える
    ///
    /// 送信後は何もしない
    pub fn chunked_transfer(&mut self, chunked: bool) -> &mut Self {
        if self.sent.has_sent_headers() {
            return self;
        }
        self.chunked_explicit = Some(chunked);
        if self.request.is_chunked() != chunked {
            self.request.set_chunked(chunked);
        }
        self
    }

    pub fn keep_alive(&mut self, keep_alive: bool) -> Result<&mut Self, Error> {
        self.ensure_not_sent()?;
        self.request.set_keep_alive(keep_alive);
        Ok(self)
    }

    /// 302 をリダイレクトとして扱う
    pub fn follow_redirect(&mut self) -> &mut Self {
        self.options.follow_redirect = true;
        self
    }

    pub fn fail_on_client_error(&mut self, fail: bool) -> &mut Self {
        self.options.fail_on_client_error = fail;
        self
    }

    pub fn fail_on_server_error(&mut self, fail: bool) -> &mut Self {
        self.options.fail_on_server_error = fail;
        self
    }

    pub fn set_method(&mut self, method: &str) -> Result<&mut Self, Error> {
        self.ensure_not_sent()?;
        self.request.method = method.to_string();
        Ok(self)
    }

    pub fn set_uri(&mut self, uri: &str) -> Result<&mut Self, Error> {
        self.ensure_not_sent()?;
        self.request.uri = uri.to_string();
        Ok(self)
    }

    pub fn set_version(&mut self, version: Version) -> Result<&mut Self, Error> {
        self.ensure_not_sent()?;
        self.request.version = version;
        Ok(self)
    }

    pub fn method(&self) -> &str {
        &self.request.method
    }

    pub fn uri(&self) -> &str {
        &self.request.uri
    }

    pub fn version(&self) -> Version {
        self.request.version
    }

    pub fn request(&self) -> &OutboundRequest {
        &self.request
    }

    pub fn request_headers(&self) -> &Headers {
        &self.request.headers
    }

    pub fn options(&self) -> &ExchangeOptions {
        &self.options
    }

    pub fn is_keep_alive(&self) -> bool {
        self.request.is_keep_alive()
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// 302 を追従するか (履歴が上限を超えていないこと)
    pub fn is_follow_redirect(&self) -> bool {
        self.options.follow_redirect && self.redirect_chain.allows_follow()
    }

    /// これまでにたどった URI のコピー
    pub fn redirected_from(&self) -> Vec<String> {
        self.redirect_chain.as_slice().to_vec()
    }

    pub fn redirect_chain(&self) -> &RedirectChain {
        &self.redirect_chain
    }

    pub fn response(&self) -> Option<&ResponseState> {
        self.response.get()
    }

    pub fn status(&self) -> Option<u16> {
        self.response.get().map(ResponseState::status)
    }

    pub fn response_headers(&self) -> Option<&Headers> {
        self.response.get().map(ResponseState::headers)
    }

    pub fn cookies(&self) -> Option<&Cookies> {
        self.response.get().map(ResponseState::cookies)
    }

    pub fn state(&self) -> ExchangeState {
        if self.terminated {
            ExchangeState::Complete
        } else if self.receiving {
            ExchangeState::BodyReceiving
        } else if self.started {
            ExchangeState::ResponseHeaderReceived
        } else if self.sent.has_sent_body() {
            ExchangeState::BodySent
        } else if self.sent.has_sent_headers() {
            ExchangeState::HeadersSent
        } else {
            ExchangeState::Idle
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn has_sent_headers(&self) -> bool {
        self.sent.has_sent_headers()
    }

    pub fn mark_sent_headers(&self) -> bool {
        self.sent.mark_sent_headers()
    }

    pub fn mark_sent_body(&self) -> bool {
        self.sent.mark_sent_body()
    }

    pub fn mark_sent_header_and_body(&self) -> bool {
        self.sent.mark_sent_header_and_body()
    }

    /// WebSocket ハンドシェイクの URI
    pub fn websocket_uri(&self) -> Result<Url, Error> {
        websocket::websocket_uri(&self.request, self.secure)
    }

    /// ボディの断片を貯める
    ///
    /// GET / HEAD のボディはこちらで受け取り、[`Exchange::on_outbound_complete`] で
    /// 1 つのメッセージにまとめて送る。chunked を明示していなければ Content-Length を付ける。
    pub fn buffer_content(&mut self, data: &[u8]) -> Result<(), Error> {
        self.ensure_not_sent()?;
        self.buffered
            .get_or_insert_with(BytesMut::new)
            .extend_from_slice(data);
        Ok(())
    }

    /// 貯めているボディの長さ
    pub fn buffered_len(&self) -> Option<usize> {
        self.buffered.as_ref().map(BytesMut::len)
    }

    fn send_buffered<T: Transport + ?Sized>(&mut self, transport: &mut T, body: Bytes) {
        if self.chunked_explicit != Some(true) && !self.request.headers.contains("Content-Length")
        {
            self.request.set_chunked(false);
            self.request
                .headers
                .set("Content-Length", &body.len().to_string());
        }
        transport.write_and_flush(OutboundEvent::Full(self.request.clone(), body));
    }

    /// ボディの断片を送る
    ///
    /// 最初の呼び出しでヘッダーも送る
    pub fn send_content<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        data: Bytes,
    ) -> Result<(), Error> {
        if self.sent.mark_sent_headers() {
            transport.write_and_flush(OutboundEvent::Head(self.request.clone()));
        } else if self.sent.has_sent_body() {
            return Err(Error::InvalidState("body already sent"));
        }
        transport.write_and_flush(OutboundEvent::Content(data));
        Ok(())
    }

    /// フォームボディの送信を始める
    ///
    /// コールバックでフォームを組み立て、ヘッダーを送った後の [`FormBody`] を返す。
    /// 断片は [`Exchange::send_form_chunk`] で送る。
    pub fn send_form<T, F>(&mut self, transport: &mut T, build: F) -> Result<FormBody, Error>
    where
        T: Transport + ?Sized,
        F: FnOnce(&mut FormBuilder) -> Result<(), FormError>,
    {
        if !self.sent.mark_sent_headers() {
            return Err(Error::InvalidState("headers have already been sent"));
        }

        let mut builder = FormBuilder::new();
        // 失敗時はビルダーと一緒に一時ファイルも破棄される
        build(&mut builder)?;

        let chunked = if builder.is_multipart() {
            self.request.is_chunked()
        } else {
            self.chunked_explicit == Some(true)
        };
        let body = builder.finalize(&mut self.request)?;
        if chunked {
            self.request.set_chunked(true);
        } else {
            self.request.set_chunked(false);
            self.request
                .headers
                .set("Content-Length", &body.len().to_string());
        }

        transport
            .pipeline()
            .add_handler_first(Stage::ChunkedWriter(ChunkedWriter::new(body.chunk_size())));
        transport.write_and_flush(OutboundEvent::Head(self.request.clone()));
        Ok(body)
    }

    /// フォームボディの次の断片を送り、累積の送信バイト数を返す
    ///
    /// 最後まで送ると終端を書いて `None` を返す
    pub fn send_form_chunk<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        body: &mut FormBody,
    ) -> Result<Option<u64>, Error> {
        match body.next_chunk()? {
            Some(chunk) => {
                transport.write_and_flush(OutboundEvent::Content(chunk));
                Ok(Some(body.progress()))
            }
            None => {
                if self.sent.mark_sent_body() {
                    transport.write_and_flush(OutboundEvent::Last);
                }
                transport.pipeline().remove(StageName::ChunkedWriter);
                Ok(None)
            }
        }
    }

    /// 送信側の完了
    ///
    /// 何も送っていなければ空のリクエストを送り、ボディ途中なら終端を書く。
    pub fn on_outbound_complete<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        if self.inbound_cancelled {
            return;
        }
        if let Some(body) = self.buffered.take() {
            if self.sent.mark_sent_header_and_body() {
                self.send_buffered(transport, body.freeze());
            }
        } else if self.sent.mark_sent_header_and_body() {
            debug!(
                method = %self.request.method,
                uri = %self.request.uri,
                "no body sent before complete, sending zero-length request"
            );
            self.request.headers.remove("Transfer-Encoding");
            self.request.headers.set("Content-Length", "0");
            transport.write_and_flush(OutboundEvent::Full(self.request.clone(), Bytes::new()));
        } else if self.sent.mark_sent_body() {
            transport.write_and_flush(OutboundEvent::Last);
        }
        transport.read();
    }

    /// 送信側の失敗
    pub fn on_outbound_error<T, L>(&mut self, transport: &mut T, listener: &mut L, error: Error)
    where
        T: Transport + ?Sized,
        L: ExchangeListener + ?Sized,
    {
        if transport.is_persistent() && self.response.get().is_none() {
            listener.on_receive_error(ReceiveError::NoResponse(error));
            self.terminate(listener);
            return;
        }
        transport.mark_persistent(false);
        listener.on_receive_error(ReceiveError::Transport(error));
        self.terminate(listener);
    }

    /// 受信イベント
    pub fn on_inbound<T, L>(&mut self, transport: &mut T, listener: &mut L, event: InboundEvent)
    where
        T: Transport + ?Sized,
        L: ExchangeListener + ?Sized,
    {
        match event {
            InboundEvent::Malformed(e) => {
                if self.terminated {
                    return;
                }
                transport.mark_persistent(false);
                listener.on_receive_error(ReceiveError::Decode(e));
                self.terminate(listener);
            }
            InboundEvent::Head(head) => self.on_response(transport, listener, head, None),
            InboundEvent::Full(full) => {
                self.on_response(transport, listener, full.head, Some(full.body))
            }
            InboundEvent::Last(last) => {
                if !self.started {
                    debug!(
                        "received an end delimiter before any response (previously used connection?)"
                    );
                    return;
                }
                if self.terminated || self.inbound_cancelled {
                    return;
                }
                if let LastContent::Data(data) = last {
                    if !data.is_empty() {
                        listener.on_data(data);
                    }
                }
                // 受信完了後は切断を早く検知するため読み続ける
                transport.set_auto_read(true);
                self.terminate(listener);
            }
            InboundEvent::Content(data) => {
                if !self.started {
                    debug!(
                        len = data.len(),
                        "received a chunk before any response (previously used connection?)"
                    );
                    return;
                }
                if self.terminated || self.inbound_cancelled {
                    return;
                }
                self.receiving = true;
                listener.on_data(data);
                self.prefetch.on_delivered();
                self.prefetch_more(transport);
            }
        }
    }

    fn on_response<T, L>(
        &mut self,
        transport: &mut T,
        listener: &mut L,
        head: crate::response::ResponseHead,
        body: Option<Bytes>,
    ) where
        T: Transport + ?Sized,
        L: ExchangeListener + ?Sized,
    {
        if self.started {
            debug!(
                status = head.status_code,
                "cannot handle more than one response, dropping"
            );
            return;
        }
        self.started = true;

        // 相手が Connection: close を返したときも再利用しない
        if !self.is_keep_alive() || !head.is_keep_alive() {
            transport.mark_persistent(false);
        }
        if self.inbound_cancelled {
            return;
        }

        let status = head.status_code;
        // 最初に書いたものだけが残る
        let _ = self.response.set(ResponseState::new(head));
        debug!(
            status,
            auto_read = transport.is_auto_read(),
            "received response"
        );

        let deliver = self.check_response_code(listener);
        if deliver {
            self.prefetch_more(transport);
            if let Some(state) = self.response.get() {
                listener.on_start(state);
            }
        }
        if let Some(body) = body {
            if deliver && !body.is_empty() {
                listener.on_data(body);
            }
            transport.set_auto_read(true);
            self.terminate(listener);
        }
    }

    /// ステータスコードを分類し、そのまま渡してよいなら true を返す
    fn check_response_code<L: ExchangeListener + ?Sized>(&mut self, listener: &mut L) -> bool {
        let Some(state) = self.response.get() else {
            return false;
        };
        let status = state.status();
        let error = || ResponseError::new(&self.request.uri, state.head().clone());
        let outcome = match classify(status, &self.options, self.is_follow_redirect()) {
            Classification::Deliver => return true,
            Classification::ServerError => {
                debug!(status, "received server error, stop reading");
                ReceiveError::ServerError(error())
            }
            Classification::ClientError => {
                debug!(status, "received client error, stop reading");
                ReceiveError::ClientError(error())
            }
            Classification::Redirect => {
                debug!(status, location = ?state.head().location(), "received redirect");
                ReceiveError::Redirect(error())
            }
        };
        listener.on_receive_error(outcome);
        self.terminate(listener);
        false
    }

    fn prefetch_more<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        if self.prefetch.prefetch_more() {
            transport.read();
        }
    }

    /// 下流から `n` 個の断片を要求する
    pub fn request_more<T: Transport + ?Sized>(&mut self, transport: &mut T, n: u64) {
        self.prefetch.request(n);
        if !self.terminated {
            transport.read();
        }
    }

    /// 先読みの状態
    pub fn prefetch(&self) -> &PrefetchBudget {
        &self.prefetch
    }

    /// 受信を打ち切って接続を閉じる
    pub fn cancel_inbound<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        self.inbound_cancelled = true;
        transport.close();
    }

    pub fn is_inbound_cancelled(&self) -> bool {
        self.inbound_cancelled
    }

    fn terminate<L: ExchangeListener + ?Sized>(&mut self, listener: &mut L) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        listener.on_terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::NoopListener;
    use crate::transport::MemoryTransport;

    #[derive(Default)]
    struct Recorder {
        started: usize,
        data: Vec<u8>,
        errors: Vec<ReceiveError>,
        terminated: usize,
    }

    impl ExchangeListener for Recorder {
        fn on_start(&mut self, _response: &ResponseState) {
            self.started += 1;
        }

        fn on_data(&mut self, data: Bytes) {
            self.data.extend_from_slice(&data);
        }

        fn on_receive_error(&mut self, error: ReceiveError) {
            self.errors.push(error);
        }

        fn on_terminate(&mut self) {
            self.terminated += 1;
        }
    }

    fn feed(
        exchange: &mut Exchange,
        transport: &mut MemoryTransport,
        listener: &mut Recorder,
        data: &[u8],
    ) {
        for event in transport.pipeline().decode(data) {
            exchange.on_inbound(transport, listener, event);
        }
    }

    #[test]
    fn test_defaults() {
        let mut transport = MemoryTransport::new();
        let exchange = Exchange::bind(&mut transport);
        assert_eq!(exchange.method(), "GET");
        assert_eq!(exchange.uri(), "/");
        assert_eq!(exchange.request_headers().get("User-Agent"), Some(USER_AGENT));
        assert!(exchange.request().is_chunked());
        assert!(!exchange.is_follow_redirect());
        assert_eq!(exchange.state(), ExchangeState::Idle);
        assert_eq!(
            transport.pipeline().names(),
            vec![StageName::HttpDecoder, StageName::HttpEncoder]
        );
    }

    #[test]
    fn test_mark_sent_headers_once() {
        let mut transport = MemoryTransport::new();
        let exchange = Exchange::bind(&mut transport);
        assert!(exchange.mark_sent_headers());
        assert!(!exchange.mark_sent_headers());
        assert!(!exchange.mark_sent_header_and_body());
        assert!(exchange.mark_sent_body());
        assert!(!exchange.mark_sent_body());
    }

    #[test]
    fn test_mutation_after_send_fails() {
        let mut transport = MemoryTransport::new();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.on_outbound_complete(&mut transport);
        assert!(matches!(
            exchange.header("X-A", "1"),
            Err(Error::InvalidState(_))
        ));
        assert!(exchange.add_cookie(&Cookie::new("a", "1").unwrap()).is_err());
        assert!(exchange.keep_alive(false).is_err());
        // chunked_transfer は送信後は何もしない
        exchange.chunked_transfer(true);
        assert!(!exchange.request().is_chunked());
    }

    #[test]
    fn test_headers_preserve_host() {
        let mut transport = MemoryTransport::new();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.header("Host", "example.com").unwrap();
        let replacement: Headers = [("Accept", "*/*"), ("Host", "evil.example")]
            .into_iter()
            .collect();
        exchange.headers(&replacement).unwrap();
        assert_eq!(exchange.request_headers().get("Host"), Some("example.com"));
        assert_eq!(exchange.request_headers().get("Accept"), Some("*/*"));
        assert_eq!(exchange.request_headers().count("Host"), 1);
    }

    #[test]
    fn test_empty_request_on_complete() {
        let mut transport = MemoryTransport::new();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.on_outbound_complete(&mut transport);
        let sent = String::from_utf8(transport.take_written().to_vec()).unwrap();
        assert!(sent.contains("Content-Length: 0\r\n"));
        assert!(!sent.contains("Transfer-Encoding"));
        assert_eq!(transport.read_requests(), 1);
        assert_eq!(exchange.state(), ExchangeState::BodySent);
    }

    #[test]
    fn test_streamed_body_gets_terminator() {
        let mut transport = MemoryTransport::new();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.set_method("POST").unwrap();
        exchange
            .send_content(&mut transport, Bytes::from_static(b"abc"))
            .unwrap();
        assert_eq!(exchange.state(), ExchangeState::HeadersSent);
        exchange.on_outbound_complete(&mut transport);
        let sent = transport.take_written();
        assert!(sent.ends_with(b"3\r\nabc\r\n0\r\n\r\n"));
    }

    #[test]
    fn test_buffered_get_sets_content_length() {
        let mut transport = MemoryTransport::new();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.buffer_content(b"hel").unwrap();
        exchange.buffer_content(b"lo").unwrap();
        assert_eq!(exchange.buffered_len(), Some(5));
        assert!(transport.take_written().is_empty());
        exchange.on_outbound_complete(&mut transport);
        let sent = String::from_utf8(transport.take_written().to_vec()).unwrap();
        assert!(sent.contains("Content-Length: 5\r\n"));
        assert!(!sent.contains("Transfer-Encoding"));
        assert!(sent.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_full_response_resumes_auto_read() {
        let mut transport = MemoryTransport::new();
        let mut listener = Recorder::default();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.on_outbound_complete(&mut transport);
        assert!(!transport.is_auto_read());

        let full = crate::response::FullResponse {
            head: crate::response::ResponseHead::new(200, "OK"),
            body: Bytes::from_static(b"done"),
        };
        exchange.on_inbound(&mut transport, &mut listener, InboundEvent::Full(full));

        assert_eq!(listener.data, b"done");
        assert_eq!(listener.terminated, 1);
        assert!(transport.is_auto_read());
    }

    #[test]
    fn test_buffer_after_send_fails() {
        let mut transport = MemoryTransport::new();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.on_outbound_complete(&mut transport);
        assert!(exchange.buffer_content(b"late").is_err());
        assert_eq!(exchange.buffered_len(), None);
    }

    #[test]
    fn test_explicit_chunked_get_stays_chunked() {
        let mut transport = MemoryTransport::new();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.chunked_transfer(true).chunked_transfer(true);
        assert_eq!(exchange.request_headers().count("Transfer-Encoding"), 1);
        exchange.buffer_content(b"hi").unwrap();
        exchange.on_outbound_complete(&mut transport);
        let sent = transport.take_written();
        assert!(sent.ends_with(b"2\r\nhi\r\n0\r\n\r\n"));
    }

    #[test]
    fn test_response_delivered() {
        let mut transport = MemoryTransport::new();
        let mut listener = Recorder::default();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.on_outbound_complete(&mut transport);
        feed(
            &mut exchange,
            &mut transport,
            &mut listener,
            b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n",
        );
        assert_eq!(exchange.state(), ExchangeState::BodyReceiving);
        assert_eq!(exchange.cookies().map(|c| c.len()), Some(1));
        feed(&mut exchange, &mut transport, &mut listener, b"0\r\n\r\n");
        assert_eq!(listener.started, 1);
        assert_eq!(listener.data, b"abc");
        assert_eq!(listener.terminated, 1);
        assert!(transport.is_auto_read());
        assert_eq!(exchange.state(), ExchangeState::Complete);
    }

    #[test]
    fn test_second_response_is_dropped() {
        let mut transport = MemoryTransport::new();
        let mut listener = Recorder::default();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.on_inbound(
            &mut transport,
            &mut listener,
            InboundEvent::Head(crate::response::ResponseHead::new(200, "OK")),
        );
        exchange.on_inbound(
            &mut transport,
            &mut listener,
            InboundEvent::Head(crate::response::ResponseHead::new(500, "Oops")),
        );
        assert_eq!(exchange.status(), Some(200));
        assert_eq!(listener.started, 1);
        assert!(listener.errors.is_empty());
    }

    #[test]
    fn test_stale_content_before_response_is_dropped() {
        let mut transport = MemoryTransport::new();
        let mut listener = Recorder::default();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.on_inbound(
            &mut transport,
            &mut listener,
            InboundEvent::Content(Bytes::from_static(b"stale")),
        );
        exchange.on_inbound(
            &mut transport,
            &mut listener,
            InboundEvent::Last(LastContent::Empty),
        );
        assert!(listener.data.is_empty());
        assert_eq!(listener.terminated, 0);
        assert_eq!(exchange.state(), ExchangeState::Idle);
    }

    #[test]
    fn test_server_error_stops_reading() {
        let mut transport = MemoryTransport::new();
        let mut listener = Recorder::default();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.on_outbound_complete(&mut transport);
        let reads = transport.read_requests();
        feed(
            &mut exchange,
            &mut transport,
            &mut listener,
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\n\r\nbusy",
        );
        assert_eq!(transport.read_requests(), reads);
        assert_eq!(listener.started, 0);
        assert!(listener.data.is_empty());
        match &listener.errors[..] {
            [ReceiveError::ServerError(e)] => assert_eq!(e.status(), 503),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(listener.terminated, 1);
    }

    #[test]
    fn test_redirect_302_with_follow() {
        let mut transport = MemoryTransport::new();
        let mut listener = Recorder::default();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.follow_redirect();
        exchange.set_uri("/old").unwrap();
        exchange.on_outbound_complete(&mut transport);
        feed(
            &mut exchange,
            &mut transport,
            &mut listener,
            b"HTTP/1.1 302 Found\r\nLocation: /new\r\nContent-Length: 0\r\n\r\n",
        );
        match &listener.errors[..] {
            [ReceiveError::Redirect(e)] => {
                assert_eq!(e.uri, "/old");
                assert_eq!(e.location(), Some("/new"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(transport.is_persistent());
    }

    #[test]
    fn test_non_keep_alive_request_marks_connection() {
        let mut transport = MemoryTransport::new();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.keep_alive(false).unwrap();
        exchange.on_outbound_complete(&mut transport);
        exchange.on_inbound(
            &mut transport,
            &mut NoopListener,
            InboundEvent::Head(crate::response::ResponseHead::new(200, "OK")),
        );
        assert!(!transport.is_persistent());
    }

    #[test]
    fn test_outbound_error_before_response() {
        let mut transport = MemoryTransport::new();
        let mut listener = Recorder::default();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.on_outbound_error(
            &mut transport,
            &mut listener,
            Error::Io(std::io::Error::other("broken pipe")),
        );
        assert!(matches!(&listener.errors[..], [ReceiveError::NoResponse(_)]));
        assert!(transport.is_persistent());
        assert_eq!(listener.terminated, 1);
    }

    #[test]
    fn test_outbound_error_after_response() {
        let mut transport = MemoryTransport::new();
        let mut listener = Recorder::default();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.on_inbound(
            &mut transport,
            &mut listener,
            InboundEvent::Head(crate::response::ResponseHead::new(200, "OK")),
        );
        exchange.on_outbound_error(
            &mut transport,
            &mut listener,
            Error::Io(std::io::Error::other("broken pipe")),
        );
        assert!(matches!(&listener.errors[..], [ReceiveError::Transport(_)]));
        assert!(!transport.is_persistent());
    }

    #[test]
    fn test_malformed_status_line() {
        let mut transport = MemoryTransport::new();
        let mut listener = Recorder::default();
        let mut exchange = Exchange::bind(&mut transport);
        feed(&mut exchange, &mut transport, &mut listener, b"garbage\r\n");
        assert!(matches!(&listener.errors[..], [ReceiveError::Decode(_)]));
        assert!(!transport.is_persistent());
    }

    #[test]
    fn test_accept_gzip_installs_decompressor() {
        let mut transport = MemoryTransport::with_context(
            crate::context::ConnectionContext::new().with_accept_gzip(true),
        );
        let exchange = Exchange::bind(&mut transport);
        assert_eq!(exchange.request_headers().get("Accept-Encoding"), Some("gzip"));
        assert_eq!(
            transport.pipeline().names(),
            vec![
                StageName::HttpDecoder,
                StageName::HttpDecompressor,
                StageName::HttpEncoder
            ]
        );
    }

    #[test]
    fn test_continuation_carries_chain() {
        let mut transport = MemoryTransport::new();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.follow_redirect().fail_on_client_error(false);
        let next = Exchange::from_continuation(
            &mut transport,
            exchange.continuation().with_redirect("http://example.com/a"),
        );
        assert_eq!(next.redirected_from(), vec!["http://example.com/a".to_string()]);
        assert!(next.is_follow_redirect());
        assert!(!next.options().fail_on_client_error);
        assert_eq!(next.state(), ExchangeState::Idle);
    }

    #[test]
    fn test_cancel_inbound_closes() {
        let mut transport = MemoryTransport::new();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.cancel_inbound(&mut transport);
        assert!(transport.is_closed());
        exchange.on_outbound_complete(&mut transport);
        assert!(transport.take_written().is_empty());
    }
}
