//! # http11_exchange
//!
//! HTTP/1.1 クライアントのエクスチェンジエンジン (Sans I/O)
//!
//! ## 特徴
//!
//! - **Sans I/O**: ソケットは持たず、[`Transport`] を通してバイト列と読み込み要求をやり取りする
//! - **コーデックパイプライン**: デコーダー、エンコーダー、gzip 展開、集約、chunked 分割を名前付きステージとして並べる
//! - **ステータス分類**: 4xx / 5xx の失敗通知と 301 / 302 のリダイレクト判定 (最大 50 回)
//! - **先読み制御**: ウィンドウ (デフォルト 16) と下流の要求で読み込みを抑える
//! - **WebSocket**: 同じ接続をその場でアップグレードする
//! - **フォーム**: application/x-www-form-urlencoded と multipart/form-data
//!
//! ## 使い方
//!
//! ```rust
//! use http11_exchange::{
//!     ConnectionMode, Exchange, ExchangeListener, MemoryTransport, ResponseState,
//! };
//! use bytes::Bytes;
//!
//! #[derive(Default)]
//! struct Collect {
//!     status: Option<u16>,
//!     body: Vec<u8>,
//!     done: bool,
//! }
//!
//! impl ExchangeListener for Collect {
//!     fn on_start(&mut self, response: &ResponseState) {
//!         self.status = Some(response.status());
//!     }
//!     fn on_data(&mut self, data: Bytes) {
//!         self.body.extend_from_slice(&data);
//!     }
//!     fn on_terminate(&mut self) {
//!         self.done = true;
//!     }
//! }
//!
//! let mut transport = MemoryTransport::new();
//! let mut exchange = Exchange::bind(&mut transport);
//! exchange.header("Host", "example.com").unwrap();
//! exchange.on_outbound_complete(&mut transport);
//! // transport.take_written() を送信...
//!
//! let mut mode = ConnectionMode::Http(exchange);
//! let mut listener = Collect::default();
//! transport.receive(
//!     &mut mode,
//!     &mut listener,
//!     b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
//! );
//! assert_eq!(listener.status, Some(200));
//! assert_eq!(listener.body, b"hello");
//! assert!(listener.done);
//! ```

pub mod classify;
pub mod codec;
pub mod context;
pub mod cookie;
mod error;
pub mod exchange;
pub mod form;
mod headers;
mod limits;
pub mod listener;
pub mod mode;
pub mod pipeline;
pub mod prefetch;
pub mod redirect;
mod request;
mod response;
pub mod transport;
pub mod websocket;

pub use classify::{Classification, ResponseError};
pub use codec::{InboundEvent, LastContent, OutboundEvent};
pub use context::{ConnectionContext, Continuation, ExchangeOptions, USER_AGENT};
pub use cookie::{Cookie, Cookies, SetCookie};
pub use error::{DecodeError, Error};
pub use exchange::{Exchange, ExchangeState, SendFlags};
pub use form::{FormBody, FormBuilder, FormError, UrlEncoding};
pub use headers::Headers;
pub use limits::DecoderLimits;
pub use listener::{ExchangeListener, NoopListener, ReceiveError};
pub use mode::ConnectionMode;
pub use pipeline::{Pipeline, Stage, StageName};
pub use prefetch::{DEFAULT_PREFETCH, PrefetchBudget};
pub use redirect::{MAX_REDIRECTS, RedirectChain};
pub use request::{OutboundRequest, Version};
pub use response::{FullResponse, ResponseHead, ResponseState};
pub use transport::{MemoryTransport, Transport};
pub use websocket::{HandshakeSignal, UpgradeError, WebSocketExchange};
