//! tokio_http11_exchange - Tokio driver for http11_exchange
//!
//! tokio と tokio-rustls の上で http11_exchange のエクスチェンジを動かす非同期 HTTP/1.1 クライアント。
//!
//! ## 特徴
//!
//! - **http11_exchange ベース**: Sans I/O のエクスチェンジエンジンをソケットにつなぐ
//! - **非同期 I/O**: tokio による完全非同期対応
//! - **TLS 対応**: tokio-rustls による HTTPS 対応
//! - **Keep-Alive**: 1 本の接続で複数のエクスチェンジを順に実行
//! - **WebSocket**: 同じ接続をアップグレードして tokio-tungstenite に渡す
//! - **フォーム送信**: 進捗通知つきの urlencoded / multipart 送信
//!
//! ## クライアント
//!
//! ```ignore
//! use tokio_http11_exchange::Client;
//!
//! let client = Client::new().follow_redirect(true);
//! let response = client.get("http://example.com/path").await?;
//! println!("{} {:?}", response.status_code, response.body);
//! ```
//!
//! ## WebSocket
//!
//! ```ignore
//! use tokio_http11_exchange::Connection;
//!
//! let mut conn = Connection::connect("http://example.com", None, timeout).await?;
//! conn.exchange()?.set_uri("/ws")?;
//! conn.receive_websocket(&["chat"], |mut inbound, outbound| async move {
//!     outbound.send_text("hello").await?;
//!     while let Some(message) = inbound.receive().await {
//!         println!("{:?}", message?);
//!     }
//!     Ok(())
//! })
//! .await?;
//! ```

pub mod client;
pub mod connection;
pub mod error;
pub mod io;
pub mod transport;
pub mod websocket;

pub use client::{Client, ClientResponse, RequestBuilder, parse_url};
pub use connection::{Connection, FormUpload};
pub use error::{Error, Result};
pub use io::{Io, default_tls_config};
pub use transport::TokioTransport;
pub use websocket::{WebSocketInbound, WebSocketOutbound, WebSocketSession};

// http11_exchange の型を re-export
pub use http11_exchange::{Exchange, ExchangeState, FormBuilder, Headers, ReceiveError};
pub use tokio_tungstenite::tungstenite::Message;
