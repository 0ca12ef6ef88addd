//! tokio-http11-exchange エラー型

use std::fmt;

use http11_exchange::ReceiveError;

/// tokio-http11-exchange エラー
#[derive(Debug)]
pub enum Error {
    /// I/O エラー
    Io(std::io::Error),
    /// エクスチェンジのエラー
    Http(http11_exchange::Error),
    /// レスポンスの受信失敗 (リダイレクト、4xx、5xx など)
    Receive(ReceiveError),
    /// TLS エラー
    Tls(String),
    /// WebSocket のフレーム処理エラー
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    /// 読み込みタイムアウト
    Timeout,
    /// 接続が閉じられた
    ConnectionClosed,
    /// 不正な URL
    InvalidUrl(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Http(e) => write!(f, "HTTP error: {}", e),
            Error::Receive(e) => write!(f, "{}", e),
            Error::Tls(e) => write!(f, "TLS error: {}", e),
            Error::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            Error::Timeout => write!(f, "connection timeout"),
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::InvalidUrl(msg) => write!(f, "invalid URL: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Http(e) => Some(e),
            Error::Receive(e) => Some(e),
            Error::WebSocket(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<http11_exchange::Error> for Error {
    fn from(e: http11_exchange::Error) -> Self {
        Error::Http(e)
    }
}

impl From<http11_exchange::FormError> for Error {
    fn from(e: http11_exchange::FormError) -> Self {
        Error::Http(e.into())
    }
}

impl From<ReceiveError> for Error {
    fn from(e: ReceiveError) -> Self {
        Error::Receive(e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<rustls_pki_types::InvalidDnsNameError> for Error {
    fn from(e: rustls_pki_types::InvalidDnsNameError) -> Self {
        Error::Tls(e.to_string())
    }
}

/// Result 型エイリアス
pub type Result<T> = std::result::Result<T, Error>;
