use std::fmt;

use crate::form::FormError;
use crate::websocket::UpgradeError;

/// レスポンスのデコードエラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// 不正なデータ
    InvalidData(String),
    /// バッファサイズ超過
    BufferOverflow { size: usize, limit: usize },
    /// ヘッダー数超過
    TooManyHeaders { count: usize, limit: usize },
    /// ヘッダー行が長すぎる
    HeaderLineTooLong { size: usize, limit: usize },
    /// チャンクサイズ行が長すぎる
    ChunkLineTooLong { size: usize, limit: usize },
    /// 集約中のボディが上限を超えた
    BodyTooLarge { size: usize, limit: usize },
    /// メッセージの途中で接続が閉じられた
    UnexpectedEof,
    /// Content-Encoding の展開に失敗した
    Decompress(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidData(msg) => write!(f, "invalid data: {}", msg),
            DecodeError::BufferOverflow { size, limit } => {
                write!(f, "buffer overflow: {} > {}", size, limit)
            }
            DecodeError::TooManyHeaders { count, limit } => {
                write!(f, "too many headers: {} > {}", count, limit)
            }
            DecodeError::HeaderLineTooLong { size, limit } => {
                write!(f, "header line too long: {} > {}", size, limit)
            }
            DecodeError::ChunkLineTooLong { size, limit } => {
                write!(f, "chunk line too long: {} > {}", size, limit)
            }
            DecodeError::BodyTooLarge { size, limit } => {
                write!(f, "aggregated body too large: {} > {}", size, limit)
            }
            DecodeError::UnexpectedEof => write!(f, "connection closed in the middle of a message"),
            DecodeError::Decompress(msg) => write!(f, "decompress error: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

/// エクスチェンジのエラー
#[derive(Debug)]
pub enum Error {
    /// レスポンスのデコードに失敗した
    Decode(DecodeError),
    /// 送信済みの状態で変更しようとした
    InvalidState(&'static str),
    /// WebSocket へのアップグレードに失敗した
    Upgrade(UpgradeError),
    /// WebSocket ハンドシェイク URI を組み立てられない
    UriSynthesis(String),
    /// フォームボディの構築に失敗した
    Form(FormError),
    /// トランスポートの I/O エラー
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Decode(e) => write!(f, "decode error: {}", e),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Error::Upgrade(e) => write!(f, "websocket upgrade failed: {}", e),
            Error::UriSynthesis(msg) => write!(f, "invalid websocket uri: {}", msg),
            Error::Form(e) => write!(f, "form error: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Decode(e) => Some(e),
            Error::Upgrade(e) => Some(e),
            Error::Form(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::Decode(e)
    }
}

impl From<UpgradeError> for Error {
    fn from(e: UpgradeError) -> Self {
        Error::Upgrade(e)
    }
}

impl From<FormError> for Error {
    fn from(e: FormError) -> Self {
        Error::Form(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
