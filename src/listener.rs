//! エクスチェンジの通知先

use std::fmt;

use bytes::Bytes;

use crate::classify::ResponseError;
use crate::error::{DecodeError, Error};
use crate::response::ResponseState;

/// リスナーが受け取る受信失敗
#[derive(Debug)]
pub enum ReceiveError {
    /// 301、または追従が有効なときの 302
    Redirect(ResponseError),
    /// 4xx
    ClientError(ResponseError),
    /// 5xx
    ServerError(ResponseError),
    /// 再利用中の接続でレスポンスを受け取る前に送信が失敗した
    NoResponse(Error),
    /// レスポンス開始後、または再利用できない接続での送信失敗
    Transport(Error),
    /// レスポンスのデコードに失敗した
    Decode(DecodeError),
}

impl ReceiveError {
    /// 分類されたレスポンス
    pub fn response(&self) -> Option<&ResponseError> {
        match self {
            ReceiveError::Redirect(e)
            | ReceiveError::ClientError(e)
            | ReceiveError::ServerError(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, ReceiveError::Redirect(_))
    }
}

impl fmt::Display for ReceiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiveError::Redirect(e) => write!(f, "redirect: {}", e),
            ReceiveError::ClientError(e) => write!(f, "client error: {}", e),
            ReceiveError::ServerError(e) => write!(f, "server error: {}", e),
            ReceiveError::NoResponse(e) => write!(f, "no response: {}", e),
            ReceiveError::Transport(e) => write!(f, "transport error: {}", e),
            ReceiveError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for ReceiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReceiveError::Redirect(e)
            | ReceiveError::ClientError(e)
            | ReceiveError::ServerError(e) => Some(e),
            ReceiveError::NoResponse(e) | ReceiveError::Transport(e) => Some(e),
            ReceiveError::Decode(e) => Some(e),
        }
    }
}

/// エクスチェンジからの通知を受け取る
pub trait ExchangeListener {
    /// 渡してよいレスポンスを受け取った
    fn on_start(&mut self, _response: &ResponseState) {}

    /// ボディの断片
    fn on_data(&mut self, _data: Bytes) {}

    fn on_receive_error(&mut self, _error: ReceiveError) {}

    /// エクスチェンジが終わった (1 度だけ呼ばれる)
    fn on_terminate(&mut self) {}
}

/// 何もしないリスナー
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl ExchangeListener for NoopListener {}
