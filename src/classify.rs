//! ステータスコードの分類

use std::fmt;

use crate::context::ExchangeOptions;
use crate::response::ResponseHead;

/// ステータスコードに対する扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// そのままアプリケーションに渡す
    Deliver,
    Redirect,
    ClientError,
    ServerError,
}

/// ステータスコードを分類する
///
/// 301 は `follow_redirect` に関係なくリダイレクトになるが、302 は追従が有効な場合だけ。
/// 307 / 308 などはそのまま渡す。
pub fn classify(status: u16, options: &ExchangeOptions, follow_redirect: bool) -> Classification {
    if status >= 500 {
        if options.fail_on_server_error {
            return Classification::ServerError;
        }
        return Classification::Deliver;
    }
    if status >= 400 {
        if options.fail_on_client_error {
            return Classification::ClientError;
        }
        return Classification::Deliver;
    }
    if status == 301 || (status == 302 && follow_redirect) {
        return Classification::Redirect;
    }
    Classification::Deliver
}

/// 失敗として分類されたレスポンス
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseError {
    /// リクエストした URI
    pub uri: String,
    pub response: ResponseHead,
}

impl ResponseError {
    pub fn new(uri: &str, response: ResponseHead) -> Self {
        Self {
            uri: uri.to_string(),
            response,
        }
    }

    pub fn status(&self) -> u16 {
        self.response.status_code
    }

    /// Location ヘッダー
    pub fn location(&self) -> Option<&str> {
        self.response.location()
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.response.status_code, self.response.reason_phrase, self.uri
        )
    }
}

impl std::error::Error for ResponseError {}
