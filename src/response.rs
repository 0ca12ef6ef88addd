use std::sync::OnceLock;

use bytes::Bytes;

use crate::cookie::Cookies;
use crate::headers::Headers;
use crate::request::Version;

/// ステータスラインとヘッダー
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: Version,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// 新しいレスポンスヘッドを作成 (HTTP/1.1)
    pub fn new(status_code: u16, reason_phrase: &str) -> Self {
        Self {
            version: Version::Http11,
            status_code,
            reason_phrase: reason_phrase.to_string(),
            headers: Headers::new(),
        }
    }

    /// ヘッダーを追加 (ビルダーパターン)
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    /// 1xx
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// 3xx
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status_code)
    }

    /// 4xx
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code)
    }

    /// 5xx
    pub fn is_server_error(&self) -> bool {
        self.status_code >= 500
    }

    /// Location ヘッダー
    pub fn location(&self) -> Option<&str> {
        self.headers.get("Location")
    }

    /// レスポンスがキープアライブを許しているか
    pub fn is_keep_alive(&self) -> bool {
        if self.headers.contains_token("Connection", "close") {
            return false;
        }
        self.version.is_keep_alive_default()
            || self.headers.contains_token("Connection", "keep-alive")
    }
}

/// 1 つのイベントで届いた完全なレスポンス
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullResponse {
    pub head: ResponseHead,
    pub body: Bytes,
}

/// エクスチェンジが受け取ったレスポンス
///
/// エクスチェンジごとに 1 度だけ作られる。Cookie は初回アクセス時にパースしてキャッシュする。
#[derive(Debug)]
pub struct ResponseState {
    head: ResponseHead,
    cookies: OnceLock<Cookies>,
}

impl ResponseState {
    pub fn new(head: ResponseHead) -> Self {
        Self {
            head,
            cookies: OnceLock::new(),
        }
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn status(&self) -> u16 {
        self.head.status_code
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    /// Set-Cookie を名前ごとにまとめたもの
    pub fn cookies(&self) -> &Cookies {
        self.cookies
            .get_or_init(|| Cookies::from_headers(&self.head.headers))
    }
}
