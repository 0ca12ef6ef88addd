use crate::error::Error;
use crate::headers::Headers;

/// HTTP バージョン
///
/// このエンジンが扱うのは HTTP/1.0 と HTTP/1.1 だけ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    /// "HTTP/1.0" / "HTTP/1.1" をパース
    ///
    /// それ以外のバージョンは InvalidState として扱う
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(Error::InvalidState("unsupported HTTP version")),
        }
    }

    /// Connection ヘッダーなしでキープアライブになるバージョンか
    pub fn is_keep_alive_default(&self) -> bool {
        matches!(self, Version::Http11)
    }
}

/// 送信中のリクエストライン + ヘッダー
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: String,
    pub uri: String,
    pub version: Version,
    pub headers: Headers,
}

impl OutboundRequest {
    /// 新しいリクエストを作成 (HTTP/1.1)
    pub fn new(method: &str, uri: &str) -> Self {
        Self {
            method: method.to_string(),
            uri: uri.to_string(),
            version: Version::Http11,
            headers: Headers::new(),
        }
    }

    /// ヘッダーを追加 (ビルダーパターン)
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    /// キープアライブ接続を要求しているか
    ///
    /// Connection ヘッダーはカンマ区切りのトークンリストとして扱う (RFC 9110)
    pub fn is_keep_alive(&self) -> bool {
        if self.headers.contains_token("Connection", "close") {
            return false;
        }
        self.version.is_keep_alive_default()
            || self.headers.contains_token("Connection", "keep-alive")
    }

    /// キープアライブの指定を切り替える
    ///
    /// HTTP/1.1 は Connection ヘッダーなしがキープアライブ、
    /// HTTP/1.0 は Connection: keep-alive が必要
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        match (self.version.is_keep_alive_default(), keep_alive) {
            (true, true) => {
                self.headers.remove("Connection");
            }
            (true, false) => self.headers.set("Connection", "close"),
            (false, true) => self.headers.set("Connection", "keep-alive"),
            (false, false) => {
                self.headers.remove("Connection");
            }
        }
    }

    /// Transfer-Encoding が chunked かどうか
    pub fn is_chunked(&self) -> bool {
        self.headers.is_chunked()
    }

    /// chunked 転送を切り替える
    ///
    /// 有効にすると Transfer-Encoding は 1 つだけになり Content-Length は外される。
    /// 無効にすると chunked 以外のコーディングだけが残る。
    pub fn set_chunked(&mut self, chunked: bool) {
        let others: Vec<String> = self
            .headers
            .get_all("Transfer-Encoding")
            .into_iter()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("chunked"))
            .map(str::to_string)
            .collect();
        self.headers.remove("Transfer-Encoding");
        if chunked {
            self.headers.remove("Content-Length");
            self.headers.add("Transfer-Encoding", "chunked");
        } else if !others.is_empty() {
            self.headers.add("Transfer-Encoding", &others.join(", "));
        }
    }

    /// ボディを全量バッファしてから送るメソッドか (GET / HEAD)
    pub fn is_buffered_method(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET") || self.method.eq_ignore_ascii_case("HEAD")
    }

    /// リクエストラインとヘッダーをエンコード
    pub fn encode_head(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(self.method.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.uri.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.version.as_str().as_bytes());
        buf.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }
}
