//! WebSocket へのアップグレード (RFC 6455 Section 4)
//!
//! クライアント側のハンドシェイクだけを扱う。
//! 101 を受け取って検証に通ると HTTP のステージを外し、
//! デコーダーが読み残したバイト列をフレーム処理側に渡す。

use std::fmt;
use std::sync::{Arc, OnceLock};

use base64::Engine;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};
use url::Url;

use crate::codec::InboundEvent;
use crate::error::Error;
use crate::pipeline::StageName;
use crate::request::{OutboundRequest, Version};
use crate::response::FullResponse;
use crate::transport::Transport;

/// Sec-WebSocket-Accept の計算に使う GUID
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// アップグレードの失敗
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeError {
    /// ヘッダー送信後にアップグレードしようとした
    HeadersAlreadySent,
    /// 101 以外のステータス
    NotSwitchingProtocols(u16),
    /// Upgrade: websocket がない
    MissingUpgradeHeader,
    /// Connection: Upgrade がない
    MissingConnectionHeader,
    /// Sec-WebSocket-Accept が一致しない
    InvalidAccept { expected: String, actual: String },
    /// 要求していないサブプロトコル
    UnexpectedSubprotocol(String),
    HandshakeFailed(String),
}

impl fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeError::HeadersAlreadySent => write!(f, "Failed to upgrade to websocket"),
            UpgradeError::NotSwitchingProtocols(status) => {
                write!(f, "expected 101 Switching Protocols, got {}", status)
            }
            UpgradeError::MissingUpgradeHeader => write!(f, "missing Upgrade: websocket header"),
            UpgradeError::MissingConnectionHeader => {
                write!(f, "missing Connection: Upgrade header")
            }
            UpgradeError::InvalidAccept { expected, actual } => write!(
                f,
                "invalid Sec-WebSocket-Accept: expected {}, got {}",
                expected, actual
            ),
            UpgradeError::UnexpectedSubprotocol(protocol) => {
                write!(f, "unexpected subprotocol: {}", protocol)
            }
            UpgradeError::HandshakeFailed(msg) => write!(f, "handshake failed: {}", msg),
        }
    }
}

impl std::error::Error for UpgradeError {}

/// Sec-WebSocket-Key から Sec-WebSocket-Accept を計算
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// ランダムな 16 バイトの Sec-WebSocket-Key を作る
pub fn generate_key() -> Result<String, UpgradeError> {
    let mut key = [0u8; 16];
    getrandom::getrandom(&mut key)
        .map_err(|e| UpgradeError::HandshakeFailed(format!("failed to generate key: {}", e)))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(key))
}

/// ハンドシェイクに使う URI
///
/// http / ws で始まる絶対 URI はそのまま使い、それ以外は Host ヘッダーから
/// `ws[s]://{Host}{path}` を組み立てる
pub fn websocket_uri(request: &OutboundRequest, secure: bool) -> Result<Url, Error> {
    let target = request.uri.as_str();
    let raw = if target.starts_with("http") || target.starts_with("ws") {
        target.to_string()
    } else {
        let host = request
            .headers
            .get("Host")
            .ok_or_else(|| Error::UriSynthesis(format!("no Host header for {}", target)))?;
        let scheme = if secure { "wss" } else { "ws" };
        if target.starts_with('/') {
            format!("{}://{}{}", scheme, host, target)
        } else {
            format!("{}://{}/{}", scheme, host, target)
        }
    };
    Url::parse(&raw).map_err(|e| Error::UriSynthesis(format!("{}: {}", raw, e)))
}

type HandshakeResult = Result<Option<String>, UpgradeError>;

/// ハンドシェイク完了の通知
///
/// 1 度だけ結果が入る。成功時は選ばれたサブプロトコルを持つ。
#[derive(Debug, Clone, Default)]
pub struct HandshakeSignal(Arc<OnceLock<HandshakeResult>>);

impl HandshakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// 結果を入れる。すでに入っていれば false
    pub fn fire(&self, result: HandshakeResult) -> bool {
        self.0.set(result).is_ok()
    }

    pub fn is_complete(&self) -> bool {
        self.0.get().is_some()
    }

    pub fn result(&self) -> Option<&HandshakeResult> {
        self.0.get()
    }
}

/// WebSocket に切り替えた接続のハンドラー
#[derive(Debug)]
pub struct WebSocketExchange {
    uri: Url,
    key: String,
    protocols: Vec<String>,
    request: OutboundRequest,
    signal: HandshakeSignal,
    leftover: Bytes,
    upgraded: bool,
}

impl WebSocketExchange {
    /// ハンドシェイクリクエストを組み立てる
    ///
    /// `inherited` のヘッダーを引き継ぎ、ハンドシェイク用のヘッダーで上書きする
    pub fn new(uri: Url, protocols: &[&str], inherited: &OutboundRequest) -> Result<Self, Error> {
        let key = generate_key()?;
        let protocols: Vec<String> = protocols
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let mut path = uri.path().to_string();
        if let Some(query) = uri.query() {
            path.push('?');
            path.push_str(query);
        }

        let mut request = OutboundRequest::new("GET", &path);
        request.version = Version::Http11;
        for (name, value) in inherited.headers.iter() {
            if name.eq_ignore_ascii_case("Transfer-Encoding")
                || name.eq_ignore_ascii_case("Content-Length")
            {
                continue;
            }
            request.headers.add(name, value);
        }

        let host = uri
            .host_str()
            .ok_or_else(|| Error::UriSynthesis(format!("no host in {}", uri)))?;
        let authority = match uri.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        request.headers.set("Host", &authority);
        request.headers.set("Upgrade", "websocket");
        request.headers.set("Connection", "Upgrade");
        request.headers.set("Sec-WebSocket-Key", &key);
        request.headers.set("Sec-WebSocket-Version", "13");
        if !protocols.is_empty() {
            request
                .headers
                .set("Sec-WebSocket-Protocol", &protocols.join(", "));
        }
        if !request.headers.contains("Origin") {
            let scheme = match uri.scheme() {
                "wss" | "https" => "https",
                _ => "http",
            };
            request
                .headers
                .set("Origin", &format!("{}://{}", scheme, authority));
        }

        Ok(Self {
            uri,
            key,
            protocols,
            request,
            signal: HandshakeSignal::new(),
            leftover: Bytes::new(),
            upgraded: false,
        })
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    pub fn signal(&self) -> HandshakeSignal {
        self.signal.clone()
    }

    pub fn handshake_request(&self) -> &OutboundRequest {
        &self.request
    }

    /// 選ばれたサブプロトコル
    pub fn selected_protocol(&self) -> Option<&str> {
        match self.signal.result() {
            Some(Ok(Some(protocol))) => Some(protocol),
            _ => None,
        }
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    /// ハンドシェイクのレスポンスと一緒に届いたフレームのバイト列
    pub fn take_leftover(&mut self) -> Bytes {
        std::mem::take(&mut self.leftover)
    }

    pub fn on_inbound<T: Transport + ?Sized>(&mut self, transport: &mut T, event: InboundEvent) {
        if self.signal.is_complete() {
            debug!("ignoring inbound event after websocket handshake");
            return;
        }
        let result = match event {
            InboundEvent::Full(response) => self.verify(&response),
            InboundEvent::Malformed(e) => Err(UpgradeError::HandshakeFailed(e.to_string())),
            _ => {
                debug!("ignoring partial message during websocket handshake");
                return;
            }
        };

        match result {
            Ok(protocol) => {
                let pipeline = transport.pipeline();
                for name in [
                    StageName::HttpAggregator,
                    StageName::HttpDecompressor,
                    StageName::ChunkedWriter,
                    StageName::HttpEncoder,
                ] {
                    pipeline.remove(name);
                }
                self.leftover = pipeline.take_decoder_remaining();
                pipeline.remove(StageName::HttpDecoder);
                self.upgraded = true;
                debug!(
                    uri = %self.uri,
                    protocol = ?protocol,
                    leftover = self.leftover.len(),
                    "websocket handshake completed"
                );
                self.signal.fire(Ok(protocol));
            }
            Err(e) => {
                warn!(uri = %self.uri, error = %e, "websocket handshake failed");
                transport.mark_persistent(false);
                transport.close();
                self.signal.fire(Err(e));
            }
        }
    }

    fn verify(&self, response: &FullResponse) -> Result<Option<String>, UpgradeError> {
        let head = &response.head;
        if head.status_code != 101 {
            return Err(UpgradeError::NotSwitchingProtocols(head.status_code));
        }
        if !head.headers.contains_token("Upgrade", "websocket") {
            return Err(UpgradeError::MissingUpgradeHeader);
        }
        if !head.headers.contains_token("Connection", "upgrade") {
            return Err(UpgradeError::MissingConnectionHeader);
        }
        let expected = compute_accept_key(&self.key);
        let actual = head.headers.get("Sec-WebSocket-Accept").unwrap_or("");
        if actual.trim() != expected {
            return Err(UpgradeError::InvalidAccept {
                expected,
                actual: actual.to_string(),
            });
        }
        match head.headers.get("Sec-WebSocket-Protocol").map(str::trim) {
            None | Some("") => Ok(None),
            Some(protocol) if self.protocols.iter().any(|p| p == protocol) => {
                Ok(Some(protocol.to_string()))
            }
            Some(protocol) => Err(UpgradeError::UnexpectedSubprotocol(protocol.to_string())),
        }
    }
}
