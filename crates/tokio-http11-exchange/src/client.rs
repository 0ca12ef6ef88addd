//! HTTP/HTTPS クライアント
//!
//! リクエストごとに接続を張り、エクスチェンジを 1 回実行してレスポンスを全量読む。
//! リダイレクトは新しい接続で追従し、たどった URL を引き継ぐ。
//!
//! ## 使い方
//!
//! ```ignore
//! use tokio_http11_exchange::Client;
//!
//! // GET
//! let client = Client::new();
//! let response = client.get("http://example.com/path").await?;
//!
//! // 302 も追従し、gzip を受け付ける
//! let client = Client::new().follow_redirect(true).accept_gzip(true);
//! let response = client.get("http://example.com/old").await?;
//! println!("{:?}", response.redirected_from);
//!
//! // POST with body
//! let response = client.post("http://example.com/api")
//!     .header("Content-Type", "application/json")
//!     .body(b"{\"key\": \"value\"}")
//!     .await?;
//! ```

use std::future::IntoFuture;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http11_exchange::redirect::resolve_location;
use http11_exchange::{
    ConnectionContext, Continuation, Cookies, Headers, ReceiveError, Version,
};
use rustls::ClientConfig;
use tracing::debug;
use url::Url;

use crate::connection::Connection;
use crate::error::{Error, Result};

/// HTTP クライアント
///
/// HTTP と HTTPS の両方に対応。TLS 設定を指定しなければ OS のルート証明書を使う。
#[derive(Clone)]
pub struct Client {
    connect_timeout: Duration,
    read_timeout: Duration,
    tls_config: Option<Arc<ClientConfig>>,
    follow_redirect: bool,
    accept_gzip: bool,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// 新しいクライアントを作成
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            tls_config: None,
            follow_redirect: false,
            accept_gzip: false,
        }
    }

    /// TLS 設定を指定 (HTTPS 用)
    pub fn tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// 接続タイムアウトを設定
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 読み取りタイムアウトを設定
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// リダイレクトを追従する
    ///
    /// 301 は常にリダイレクトとして扱われ、追従しない場合はエラーになる。
    /// 302 は追従する場合だけリダイレクトになる。
    pub fn follow_redirect(mut self, follow: bool) -> Self {
        self.follow_redirect = follow;
        self
    }

    /// Accept-Encoding: gzip を送り、レスポンスを展開する
    pub fn accept_gzip(mut self, accept: bool) -> Self {
        self.accept_gzip = accept;
        self
    }

    /// GET リクエストを作成
    pub fn get(&self, url: &str) -> RequestBuilder<'_> {
        self.request("GET", url)
    }

    /// POST リクエストを作成
    pub fn post(&self, url: &str) -> RequestBuilder<'_> {
        self.request("POST", url)
    }

    /// PUT リクエストを作成
    pub fn put(&self, url: &str) -> RequestBuilder<'_> {
        self.request("PUT", url)
    }

    /// DELETE リクエストを作成
    pub fn delete(&self, url: &str) -> RequestBuilder<'_> {
        self.request("DELETE", url)
    }

    /// HEAD リクエストを作成
    pub fn head(&self, url: &str) -> RequestBuilder<'_> {
        self.request("HEAD", url)
    }

    /// 任意のメソッドでリクエストを作成
    pub fn request(&self, method: &str, url: &str) -> RequestBuilder<'_> {
        RequestBuilder {
            client: self,
            method: method.to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }
}

/// 全量を読んだレスポンス
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub version: Version,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub cookies: Cookies,
    pub body: Bytes,
    /// たどったリダイレクト元の URL (古い順)
    pub redirected_from: Vec<String>,
}

impl ClientResponse {
    async fn read(connection: &mut Connection) -> Result<Self> {
        let state = connection.response().await?;
        let head = state.head().clone();
        let cookies = state.cookies().clone();
        let redirected_from = connection.exchange()?.redirected_from();
        let body = connection.body().await?;
        Ok(Self {
            version: head.version,
            status_code: head.status_code,
            reason_phrase: head.reason_phrase,
            headers: head.headers,
            cookies,
            body,
            redirected_from,
        })
    }

    /// ヘッダーの値を取得
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

/// リクエストビルダー
///
/// Client のメソッド (get, post など) から取得し、ヘッダーやボディを追加してから
/// `.await` でリクエストを送信する。
pub struct RequestBuilder<'a> {
    client: &'a Client,
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
}

impl<'a> RequestBuilder<'a> {
    /// ヘッダーを追加
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// ボディを設定
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// リクエストを送信
    async fn send(self) -> Result<ClientResponse> {
        let client = self.client;
        let mut url = self.url.clone();
        let mut continuation: Option<Continuation> = None;

        loop {
            let (scheme, host, port, path) = parse_url(&url)?;
            let secure = scheme == "https";
            let context = match &continuation {
                Some(c) => c.to_context(secure),
                None => ConnectionContext::new().with_accept_gzip(client.accept_gzip),
            };

            let mut connection = Connection::connect_to(
                &host,
                port,
                secure,
                client.tls_config.clone(),
                client.connect_timeout,
                context,
            )
            .await?;
            connection.set_read_timeout(client.read_timeout);

            let exchange = connection.exchange()?;
            exchange.set_method(&self.method)?.set_uri(&path)?;
            for (name, value) in &self.headers {
                if name.eq_ignore_ascii_case("Host") {
                    exchange.header(name, value)?;
                } else {
                    exchange.add_header(name, value)?;
                }
            }
            if client.follow_redirect {
                exchange.follow_redirect();
            }

            if let Some(body) = &self.body {
                connection.send(body.clone()).await?;
            }
            connection.finish_request().await?;

            match connection.response().await {
                Ok(_) => return ClientResponse::read(&mut connection).await,
                Err(Error::Receive(ReceiveError::Redirect(e))) => {
                    let next = connection.exchange()?.continuation().with_redirect(&url);
                    if !client.follow_redirect || !next.redirect_chain.allows_follow() {
                        return Err(Error::Receive(ReceiveError::Redirect(e)));
                    }
                    let Some(location) = e.location() else {
                        return Err(Error::Receive(ReceiveError::Redirect(e)));
                    };
                    let target = resolve_location(&url, location)
                        .map_err(|err| Error::InvalidUrl(format!("{}: {}", location, err)))?;
                    debug!(
                        status = e.status(),
                        from = %url,
                        to = %target,
                        hops = next.redirect_chain.len(),
                        "following redirect"
                    );
                    url = target.to_string();
                    continuation = Some(next);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<'a> IntoFuture for RequestBuilder<'a> {
    type Output = Result<ClientResponse>;
    type IntoFuture = Pin<Box<dyn std::future::Future<Output = Self::Output> + Send + 'a>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.send())
    }
}

/// URL をパース
///
/// (scheme, host, port, path) のタプルを返す。
pub fn parse_url(url: &str) -> Result<(String, String, u16, String)> {
    let uri = Url::parse(url).map_err(|e| Error::InvalidUrl(e.to_string()))?;

    let scheme = uri.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::InvalidUrl(
            "URL must start with http:// or https://".to_string(),
        ));
    }

    let host = uri
        .host_str()
        .ok_or_else(|| Error::InvalidUrl("URL must have a host".to_string()))?;

    let port = uri
        .port_or_known_default()
        .unwrap_or(if scheme == "https" { 443 } else { 80 });

    let mut path = uri.path().to_string();
    if path.is_empty() {
        path.push('/');
    }
    if let Some(query) = uri.query() {
        path.push('?');
        path.push_str(query);
    }

    Ok((scheme.to_string(), host.to_string(), port, path))
}
