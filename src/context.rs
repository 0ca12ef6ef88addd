//! 接続ごとの属性とエクスチェンジの引き継ぎ値

use crate::prefetch::DEFAULT_PREFETCH;
use crate::redirect::RedirectChain;

/// 新しいエクスチェンジが付ける User-Agent
pub const USER_AGENT: &str = concat!("http11_exchange/", env!("CARGO_PKG_VERSION"));

/// 接続に付く属性
///
/// 接続を作るときに渡し、その接続上のすべてのエクスチェンジから参照される。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionContext {
    /// gzip 展開ステージを入れて Accept-Encoding: gzip を送る
    pub accept_gzip: bool,
    /// 別の接続から引き継いだリダイレクト履歴
    pub redirect_chain: Option<RedirectChain>,
    /// TLS 上の接続かどうか
    pub secure: bool,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accept_gzip(mut self, accept_gzip: bool) -> Self {
        self.accept_gzip = accept_gzip;
        self
    }

    pub fn with_redirect_chain(mut self, chain: RedirectChain) -> Self {
        self.redirect_chain = Some(chain);
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }
}

/// レスポンスの扱い方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    /// 302 をリダイレクトとして扱う
    pub follow_redirect: bool,
    /// 4xx を失敗として通知する (デフォルト: true)
    pub fail_on_client_error: bool,
    /// 5xx を失敗として通知する (デフォルト: true)
    pub fail_on_server_error: bool,
    /// 先読みウィンドウ (デフォルト: 16)
    pub prefetch: u32,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            follow_redirect: false,
            fail_on_client_error: true,
            fail_on_server_error: true,
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

impl ExchangeOptions {
    pub fn with_follow_redirect(mut self, follow: bool) -> Self {
        self.follow_redirect = follow;
        self
    }

    pub fn with_fail_on_client_error(mut self, fail: bool) -> Self {
        self.fail_on_client_error = fail;
        self
    }

    pub fn with_fail_on_server_error(mut self, fail: bool) -> Self {
        self.fail_on_server_error = fail;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = prefetch;
        self
    }
}

/// 終わったエクスチェンジから次のエクスチェンジへ渡す値
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    pub redirect_chain: RedirectChain,
    pub secure: bool,
    pub options: ExchangeOptions,
    pub accept_gzip: bool,
}

impl Continuation {
    /// `uri` を履歴に足した値を作る
    pub fn with_redirect(&self, uri: &str) -> Self {
        Self {
            redirect_chain: self.redirect_chain.with(uri),
            ..self.clone()
        }
    }

    /// 別の接続で続けるときのコンテキスト
    pub fn to_context(&self, secure: bool) -> ConnectionContext {
        ConnectionContext {
            accept_gzip: self.accept_gzip,
            redirect_chain: Some(self.redirect_chain.clone()),
            secure,
        }
    }
}
