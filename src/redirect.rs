//! リダイレクト履歴

use std::sync::Arc;

use url::Url;

/// たどれるリダイレクトの上限
pub const MAX_REDIRECTS: usize = 50;

/// これまでにたどった URI の列
///
/// 上限を 1 つ超えたところで伸びなくなり、以降は追従できない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectChain(Arc<[String]>);

impl Default for RedirectChain {
    fn default() -> Self {
        Self(Arc::from(Vec::new()))
    }
}

impl RedirectChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// 既存の列から作る (長さはそのまま)
    pub fn from_vec(uris: Vec<String>) -> Self {
        Self(Arc::from(uris))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// 末尾に `uri` を足した列を返す
    pub fn with(&self, uri: &str) -> Self {
        if self.len() > MAX_REDIRECTS {
            return self.clone();
        }
        let mut uris = self.0.to_vec();
        uris.push(uri.to_string());
        Self::from_vec(uris)
    }

    /// まだリダイレクトをたどれるか
    pub fn allows_follow(&self) -> bool {
        self.len() <= MAX_REDIRECTS
    }

    /// 同じ URI を 2 度通っているか
    pub fn contains(&self, uri: &str) -> bool {
        self.0.iter().any(|u| u == uri)
    }
}

/// Location ヘッダーを `base` 基準で絶対 URI にする
pub fn resolve_location(base: &str, location: &str) -> Result<Url, url::ParseError> {
    match Url::parse(location) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(base)?.join(location),
        Err(e) => Err(e),
    }
}
