//! リクエストの Cookie とレスポンスの Set-Cookie (RFC 6265)
//!
//! リクエスト側は `name=value` を Cookie ヘッダーに連結するだけで、
//! レスポンス側は Set-Cookie ヘッダーを名前ごとにまとめた [`Cookies`] として扱う。
//!
//! ```rust
//! use http11_exchange::cookie::{Cookie, SetCookie};
//!
//! let cookie = Cookie::new("session", "abc123").unwrap();
//! assert_eq!(cookie.encode(), "session=abc123");
//!
//! let set_cookie = SetCookie::parse("session=abc123; Path=/; HttpOnly").unwrap();
//! assert_eq!(set_cookie.path(), Some("/"));
//! assert!(set_cookie.http_only());
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::headers::Headers;

/// Cookie エラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieError {
    /// 空の Cookie
    Empty,
    /// `=` がない
    InvalidFormat,
    /// 不正な名前
    InvalidName,
    /// 不正な値
    InvalidValue,
    /// 不正な Max-Age
    InvalidMaxAge,
}

impl fmt::Display for CookieError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CookieError::Empty => write!(f, "empty cookie"),
            CookieError::InvalidFormat => write!(f, "invalid cookie format"),
            CookieError::InvalidName => write!(f, "invalid cookie name"),
            CookieError::InvalidValue => write!(f, "invalid cookie value"),
            CookieError::InvalidMaxAge => write!(f, "invalid Max-Age attribute"),
        }
    }
}

impl std::error::Error for CookieError {}

/// リクエストに載せる Cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
}

impl Cookie {
    /// 新しい Cookie を作成
    pub fn new(name: &str, value: &str) -> Result<Self, CookieError> {
        if !is_valid_cookie_name(name) {
            return Err(CookieError::InvalidName);
        }
        if !is_valid_cookie_value(value) {
            return Err(CookieError::InvalidValue);
        }
        Ok(Self {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Cookie ヘッダー用の `name=value` 表現
    pub fn encode(&self) -> String {
        format!("{}={}", self.name, self.value)
    }

    /// 既存の Cookie ヘッダーに `; ` で連結する
    ///
    /// Cookie ヘッダーは 1 つにまとめる (RFC 6265 Section 5.4)
    pub fn append_to(&self, headers: &mut Headers) {
        let encoded = self.encode();
        let merged = match headers.get("Cookie") {
            Some(existing) if !existing.trim().is_empty() => format!("{}; {}", existing, encoded),
            _ => encoded,
        };
        headers.set("Cookie", &merged);
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// SameSite 属性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// Set-Cookie ヘッダー
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    name: String,
    value: String,
    /// Expires は日付として解釈せずに保持する
    expires: Option<String>,
    max_age: Option<i64>,
    domain: Option<String>,
    path: Option<String>,
    secure: bool,
    http_only: bool,
    same_site: Option<SameSite>,
}

impl SetCookie {
    /// Set-Cookie ヘッダー文字列をパース
    ///
    /// 未知の属性と解釈できない SameSite は無視する (RFC 6265 Section 5.2)
    pub fn parse(input: &str) -> Result<Self, CookieError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(CookieError::Empty);
        }

        let mut parts = input.split(';');
        let first = parts.next().ok_or(CookieError::InvalidFormat)?;
        let (name, value) = parse_cookie_pair(first.trim())?;

        let mut cookie = SetCookie {
            name: name.to_string(),
            value: value.to_string(),
            expires: None,
            max_age: None,
            domain: None,
            path: None,
            secure: false,
            http_only: false,
            same_site: None,
        };

        for part in parts.map(str::trim).filter(|p| !p.is_empty()) {
            let (attr, attr_value) = match part.split_once('=') {
                Some((a, v)) => (a.trim(), Some(v.trim())),
                None => (part, None),
            };
            match (attr.to_ascii_lowercase().as_str(), attr_value) {
                ("expires", Some(v)) => cookie.expires = Some(v.to_string()),
                ("max-age", Some(v)) => {
                    cookie.max_age = Some(v.parse().map_err(|_| CookieError::InvalidMaxAge)?);
                }
                ("domain", Some(v)) => cookie.domain = Some(v.trim_start_matches('.').to_string()),
                ("path", Some(v)) => cookie.path = Some(v.to_string()),
                ("samesite", Some(v)) => {
                    cookie.same_site = match v.to_ascii_lowercase().as_str() {
                        "strict" => Some(SameSite::Strict),
                        "lax" => Some(SameSite::Lax),
                        "none" => Some(SameSite::None),
                        _ => None,
                    };
                }
                ("secure", None) => cookie.secure = true,
                ("httponly", None) => cookie.http_only = true,
                _ => {}
            }
        }

        Ok(cookie)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Expires 属性 (未解釈の文字列)
    pub fn expires(&self) -> Option<&str> {
        self.expires.as_deref()
    }

    /// Max-Age 属性 (秒)
    pub fn max_age(&self) -> Option<i64> {
        self.max_age
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn http_only(&self) -> bool {
        self.http_only
    }

    pub fn same_site(&self) -> Option<SameSite> {
        self.same_site
    }
}

/// レスポンスの Set-Cookie を名前ごとにまとめたもの
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookies {
    by_name: BTreeMap<String, Vec<SetCookie>>,
}

impl Cookies {
    /// レスポンスヘッダーから Set-Cookie を集める
    ///
    /// パースできない Set-Cookie は捨てる
    pub fn from_headers(headers: &Headers) -> Self {
        let mut by_name: BTreeMap<String, Vec<SetCookie>> = BTreeMap::new();
        for value in headers.get_all("Set-Cookie") {
            if let Ok(cookie) = SetCookie::parse(value) {
                by_name.entry(cookie.name.clone()).or_default().push(cookie);
            }
        }
        Self { by_name }
    }

    /// 指定した名前の Cookie (受信順)
    pub fn get(&self, name: &str) -> &[SetCookie] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Cookie 名の一覧
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

fn parse_cookie_pair(pair: &str) -> Result<(&str, &str), CookieError> {
    let (name, value) = pair.split_once('=').ok_or(CookieError::InvalidFormat)?;
    let name = name.trim();
    let value = value.trim();
    if !is_valid_cookie_name(name) {
        return Err(CookieError::InvalidName);
    }
    // 値の引用符を除去
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Ok((name, value))
}

/// RFC 6265 Section 4.1.1: cookie-name = token
fn is_valid_cookie_name(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            matches!(b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
                b'0'..=b'9' | b'A'..=b'Z' | b'^' | b'_' | b'`' | b'a'..=b'z' | b'|' | b'~'
            )
        })
}

/// RFC 6265 Section 4.1.1: cookie-octet
fn is_valid_cookie_value(s: &str) -> bool {
    s.bytes().all(|b| {
        b == 0x21
            || (0x23..=0x2B).contains(&b)
            || (0x2D..=0x3A).contains(&b)
            || (0x3C..=0x5B).contains(&b)
            || (0x5D..=0x7E).contains(&b)
    })
}
