//! HTTP レスポンスデコーダー (Sans I/O)

use bytes::{Bytes, BytesMut};

use crate::error::DecodeError;
use crate::headers::Headers;
use crate::limits::DecoderLimits;
use crate::request::Version;
use crate::response::ResponseHead;

use super::{InboundEvent, LastContent};

/// デコード状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// ステータスライン待ち
    StartLine,
    /// ヘッダー待ち
    Headers,
    /// 固定長ボディ
    Fixed { remaining: usize },
    /// チャンクサイズ行待ち
    ChunkSize,
    /// チャンクデータ
    ChunkData { remaining: usize },
    /// チャンクデータ後の CRLF 待ち
    ChunkDataCrlf,
    /// トレーラー (読み捨てる)
    Trailer,
    /// 接続が閉じるまでがボディ
    CloseDelimited,
    /// 終端イベントを出す
    EndOfMessage,
    /// 101 以降はデコードしない
    Upgraded,
    /// エラー後はデコードしない
    Failed,
}

/// レスポンスをイベント列にデコードする
///
/// 1 つのレスポンスは `Head`、0 個以上の `Content`、`Last` の順で出る。
#[derive(Debug)]
pub struct ResponseDecoder {
    buf: BytesMut,
    phase: Phase,
    limits: DecoderLimits,
    start_line: Option<(Version, u16, String)>,
    headers: Headers,
    /// HEAD リクエストへのレスポンスかどうか
    expect_no_body: bool,
    upgrade: bool,
    eof: bool,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self::with_limits(DecoderLimits::default())
    }

    /// 制限付きでデコーダーを作成
    pub fn with_limits(limits: DecoderLimits) -> Self {
        Self {
            buf: BytesMut::new(),
            phase: Phase::StartLine,
            limits,
            start_line: None,
            headers: Headers::new(),
            expect_no_body: false,
            upgrade: false,
            eof: false,
        }
    }

    pub fn limits(&self) -> &DecoderLimits {
        &self.limits
    }

    /// 次のレスポンスを HEAD へのレスポンスとしてデコードする
    pub fn set_expect_no_body(&mut self, expect_no_body: bool) {
        self.expect_no_body = expect_no_body;
    }

    /// バッファにデータを追加
    pub fn feed(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        let new_size = self.buf.len() + data.len();
        if new_size > self.limits.max_buffer_size {
            return Err(DecodeError::BufferOverflow {
                size: new_size,
                limit: self.limits.max_buffer_size,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// 接続終了を通知
    ///
    /// close-delimited ボディはここで確定する。メッセージの途中なら次の decode() がエラーになる。
    pub fn mark_eof(&mut self) {
        self.eof = true;
    }

    /// 101 を受け取ってデコードを止めたか
    pub fn is_upgraded(&self) -> bool {
        self.phase == Phase::Upgraded
    }

    /// デコードしていないバッファを取り出す
    pub fn take_remaining(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// イベントを 1 つデコード
    ///
    /// データ不足の場合は `None` を返す
    pub fn decode(&mut self) -> Result<Option<InboundEvent>, DecodeError> {
        let result = self.decode_inner();
        if result.is_err() {
            self.phase = Phase::Failed;
        }
        result
    }

    /// デコードできるイベントをすべて取り出す
    ///
    /// エラーは `Malformed` イベントとして最後に入る
    pub fn decode_all(&mut self) -> Vec<InboundEvent> {
        let mut events = Vec::new();
        loop {
            match self.decode() {
                Ok(Some(event)) => events.push(event),
                Ok(None) => break,
                Err(e) => {
                    events.push(InboundEvent::Malformed(e));
                    break;
                }
            }
        }
        events
    }

    fn decode_inner(&mut self) -> Result<Option<InboundEvent>, DecodeError> {
        loop {
            match self.phase {
                Phase::StartLine => {
                    let Some(line) = self.take_line(self.limits.max_header_line_size, false)?
                    else {
                        return self.need_more(self.buf.is_empty());
                    };
                    // レスポンス間の空行は読み飛ばす (RFC 9112 Section 2.2)
                    if line.is_empty() {
                        continue;
                    }
                    self.start_line = Some(parse_status_line(&line)?);
                    self.phase = Phase::Headers;
                }
                Phase::Headers => {
                    let Some(line) = self.take_line(self.limits.max_header_line_size, false)?
                    else {
                        return self.need_more(false);
                    };
                    if !line.is_empty() {
                        if self.headers.len() >= self.limits.max_headers_count {
                            return Err(DecodeError::TooManyHeaders {
                                count: self.headers.len() + 1,
                                limit: self.limits.max_headers_count,
                            });
                        }
                        let (name, value) = parse_header_line(&line)?;
                        self.headers.add(&name, &value);
                        continue;
                    }
                    if let Some(head) = self.finish_head()? {
                        return Ok(Some(InboundEvent::Head(head)));
                    }
                }
                Phase::Fixed { remaining } => {
                    if self.buf.is_empty() {
                        return self.need_more(false);
                    }
                    let n = remaining.min(self.buf.len());
                    let data = self.buf.split_to(n).freeze();
                    if n == remaining {
                        self.phase = Phase::StartLine;
                        return Ok(Some(InboundEvent::Last(LastContent::Data(data))));
                    }
                    self.phase = Phase::Fixed {
                        remaining: remaining - n,
                    };
                    return Ok(Some(InboundEvent::Content(data)));
                }
                Phase::ChunkSize => {
                    let Some(line) = self.take_line(self.limits.max_chunk_line_size, true)? else {
                        return self.need_more(false);
                    };
                    // チャンク拡張は無視する
                    let size_str = line.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(size_str, 16).map_err(|_| {
                        DecodeError::InvalidData(format!("invalid chunk size: {}", size_str))
                    })?;
                    self.phase = if size == 0 {
                        Phase::Trailer
                    } else {
                        Phase::ChunkData { remaining: size }
                    };
                }
                Phase::ChunkData { remaining } => {
                    if self.buf.is_empty() {
                        return self.need_more(false);
                    }
                    let n = remaining.min(self.buf.len());
                    let data = self.buf.split_to(n).freeze();
                    self.phase = if n == remaining {
                        Phase::ChunkDataCrlf
                    } else {
                        Phase::ChunkData {
                            remaining: remaining - n,
                        }
                    };
                    return Ok(Some(InboundEvent::Content(data)));
                }
                Phase::ChunkDataCrlf => {
                    if self.buf.len() < 2 {
                        return self.need_more(false);
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(DecodeError::InvalidData(
                            "missing CRLF after chunk data".to_string(),
                        ));
                    }
                    let _ = self.buf.split_to(2);
                    self.phase = Phase::ChunkSize;
                }
                Phase::Trailer => {
                    let Some(line) = self.take_line(self.limits.max_header_line_size, false)?
                    else {
                        return self.need_more(false);
                    };
                    if line.is_empty() {
                        self.phase = Phase::StartLine;
                        return Ok(Some(InboundEvent::Last(LastContent::Empty)));
                    }
                }
                Phase::CloseDelimited => {
                    if !self.buf.is_empty() {
                        let data = self.buf.split().freeze();
                        return Ok(Some(InboundEvent::Content(data)));
                    }
                    if self.eof {
                        self.phase = Phase::StartLine;
                        return Ok(Some(InboundEvent::Last(LastContent::Empty)));
                    }
                    return Ok(None);
                }
                Phase::EndOfMessage => {
                    self.phase = if self.upgrade {
                        Phase::Upgraded
                    } else {
                        Phase::StartLine
                    };
                    return Ok(Some(InboundEvent::Last(LastContent::Empty)));
                }
                Phase::Upgraded | Phase::Failed => return Ok(None),
            }
        }
    }

    /// データ不足のときの戻り値
    ///
    /// EOF 後にメッセージの途中で止まっていればエラー
    fn need_more(&self, at_boundary: bool) -> Result<Option<InboundEvent>, DecodeError> {
        if self.eof && !at_boundary {
            return Err(DecodeError::UnexpectedEof);
        }
        Ok(None)
    }

    /// CRLF で終わる行を取り出す
    fn take_line(&mut self, limit: usize, chunk: bool) -> Result<Option<String>, DecodeError> {
        let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") else {
            if self.buf.len() > limit {
                return Err(line_too_long(self.buf.len(), limit, chunk));
            }
            return Ok(None);
        };
        if pos > limit {
            return Err(line_too_long(pos, limit, chunk));
        }
        let line = self.buf.split_to(pos + 2);
        let line = std::str::from_utf8(&line[..pos])
            .map_err(|e| DecodeError::InvalidData(format!("invalid UTF-8: {e}")))?;
        Ok(Some(line.to_string()))
    }

    /// ヘッダー完了時にボディの読み方を決めてヘッドを組み立てる
    ///
    /// 101 以外の 1xx は読み捨てて `None` を返す
    fn finish_head(&mut self) -> Result<Option<ResponseHead>, DecodeError> {
        let (version, status_code, reason_phrase) = self
            .start_line
            .take()
            .ok_or_else(|| DecodeError::InvalidData("missing status line".to_string()))?;
        let headers = std::mem::take(&mut self.headers);

        if (100..200).contains(&status_code) && status_code != 101 {
            self.phase = Phase::StartLine;
            return Ok(None);
        }

        // RFC 9112 Section 6.3 の優先順位
        let no_body = self.expect_no_body || matches!(status_code, 101 | 204 | 304);
        self.phase = if no_body {
            Phase::EndOfMessage
        } else {
            match resolve_body_headers(&headers)? {
                (true, _) => Phase::ChunkSize,
                (false, Some(0)) => Phase::EndOfMessage,
                (false, Some(len)) => Phase::Fixed { remaining: len },
                (false, None) => Phase::CloseDelimited,
            }
        };
        self.upgrade = status_code == 101;

        Ok(Some(ResponseHead {
            version,
            status_code,
            reason_phrase,
            headers,
        }))
    }
}

fn line_too_long(size: usize, limit: usize, chunk: bool) -> DecodeError {
    if chunk {
        DecodeError::ChunkLineTooLong { size, limit }
    } else {
        DecodeError::HeaderLineTooLong { size, limit }
    }
}

/// VERSION SP STATUS-CODE SP REASON-PHRASE
fn parse_status_line(line: &str) -> Result<(Version, u16, String), DecodeError> {
    let mut parts = line.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::Http11,
        Some("HTTP/1.0") => Version::Http10,
        _ => {
            return Err(DecodeError::InvalidData(format!(
                "invalid status line: {}",
                line
            )));
        }
    };
    let code = parts.next().unwrap_or("");
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecodeError::InvalidData(format!(
            "invalid status code: {}",
            code
        )));
    }
    let status_code: u16 = code
        .parse()
        .map_err(|_| DecodeError::InvalidData(format!("invalid status code: {}", code)))?;
    if !(100..=599).contains(&status_code) {
        return Err(DecodeError::InvalidData(format!(
            "invalid status code: {}",
            code
        )));
    }
    let reason = parts.next().unwrap_or("");
    if !reason.bytes().all(is_field_vchar) {
        return Err(DecodeError::InvalidData(
            "invalid reason phrase".to_string(),
        ));
    }
    Ok((version, status_code, reason.to_string()))
}

/// ヘッダー行をパース
fn parse_header_line(line: &str) -> Result<(String, String), DecodeError> {
    if line.starts_with(' ') || line.starts_with('\t') {
        return Err(DecodeError::InvalidData(
            "invalid header line: obs-fold".to_string(),
        ));
    }
    let (name, value) = line.split_once(':').ok_or_else(|| {
        DecodeError::InvalidData("invalid header line: missing colon".to_string())
    })?;
    if name.is_empty() || !name.bytes().all(is_token_char) {
        return Err(DecodeError::InvalidData(
            "invalid header line: invalid name".to_string(),
        ));
    }
    let value = value.trim();
    if !value.bytes().all(is_field_vchar) {
        return Err(DecodeError::InvalidData(
            "invalid header line: invalid value".to_string(),
        ));
    }
    Ok((name.to_string(), value.to_string()))
}

/// (chunked かどうか, Content-Length)
fn resolve_body_headers(headers: &Headers) -> Result<(bool, Option<usize>), DecodeError> {
    let mut chunked = false;
    for token in headers
        .get_all("Transfer-Encoding")
        .into_iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
    {
        if chunked {
            // chunked は最後のコーディングでなければならない (RFC 9112 Section 6.1)
            return Err(DecodeError::InvalidData(
                "invalid Transfer-Encoding: chunked is not last".to_string(),
            ));
        }
        if token.eq_ignore_ascii_case("chunked") {
            chunked = true;
        } else if !token.eq_ignore_ascii_case("identity") {
            return Err(DecodeError::InvalidData(format!(
                "invalid Transfer-Encoding: unsupported coding {}",
                token
            )));
        }
    }

    let mut content_length: Option<usize> = None;
    for raw in headers.get_all("Content-Length") {
        let raw = raw.trim();
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DecodeError::InvalidData(
                "invalid Content-Length: not a number".to_string(),
            ));
        }
        let parsed: usize = raw
            .parse()
            .map_err(|_| DecodeError::InvalidData("invalid Content-Length: overflow".to_string()))?;
        if content_length.is_some_and(|prev| prev != parsed) {
            return Err(DecodeError::InvalidData(
                "invalid Content-Length: mismatched values".to_string(),
            ));
        }
        content_length = Some(parsed);
    }

    if chunked && content_length.is_some() {
        return Err(DecodeError::InvalidData(
            "invalid message: both Transfer-Encoding and Content-Length".to_string(),
        ));
    }
    Ok((chunked, content_length))
}

fn is_token_char(b: u8) -> bool {
    matches!(
        b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'0'..=b'9' | b'A'..=b'Z' | b'^' | b'_' | b'`' | b'a'..=b'z' | b'|' | b'~'
    )
}

/// RFC 9110 Section 5.5
fn is_field_vchar(b: u8) -> bool {
    matches!(b, 0x09 | 0x20..=0x7E | 0x80..=0xFF)
}
