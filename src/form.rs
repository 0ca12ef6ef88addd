//! フォームボディ (application/x-www-form-urlencoded / multipart/form-data)
//!
//! [`FormBuilder`] で属性とファイルを並べ、[`FormBuilder::finalize`] で
//! リクエストヘッダーを確定させて [`FormBody`] を作る。
//! [`FormBody`] は chunk_size 以下の断片を順に返し、終了・エラー・破棄のどれでも
//! 一時ファイルの後始末を 1 度だけ行う。
//!
//! ```rust
//! use http11_exchange::form::FormBuilder;
//! use http11_exchange::OutboundRequest;
//!
//! let mut request = OutboundRequest::new("POST", "/login");
//! let mut builder = FormBuilder::new();
//! builder.attr("user", "john doe").attr("lang", "ja");
//! let mut body = builder.finalize(&mut request).unwrap();
//!
//! assert_eq!(
//!     request.headers.get("Content-Type"),
//!     Some("application/x-www-form-urlencoded")
//! );
//! assert_eq!(body.next_chunk().unwrap().unwrap().as_ref(), b"user=john+doe&lang=ja");
//! assert!(body.next_chunk().unwrap().is_none());
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use tempfile::NamedTempFile;

use crate::codec::DEFAULT_CHUNK_SIZE;
use crate::request::OutboundRequest;

/// メモリに置くファイルデータの上限 (これを超えると一時ファイルに書き出す)
pub const DEFAULT_MIN_SIZE: usize = 16 * 1024;

/// フォームエラー
#[derive(Debug)]
pub enum FormError {
    /// ファイルまたは一時ストレージの I/O エラー
    Io(io::Error),
    /// 空のフィールド名
    InvalidName,
    /// ビルダーのコールバックが返したエラー
    Custom(String),
}

impl fmt::Display for FormError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormError::Io(e) => write!(f, "form I/O error: {}", e),
            FormError::InvalidName => write!(f, "empty form field name"),
            FormError::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for FormError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FormError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FormError {
    fn from(e: io::Error) -> Self {
        FormError::Io(e)
    }
}

/// 属性値のパーセントエンコード方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UrlEncoding {
    /// 空白を `+` にする (HTML フォームと同じ)
    #[default]
    Rfc1738,
    /// 空白を `%20` にし、`~` を残す
    Rfc3986,
}

/// ファイルデータの置き場所を決める
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFactory {
    /// これ以下のサイズはメモリに置く
    pub min_size: usize,
}

impl Default for DataFactory {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
        }
    }
}

#[derive(Debug)]
enum FileSource {
    Path(PathBuf),
    Memory(Bytes),
    /// TempStorage 内のインデックス
    Temp(usize),
}

#[derive(Debug)]
enum Part {
    Attr {
        name: String,
        value: String,
    },
    File {
        name: String,
        filename: String,
        content_type: String,
        source: FileSource,
    },
}

/// 一時ファイルの置き場
#[derive(Debug, Default)]
pub struct TempStorage {
    files: Vec<NamedTempFile>,
}

impl TempStorage {
    fn store(&mut self, data: &[u8]) -> Result<usize, FormError> {
        let mut file = NamedTempFile::new()?;
        file.write_all(data)?;
        file.flush()?;
        self.files.push(file);
        Ok(self.files.len() - 1)
    }

    fn path(&self, index: usize) -> Option<&Path> {
        self.files.get(index).map(|f| f.path())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// 一時ファイルをすべて削除
    fn clean(&mut self) {
        for file in self.files.drain(..) {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to remove form temp file"
                );
            }
        }
    }
}

#[derive(Debug, Default)]
struct CleanupState {
    runs: AtomicUsize,
    done: AtomicBool,
}

/// 後始末の実行回数を外から確認するためのハンドル
#[derive(Debug, Clone)]
pub struct CleanupTracker {
    state: Arc<CleanupState>,
}

impl CleanupTracker {
    /// 後始末が実行された回数
    pub fn runs(&self) -> usize {
        self.state.runs.load(Ordering::Acquire)
    }

    pub fn is_clean(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }
}

/// 一時ストレージの後始末を 1 度だけ行う
///
/// `run()` を呼ばずに破棄されたときは Drop で実行する。
#[derive(Debug)]
pub struct CleanupGuard {
    storage: TempStorage,
    state: Arc<CleanupState>,
}

impl CleanupGuard {
    fn new(storage: TempStorage) -> Self {
        Self {
            storage,
            state: Arc::new(CleanupState::default()),
        }
    }

    pub fn tracker(&self) -> CleanupTracker {
        CleanupTracker {
            state: self.state.clone(),
        }
    }

    /// 後始末を実行し、今回の呼び出しで実行したかどうかを返す
    pub fn run(&mut self) -> bool {
        if self
            .state
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.storage.clean();
        self.state.runs.fetch_add(1, Ordering::AcqRel);
        true
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.run();
    }
}

/// フォームを組み立てるビルダー
///
/// ファイルを 1 つでも追加すると multipart になる。
#[derive(Debug)]
pub struct FormBuilder {
    parts: Vec<Part>,
    multipart: bool,
    encoding: UrlEncoding,
    chunk_size: usize,
    factory: DataFactory,
    storage: TempStorage,
}

impl Default for FormBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FormBuilder {
    pub fn new() -> Self {
        Self {
            parts: Vec::new(),
            multipart: false,
            encoding: UrlEncoding::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            factory: DataFactory::default(),
            storage: TempStorage::default(),
        }
    }

    /// 属性を追加
    pub fn attr(&mut self, name: &str, value: &str) -> &mut Self {
        self.parts.push(Part::Attr {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    /// ファイルを追加 (Content-Type: application/octet-stream)
    pub fn file(&mut self, name: &str, path: impl AsRef<Path>) -> &mut Self {
        let path = path.as_ref();
        let filename = file_name(path);
        self.file_with(name, &filename, path, "application/octet-stream")
    }

    /// テキストファイルを追加 (Content-Type: text/plain)
    pub fn text_file(&mut self, name: &str, path: impl AsRef<Path>) -> &mut Self {
        let path = path.as_ref();
        let filename = file_name(path);
        self.file_with(name, &filename, path, "text/plain")
    }

    /// ファイル名と Content-Type を指定してファイルを追加
    pub fn file_with(
        &mut self,
        name: &str,
        filename: &str,
        path: impl AsRef<Path>,
        content_type: &str,
    ) -> &mut Self {
        self.parts.push(Part::File {
            name: name.to_string(),
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            source: FileSource::Path(path.as_ref().to_path_buf()),
        });
        self
    }

    /// 同じ名前で複数のファイルを追加
    pub fn files<P: AsRef<Path>>(&mut self, name: &str, paths: &[P]) -> &mut Self {
        for path in paths {
            self.file(name, path);
        }
        self
    }

    /// メモリ上のデータをファイルとして追加
    ///
    /// データが閾値を超える場合は一時ファイルに書き出す
    pub fn file_bytes(
        &mut self,
        name: &str,
        filename: &str,
        content_type: &str,
        data: impl Into<Bytes>,
    ) -> Result<&mut Self, FormError> {
        let data = data.into();
        let source = if data.len() > self.factory.min_size {
            FileSource::Temp(self.storage.store(&data)?)
        } else {
            FileSource::Memory(data)
        };
        self.parts.push(Part::File {
            name: name.to_string(),
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            source,
        });
        Ok(self)
    }

    /// multipart を強制する
    pub fn multipart(&mut self, multipart: bool) -> &mut Self {
        self.multipart = multipart;
        self
    }

    pub fn encoding(&mut self, encoding: UrlEncoding) -> &mut Self {
        self.encoding = encoding;
        self
    }

    /// 1 回の書き込みサイズ (デフォルト: 8KB)
    pub fn chunk_size(&mut self, chunk_size: usize) -> &mut Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn factory(&mut self, factory: DataFactory) -> &mut Self {
        self.factory = factory;
        self
    }

    pub fn is_multipart(&self) -> bool {
        self.multipart
            || self
                .parts
                .iter()
                .any(|part| matches!(part, Part::File { .. }))
    }

    /// 一時ファイルの数
    pub fn temp_file_count(&self) -> usize {
        self.storage.len()
    }

    /// Content-Type を確定させてボディを作る
    ///
    /// 失敗した場合も一時ファイルは削除される
    pub fn finalize(self, request: &mut OutboundRequest) -> Result<FormBody, FormError> {
        let multipart = self.is_multipart();
        let FormBuilder {
            parts,
            encoding,
            chunk_size,
            storage,
            ..
        } = self;
        let mut guard = CleanupGuard::new(storage);

        let built = if multipart {
            build_multipart(&parts, &guard.storage)
        } else {
            build_urlencoded(&parts, encoding)
        };
        let (content_type, segments) = match built {
            Ok(built) => built,
            Err(e) => {
                guard.run();
                return Err(e);
            }
        };

        let total = segments.iter().map(Segment::len).sum();
        request.headers.set("Content-Type", &content_type);

        Ok(FormBody {
            segments: segments.into(),
            reader: None,
            total,
            written: 0,
            chunk_size,
            multipart,
            guard,
        })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Debug)]
enum Segment {
    Bytes(Bytes),
    File { path: PathBuf, len: u64 },
}

impl Segment {
    fn len(&self) -> u64 {
        match self {
            Segment::Bytes(b) => b.len() as u64,
            Segment::File { len, .. } => *len,
        }
    }
}

fn build_urlencoded(
    parts: &[Part],
    encoding: UrlEncoding,
) -> Result<(String, Vec<Segment>), FormError> {
    let mut body = String::new();
    for part in parts {
        if let Part::Attr { name, value } = part {
            if name.is_empty() {
                return Err(FormError::InvalidName);
            }
            if !body.is_empty() {
                body.push('&');
            }
            body.push_str(&url_encode(name, encoding));
            body.push('=');
            body.push_str(&url_encode(value, encoding));
        }
    }
    Ok((
        "application/x-www-form-urlencoded".to_string(),
        vec![Segment::Bytes(Bytes::from(body))],
    ))
}

fn build_multipart(
    parts: &[Part],
    storage: &TempStorage,
) -> Result<(String, Vec<Segment>), FormError> {
    let boundary = generate_boundary()?;
    let mut segments = Vec::new();
    let mut buf = BytesMut::new();

    for part in parts {
        buf.extend_from_slice(b"--");
        buf.extend_from_slice(boundary.as_bytes());
        buf.extend_from_slice(b"\r\n");
        match part {
            Part::Attr { name, value } => {
                if name.is_empty() {
                    return Err(FormError::InvalidName);
                }
                buf.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                        quote(name)
                    )
                    .as_bytes(),
                );
                buf.extend_from_slice(value.as_bytes());
            }
            Part::File {
                name,
                filename,
                content_type,
                source,
            } => {
                if name.is_empty() {
                    return Err(FormError::InvalidName);
                }
                buf.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        quote(name),
                        quote(filename),
                        content_type
                    )
                    .as_bytes(),
                );
                match source {
                    FileSource::Memory(data) => buf.extend_from_slice(data),
                    FileSource::Path(path) => {
                        let len = std::fs::metadata(path)?.len();
                        segments.push(Segment::Bytes(buf.split().freeze()));
                        segments.push(Segment::File {
                            path: path.clone(),
                            len,
                        });
                    }
                    FileSource::Temp(index) => {
                        let path = storage.path(*index).ok_or_else(|| {
                            FormError::Io(io::Error::new(
                                io::ErrorKind::NotFound,
                                "form temp file is gone",
                            ))
                        })?;
                        let len = std::fs::metadata(path)?.len();
                        segments.push(Segment::Bytes(buf.split().freeze()));
                        segments.push(Segment::File {
                            path: path.to_path_buf(),
                            len,
                        });
                    }
                }
            }
        }
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"--");
    buf.extend_from_slice(boundary.as_bytes());
    buf.extend_from_slice(b"--\r\n");
    segments.push(Segment::Bytes(buf.freeze()));
    segments.retain(|s| s.len() > 0);

    Ok((
        format!("multipart/form-data; boundary={}", boundary),
        segments,
    ))
}

fn generate_boundary() -> Result<String, FormError> {
    let mut random = [0u8; 8];
    getrandom::getrandom(&mut random).map_err(|e| FormError::Io(io::Error::other(e.to_string())))?;
    let hex: String = random.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!("----FormBoundary{}", hex))
}

fn quote(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// application/x-www-form-urlencoded のパーセントエンコード
pub fn url_encode(s: &str, encoding: UrlEncoding) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match (b, encoding) {
            (b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_', _) => {
                out.push(b as char)
            }
            (b'*', UrlEncoding::Rfc1738) | (b'~', UrlEncoding::Rfc3986) => out.push(b as char),
            (b' ', UrlEncoding::Rfc1738) => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// 送信中のフォームボディ
///
/// 破棄されると後始末が走るので、途中でキャンセルしても一時ファイルは残らない。
#[derive(Debug)]
pub struct FormBody {
    segments: VecDeque<Segment>,
    reader: Option<(File, u64)>,
    total: u64,
    written: u64,
    chunk_size: usize,
    multipart: bool,
    guard: CleanupGuard,
}

impl FormBody {
    /// ボディ全体の長さ
    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// ここまでに返したバイト数
    pub fn progress(&self) -> u64 {
        self.written
    }

    pub fn is_multipart(&self) -> bool {
        self.multipart
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn tracker(&self) -> CleanupTracker {
        self.guard.tracker()
    }

    /// 次の断片を取り出す
    ///
    /// 最後まで読むと `None` を返し、後始末を行う。エラー時も後始末してからエラーを返す。
    pub fn next_chunk(&mut self) -> Result<Option<Bytes>, FormError> {
        match self.read_next() {
            Ok(Some(chunk)) => {
                self.written += chunk.len() as u64;
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.finish();
                Ok(None)
            }
            Err(e) => {
                self.finish();
                Err(e)
            }
        }
    }

    /// 後始末を行う
    pub fn finish(&mut self) {
        self.reader = None;
        self.segments.clear();
        self.guard.run();
    }

    fn read_next(&mut self) -> Result<Option<Bytes>, FormError> {
        loop {
            if let Some((file, remaining)) = self.reader.as_mut() {
                if *remaining > 0 {
                    let want = (*remaining).min(self.chunk_size as u64) as usize;
                    let mut buf = vec![0u8; want];
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        return Err(FormError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "form file shrank while sending",
                        )));
                    }
                    buf.truncate(n);
                    *remaining -= n as u64;
                    return Ok(Some(Bytes::from(buf)));
                }
                self.reader = None;
            }

            match self.segments.pop_front() {
                None => return Ok(None),
                Some(Segment::Bytes(mut data)) => {
                    if data.len() > self.chunk_size {
                        let head = data.split_to(self.chunk_size);
                        self.segments.push_front(Segment::Bytes(data));
                        return Ok(Some(head));
                    }
                    return Ok(Some(data));
                }
                Some(Segment::File { path, len }) => {
                    self.reader = Some((File::open(&path)?, len));
                }
            }
        }
    }
}
