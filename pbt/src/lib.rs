//! PBT テスト共通ユーティリティ

use proptest::prelude::*;

// ========================================
// レスポンス生成
// ========================================

/// レスポンスボディ (0-512 バイト)
pub fn body_bytes() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..512)
}

/// ステータスコード (100-199 は除く)
pub fn final_status() -> impl Strategy<Value = u16> {
    200u16..600
}

/// URI パス
pub fn uri_path() -> impl Strategy<Value = String> {
    "(/[a-z0-9]{1,8}){1,3}".prop_map(|s| s)
}

/// Content-Length で区切ったレスポンスを組み立てる
pub fn fixed_response(status: u16, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} Status\r\nContent-Length: {}\r\n\r\n",
        status,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// chunked のレスポンスを組み立てる (チャンクサイズは `chunk` バイト)
pub fn chunked_response(status: u16, body: &[u8], chunk: usize) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} Status\r\nTransfer-Encoding: chunked\r\n\r\n",
        status
    )
    .into_bytes();
    for piece in body.chunks(chunk.max(1)) {
        out.extend_from_slice(format!("{:x}\r\n", piece.len()).as_bytes());
        out.extend_from_slice(piece);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

/// 入力を `cuts` の位置で分割する
pub fn split_at_points(input: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut points: Vec<usize> = cuts
        .iter()
        .map(|c| if input.is_empty() { 0 } else { c % input.len() })
        .collect();
    points.sort_unstable();
    points.dedup();

    let mut pieces = Vec::new();
    let mut start = 0;
    for point in points {
        if point > start {
            pieces.push(input[start..point].to_vec());
            start = point;
        }
    }
    pieces.push(input[start..].to_vec());
    pieces
}
