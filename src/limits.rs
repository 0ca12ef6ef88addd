/// レスポンスデコーダーの制限設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderLimits {
    /// 未処理データの最大バッファサイズ (デフォルト: 64KB)
    pub max_buffer_size: usize,
    /// 最大ヘッダー数 (デフォルト: 100)
    pub max_headers_count: usize,
    /// ステータス行とヘッダー行の最大長 (デフォルト: 8KB)
    pub max_header_line_size: usize,
    /// 最大チャンクサイズ行長 (デフォルト: 64バイト)
    ///
    /// チャンクサイズは 16 進数なので "FFFFFFFF\r\n" でも 10 バイト程度に収まる。
    pub max_chunk_line_size: usize,
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self {
            max_buffer_size: 64 * 1024,
            max_headers_count: 100,
            max_header_line_size: 8 * 1024,
            max_chunk_line_size: 64,
        }
    }
}

impl DecoderLimits {
    /// 制限なしの設定を作成
    pub fn unlimited() -> Self {
        Self {
            max_buffer_size: usize::MAX,
            max_headers_count: usize::MAX,
            max_header_line_size: usize::MAX,
            max_chunk_line_size: usize::MAX,
        }
    }
}
