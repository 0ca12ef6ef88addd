#![no_main]

use http11_exchange::codec::ResponseDecoder;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // 一括でデコード
    let mut decoder = ResponseDecoder::new();
    if decoder.feed(data).is_ok() {
        let _ = decoder.decode_all();
        decoder.mark_eof();
        let _ = decoder.decode_all();
    }

    // HEAD リクエストへのレスポンスとしてデコード
    let mut decoder = ResponseDecoder::new();
    decoder.set_expect_no_body(true);
    if decoder.feed(data).is_ok() {
        let _ = decoder.decode_all();
    }

    // データを分割して feed (ストリーミングシナリオ)
    let mut decoder = ResponseDecoder::new();
    for chunk in data.chunks(23) {
        if decoder.feed(chunk).is_err() {
            return;
        }
        let _ = decoder.decode_all();
    }
    decoder.mark_eof();
    let _ = decoder.decode_all();
    let _ = decoder.take_remaining();
});
