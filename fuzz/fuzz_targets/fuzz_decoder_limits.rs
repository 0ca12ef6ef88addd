#![no_main]

use arbitrary::Arbitrary;
use http11_exchange::DecoderLimits;
use http11_exchange::codec::ResponseDecoder;
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct FuzzLimits {
    max_buffer_size: u16,
    max_headers_count: u16,
    max_header_line_size: u16,
    max_chunk_line_size: u8,
    data: Vec<u8>,
}

fn build_limits(input: &FuzzLimits) -> DecoderLimits {
    DecoderLimits {
        max_buffer_size: input.max_buffer_size as usize,
        max_headers_count: input.max_headers_count as usize,
        max_header_line_size: input.max_header_line_size as usize,
        max_chunk_line_size: input.max_chunk_line_size as usize,
    }
}

fuzz_target!(|input: FuzzLimits| {
    let limits = build_limits(&input);

    let mut decoder = ResponseDecoder::with_limits(limits);
    let _ = decoder.feed(&input.data);
    let _ = decoder.decode_all();
});
