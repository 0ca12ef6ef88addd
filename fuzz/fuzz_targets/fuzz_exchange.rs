#![no_main]

use arbitrary::Arbitrary;
use http11_exchange::{
    ConnectionMode, Continuation, Exchange, ExchangeOptions, MemoryTransport, NoopListener,
    RedirectChain,
};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct FuzzExchange {
    follow_redirect: bool,
    fail_on_client_error: bool,
    fail_on_server_error: bool,
    accept_gzip: bool,
    prefetch: u8,
    split: u8,
    upgrade: bool,
    data: Vec<u8>,
}

fuzz_target!(|input: FuzzExchange| {
    let options = ExchangeOptions::default()
        .with_follow_redirect(input.follow_redirect)
        .with_fail_on_client_error(input.fail_on_client_error)
        .with_fail_on_server_error(input.fail_on_server_error)
        .with_prefetch(u32::from(input.prefetch));
    let continuation = Continuation {
        redirect_chain: RedirectChain::new(),
        secure: false,
        options,
        accept_gzip: input.accept_gzip,
    };

    let mut transport = MemoryTransport::new();
    let mut exchange = Exchange::from_continuation(&mut transport, continuation);
    let _ = exchange.header("Host", "example.com");
    let mut mode = ConnectionMode::Http(exchange);
    let mut listener = NoopListener;

    if input.upgrade {
        let _ = mode.upgrade(&mut transport, &["chat"]);
    } else {
        mode.on_outbound_complete(&mut transport);
    }

    let split = usize::from(input.split).max(1);
    for chunk in input.data.chunks(split) {
        transport.receive(&mut mode, &mut listener, chunk);
    }
    transport.receive_eof(&mut mode, &mut listener);
});
