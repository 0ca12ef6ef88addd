//! エクスチェンジのプロパティテスト

use bytes::Bytes;
use http11_exchange::{
    ConnectionContext, ConnectionMode, Continuation, Exchange, ExchangeListener, ExchangeOptions,
    MAX_REDIRECTS, MemoryTransport, ReceiveError, RedirectChain, ResponseState,
};
use pbt::{body_bytes, chunked_response, final_status, fixed_response, split_at_points, uri_path};
use proptest::prelude::*;

#[derive(Default)]
struct Recorder {
    statuses: Vec<u16>,
    data: Vec<u8>,
    errors: Vec<ReceiveError>,
    terminated: usize,
}

impl ExchangeListener for Recorder {
    fn on_start(&mut self, response: &ResponseState) {
        self.statuses.push(response.status());
    }

    fn on_data(&mut self, data: Bytes) {
        self.data.extend_from_slice(&data);
    }

    fn on_receive_error(&mut self, error: ReceiveError) {
        self.errors.push(error);
    }

    fn on_terminate(&mut self) {
        self.terminated += 1;
    }
}

fn http_mode(transport: &mut MemoryTransport) -> ConnectionMode {
    ConnectionMode::Http(Exchange::bind(transport))
}

/// 送信したリクエストのヘッダー部分
fn written_head(transport: &mut MemoryTransport) -> String {
    let written = transport.take_written();
    let text = String::from_utf8_lossy(&written).into_owned();
    text.split("\r\n\r\n").next().unwrap_or_default().to_string()
}

fn header_lines<'a>(head: &'a str, name: &str) -> Vec<&'a str> {
    head.split("\r\n")
        .skip(1)
        .filter(|line| {
            line.split(':')
                .next()
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
        .collect()
}

// ========================================
// 送信フラグ
// ========================================

#[derive(Debug, Clone, Copy)]
enum Mark {
    Headers,
    Body,
    HeadersAndBody,
}

fn mark() -> impl Strategy<Value = Mark> {
    prop_oneof![
        Just(Mark::Headers),
        Just(Mark::Body),
        Just(Mark::HeadersAndBody),
    ]
}

proptest! {
    /// ヘッダー送信済みへの遷移はどんな順序でも 1 度だけ成功する
    #[test]
    fn prop_headers_transition_once(marks in proptest::collection::vec(mark(), 1..20)) {
        let mut transport = MemoryTransport::new();
        let exchange = Exchange::bind(&mut transport);

        let mut header_transitions = 0;
        for m in marks {
            let before = exchange.has_sent_headers();
            let ok = match m {
                Mark::Headers => exchange.mark_sent_headers(),
                Mark::Body => exchange.mark_sent_body(),
                Mark::HeadersAndBody => exchange.mark_sent_header_and_body(),
            };
            if ok && !before && exchange.has_sent_headers() {
                header_transitions += 1;
            }
        }
        prop_assert!(header_transitions <= 1);
    }

    /// 送信後はリクエストを変更できない
    #[test]
    fn prop_mutation_after_send_fails(path in uri_path()) {
        let mut transport = MemoryTransport::new();
        let mut exchange = Exchange::bind(&mut transport);
        prop_assert!(exchange.mark_sent_headers());

        prop_assert!(exchange.set_uri(&path).is_err());
        prop_assert!(exchange.header("X-Test", "1").is_err());
        prop_assert!(exchange.set_method("POST").is_err());
        prop_assert_eq!(exchange.uri(), "/");
    }
}

// ========================================
// リクエストヘッダー
// ========================================

proptest! {
    /// GET のボディは何回に分けて渡しても Content-Length = N で送られ Transfer-Encoding は付かない
    #[test]
    fn prop_get_body_content_length(
        body in body_bytes(),
        cuts in proptest::collection::vec(any::<usize>(), 0..6),
    ) {
        let mut transport = MemoryTransport::new();
        let mut exchange = Exchange::bind(&mut transport);
        for piece in split_at_points(&body, &cuts) {
            exchange.buffer_content(&piece).unwrap();
        }
        exchange.on_outbound_complete(&mut transport);

        let head = written_head(&mut transport);
        let content_length = format!("Content-Length: {}", body.len());
        prop_assert_eq!(header_lines(&head, "Content-Length"), vec![content_length.as_str()]);
        prop_assert!(header_lines(&head, "Transfer-Encoding").is_empty());
    }

    /// chunked を何度切り替えても Transfer-Encoding は高々 1 つ
    #[test]
    fn prop_chunked_toggle_single_header(
        toggles in proptest::collection::vec(any::<bool>(), 1..10),
    ) {
        let mut transport = MemoryTransport::new();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.set_method("POST").unwrap();
        for &chunked in &toggles {
            exchange.chunked_transfer(chunked);
        }
        exchange
            .send_content(&mut transport, Bytes::from_static(b"payload"))
            .unwrap();

        let head = written_head(&mut transport);
        let expected = usize::from(*toggles.last().unwrap());
        prop_assert_eq!(header_lines(&head, "Transfer-Encoding").len(), expected);
    }
}

// ========================================
// レスポンス
// ========================================

proptest! {
    /// 2 つ目のレスポンスは最初のレスポンスを置き換えない
    #[test]
    fn prop_first_response_wins(first in 200u16..300, second in final_status()) {
        let mut transport = MemoryTransport::new();
        let mut mode = http_mode(&mut transport);
        let mut listener = Recorder::default();
        mode.on_outbound_complete(&mut transport);

        let mut input = fixed_response(first, b"one");
        input.extend_from_slice(&fixed_response(second, b"two"));
        transport.receive(&mut mode, &mut listener, &input);

        let exchange = mode.exchange().unwrap();
        prop_assert_eq!(exchange.status(), Some(first));
        prop_assert_eq!(listener.statuses, vec![first]);
        prop_assert_eq!(listener.terminated, 1);
    }

    /// 受信したバイト列の区切り方によらず同じボディが届く
    #[test]
    fn prop_split_invariance(
        body in body_bytes(),
        chunk in 1usize..64,
        chunked in any::<bool>(),
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
    ) {
        let input = if chunked {
            chunked_response(200, &body, chunk)
        } else {
            fixed_response(200, &body)
        };

        let mut transport = MemoryTransport::new();
        let mut mode = http_mode(&mut transport);
        let mut listener = Recorder::default();
        mode.on_outbound_complete(&mut transport);
        for piece in split_at_points(&input, &cuts) {
            transport.receive(&mut mode, &mut listener, &piece);
        }

        prop_assert_eq!(listener.statuses, vec![200]);
        prop_assert_eq!(listener.data, body);
        prop_assert_eq!(listener.terminated, 1);
        prop_assert!(listener.errors.is_empty());
    }

    /// 5xx は fail_on_server_error のときだけ失敗として通知される
    #[test]
    fn prop_server_error_classification(status in 500u16..600, fail in any::<bool>()) {
        let mut transport = MemoryTransport::new();
        let mut mode = http_mode(&mut transport);
        let mut listener = Recorder::default();
        let exchange = mode.exchange_mut().unwrap();
        exchange.fail_on_server_error(fail);
        mode.on_outbound_complete(&mut transport);

        transport.receive(&mut mode, &mut listener, &fixed_response(status, b"oops"));

        if fail {
            prop_assert!(listener.statuses.is_empty());
            prop_assert!(listener.data.is_empty());
            prop_assert!(matches!(
                &listener.errors[..],
                [ReceiveError::ServerError(e)] if e.status() == status
            ));
        } else {
            prop_assert_eq!(listener.statuses, vec![status]);
            prop_assert_eq!(listener.data, b"oops".to_vec());
        }
        prop_assert_eq!(listener.terminated, 1);
    }
}

// ========================================
// リダイレクト
// ========================================

proptest! {
    /// 履歴が上限を超えるとリダイレクトを追従しない
    #[test]
    fn prop_follow_redirect_limit(len in 0usize..120) {
        let chain = RedirectChain::from_vec((0..len).map(|i| format!("/r{}", i)).collect());
        let context = ConnectionContext::new().with_redirect_chain(chain);
        let mut transport = MemoryTransport::with_context(context);
        let mut exchange = Exchange::bind(&mut transport);
        exchange.follow_redirect();

        prop_assert_eq!(exchange.redirect_chain().len(), len);
        prop_assert_eq!(exchange.is_follow_redirect(), len <= MAX_REDIRECTS);
    }

    /// 履歴は上限 + 1 で飽和する
    #[test]
    fn prop_redirect_chain_saturates(hops in 0usize..120) {
        let mut continuation = Continuation {
            redirect_chain: RedirectChain::new(),
            secure: false,
            options: ExchangeOptions::default().with_follow_redirect(true),
            accept_gzip: false,
        };
        for i in 0..hops {
            continuation = continuation.with_redirect(&format!("/hop{}", i));
        }
        prop_assert_eq!(continuation.redirect_chain.len(), hops.min(MAX_REDIRECTS + 1));
    }

    /// 302 は追従が有効なときだけリダイレクトとして通知される
    #[test]
    fn prop_302_depends_on_follow(follow in any::<bool>(), path in uri_path()) {
        let mut transport = MemoryTransport::new();
        let mut mode = http_mode(&mut transport);
        let mut listener = Recorder::default();
        let exchange = mode.exchange_mut().unwrap();
        if follow {
            exchange.follow_redirect();
        }
        mode.on_outbound_complete(&mut transport);

        let input = format!(
            "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\n\r\n",
            path
        );
        transport.receive(&mut mode, &mut listener, input.as_bytes());

        if follow {
            prop_assert!(listener.statuses.is_empty());
            prop_assert!(matches!(
                &listener.errors[..],
                [ReceiveError::Redirect(e)] if e.location() == Some(path.as_str())
            ));
        } else {
            prop_assert_eq!(listener.statuses, vec![302]);
            prop_assert!(listener.errors.is_empty());
        }
    }
}

// ========================================
// 先読み
// ========================================

proptest! {
    /// 要求がなければ読み込み要求はウィンドウを超えない
    #[test]
    fn prop_prefetch_bounded_by_window(window in 1u32..32, chunks in 1usize..80) {
        let context = ConnectionContext::new();
        let mut transport = MemoryTransport::with_context(context);
        let continuation = Continuation {
            redirect_chain: RedirectChain::new(),
            secure: false,
            options: ExchangeOptions::default().with_prefetch(window),
            accept_gzip: false,
        };
        let exchange = Exchange::from_continuation(&mut transport, continuation);
        let mut mode = ConnectionMode::Http(exchange);
        let mut listener = Recorder::default();
        mode.on_outbound_complete(&mut transport);
        let before = transport.read_requests();

        let body = vec![b'x'; chunks];
        let input = chunked_response(200, &body, 1);
        transport.receive(&mut mode, &mut listener, &input);

        prop_assert_eq!(listener.data.len(), chunks);
        prop_assert!(transport.read_requests() - before <= window as usize);
    }
}

// ========================================
// フォーム
// ========================================

proptest! {
    /// 途中で送信をやめても後始末は 1 度だけ行われる
    #[test]
    fn prop_form_cleanup_once(
        size in 1usize..4096,
        sent in 0usize..8,
        finish_twice in any::<bool>(),
    ) {
        let mut transport = MemoryTransport::new();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.set_method("POST").unwrap();
        let mut body = exchange
            .send_form(&mut transport, |form| {
                form.factory(http11_exchange::form::DataFactory { min_size: 0 })
                    .chunk_size(256)
                    .attr("name", "value");
                form.file_bytes("upload", "data.bin", "application/octet-stream", vec![7u8; size])?;
                Ok(())
            })
            .unwrap();
        let tracker = body.tracker();

        for _ in 0..sent {
            if exchange.send_form_chunk(&mut transport, &mut body).unwrap().is_none() {
                break;
            }
        }
        if finish_twice {
            body.finish();
            body.finish();
        }
        drop(body);

        prop_assert_eq!(tracker.runs(), 1);
        prop_assert!(tracker.is_clean());
    }

    /// 進捗は単調に増えて最後にボディ長に一致する
    #[test]
    fn prop_form_progress_reaches_total(
        values in proptest::collection::vec("[a-zA-Z0-9 &=]{0,64}", 1..8),
        chunk_size in 1usize..128,
    ) {
        let mut transport = MemoryTransport::new();
        let mut exchange = Exchange::bind(&mut transport);
        exchange.set_method("POST").unwrap();
        let mut body = exchange
            .send_form(&mut transport, |form| {
                form.chunk_size(chunk_size);
                for (i, value) in values.iter().enumerate() {
                    form.attr(&format!("k{}", i), value);
                }
                Ok(())
            })
            .unwrap();
        let total = body.len();

        let mut last = 0;
        while let Some(progress) = exchange.send_form_chunk(&mut transport, &mut body).unwrap() {
            prop_assert!(progress > last);
            prop_assert!(progress - last <= chunk_size as u64);
            last = progress;
        }
        prop_assert_eq!(last, total);
        prop_assert!(exchange.has_sent_headers());

        let head = written_head(&mut transport);
        let content_length = format!("Content-Length: {}", total);
        prop_assert_eq!(header_lines(&head, "Content-Length"), vec![content_length.as_str()]);
    }
}
