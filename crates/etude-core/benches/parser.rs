use criterion::{Criterion, criterion_group, criterion_main};

use etude_core::parser::{ParseOutcome, RequestParser};

fn bench_parser(c: &mut Criterion) {
    let raw: &[u8] = b"GET /static/app/main.css HTTP/1.1\r\n\
                       Host: bench.example.com\r\n\
                       Connection: keep-alive\r\n\
                       Accept: text/css,*/*;q=0.1\r\n\
                       Accept-Encoding: gzip, deflate\r\n\
                       User-Agent: bench/1.0\r\n\r\n";

    c.bench_function("parse_full_request", |b| {
        let mut buf = vec![0u8; raw.len()];
        b.iter(|| {
            buf.copy_from_slice(raw);
            let mut parser = RequestParser::new();
            let outcome = parser.advance(&mut buf, raw.len());
            assert_eq!(outcome, ParseOutcome::Complete);
            std::hint::black_box(parser.keep_alive());
        })
    });

    c.bench_function("parse_resumed_request", |b| {
        let mut buf = vec![0u8; raw.len()];
        let split = raw.len() / 2;
        b.iter(|| {
            buf.copy_from_slice(raw);
            let mut parser = RequestParser::new();
            assert_eq!(parser.advance(&mut buf, split), ParseOutcome::NoRequest);
            assert_eq!(parser.advance(&mut buf, raw.len()), ParseOutcome::Complete);
        })
    });
}

criterion_group!(benches, bench_parser);
criterion_main!(benches);
