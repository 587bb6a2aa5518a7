use rstest::rstest;

use icap_filter::parser::encapsulated::parse_encapsulated_value;
use icap_filter::{EncapsulationKind, Method, ParseErrorKind, parse_request};

fn reqmod(encapsulated: &str, area: &[u8]) -> Vec<u8> {
    let mut raw = format!(
        "REQMOD icap://icap-server.net/server?arg=87 ICAP/1.0\r\n\
         Host: icap-server.net\r\n\
         Encapsulated: {encapsulated}\r\n\
         \r\n"
    )
    .into_bytes();
    raw.extend_from_slice(area);
    raw
}

#[test]
fn embedded_request_header_block_is_extracted() {
    let head = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
    let mut block = head.to_vec();
    block.resize(170, b'.');

    let req = parse_request(&reqmod("req-hdr=0, null-body=170", &block)).expect("parse");

    assert_eq!(req.method, Method::ReqMod);
    assert_eq!(req.headers.get("Host"), Some("icap-server.net"));
    assert_eq!(req.encapsulations.len(), 1);
    let enc = &req.encapsulations[0];
    assert_eq!(enc.kind, EncapsulationKind::RequestHeader);
    assert_eq!(enc.data.len(), 170);
    assert!(enc.data.starts_with(b"GET / HTTP/1.1"));

    let http = enc.http_request().expect("embedded GET");
    assert_eq!(http.method(), &http::Method::GET);
    assert_eq!(http.headers()["host"], "x");
}

#[test]
fn null_body_alone_yields_no_encapsulations() {
    let req = parse_request(&reqmod("null-body=0", b"")).expect("parse");
    assert!(req.encapsulations.is_empty());
}

#[test]
fn continuation_lines_fold_into_one_value() {
    let raw = b"OPTIONS icap://h/svc ICAP/1.0\r\n\
                X-Note: alpha\r\n\
                \t beta\r\n \
                gamma  \r\n\
                Host: h\r\n\r\n";
    let req = parse_request(raw).expect("parse");
    let value = req.headers.get("X-Note").expect("header");
    assert_eq!(value, "alpha\t beta gamma");
    assert!(!value.contains(['\r', '\n']));
    assert_eq!(req.headers.len(), 2);
}

#[rstest]
#[case("PUT")]
#[case("GET")]
#[case("reqmod")]
fn unknown_methods_yield_no_message(#[case] method: &str) {
    let raw = format!("{method} icap://h/svc ICAP/1.0\r\nHost: h\r\n\r\n");
    let err = parse_request(raw.as_bytes()).unwrap_err();
    assert_eq!(err.kind, ParseErrorKind::InvalidMethod);
    assert_eq!(err.raw, raw);
}

#[rstest]
#[case("req-hdr=0, null-body=170")]
#[case("req-hdr=0, res-hdr=137, res-body=296")]
#[case("res-body=50, req-hdr=0, res-hdr=20")]
#[case("opt-body=0")]
fn encapsulated_ranges_are_contiguous(#[case] value: &str) {
    let ranges = parse_encapsulated_value(value).expect("parse");
    for pair in ranges.windows(2) {
        assert!(pair[0].start <= pair[1].start);
        assert_eq!(pair[0].end, Some(pair[1].start));
        if let Some(last) = pair[0].last_byte() {
            assert_eq!(last + 1, pair[1].start);
        }
    }
    assert!(ranges.last().expect("non-empty").is_open());
}

#[test]
fn respmod_with_all_sections() {
    let req_hdr = b"GET /a HTTP/1.1\r\nHost: origin\r\n\r\n".to_vec();
    let res_hdr = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n".to_vec();
    let body = b"4\r\n<p/>\r\n0; ieof\r\n\r\n".to_vec();

    let enc = format!(
        "req-hdr=0, res-hdr={}, res-body={}",
        req_hdr.len(),
        req_hdr.len() + res_hdr.len()
    );
    let mut area = req_hdr.clone();
    area.extend_from_slice(&res_hdr);
    area.extend_from_slice(&body);

    let raw = reqmod(&enc, &area);
    let raw = [b"RESPMOD".as_slice(), &raw[b"REQMOD".len()..]].concat();
    let req = parse_request(&raw).expect("parse");

    assert_eq!(req.method, Method::RespMod);
    assert_eq!(req.uri, "icap://icap-server.net/server?arg=87");
    let kinds: Vec<_> = req.encapsulations.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        [
            EncapsulationKind::RequestHeader,
            EncapsulationKind::ResponseHeader,
            EncapsulationKind::ResponseBody,
        ]
    );
    assert_eq!(req.encapsulations[0].data, req_hdr);
    assert_eq!(req.encapsulations[2].data, body);

    let http = req.encapsulations[1].http_response().expect("embedded response");
    assert_eq!(http.status(), http::StatusCode::OK);
}
