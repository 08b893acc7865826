#![deny(rust_2018_idioms)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gable::{
    BodyRead, Connection, PhaseResult, Plain, ServerBlock, ServerOptions, VirtualServers,
};
use http::StatusCode;
use matches::assert_matches;

mod support;
use support::{data, mock, respond, svc, vhosts, Step};

#[tokio::test]
async fn minimal_get_http10() {
    let (io, handles) = mock(vec![data(b"GET / HTTP/1.0\r\n\r\n")]);
    let seen = Arc::new(Mutex::new(None));
    let seen2 = seen.clone();
    let (phases, logs) = svc(move |req, e| {
        let r = e.request(req);
        *seen2.lock().unwrap() = Some((
            r.method().clone(),
            r.host().map(String::from),
            r.server_name().to_string(),
        ));
        respond(e, req, b"hello")
    });

    let conn = Connection::new(Plain::new(io), vhosts(ServerOptions::default()), phases);
    conn.await.expect("clean close");

    let (method, host, server) = seen.lock().unwrap().clone().expect("handler ran");
    assert_eq!(method, http::Method::GET);
    assert_eq!(host, None, "no Host header on a 1.0 request");
    assert_eq!(server, "test", "default virtual server");

    let out = handles.written_str();
    assert!(out.starts_with("HTTP/1.0 200 OK\r\n"), "{}", out);
    assert!(out.contains("Content-Length: 5\r\n"));
    assert!(out.contains("Connection: close\r\n"), "1.0 has no keepalive");
    assert!(out.ends_with("hello"));

    let logs = logs.lock().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, Some(StatusCode::OK));
}

#[tokio::test]
async fn pipelined_requests_share_the_connection() {
    let (io, handles) = mock(vec![data(
        b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n",
    )]);
    let pipelined_flags = Arc::new(Mutex::new(Vec::new()));
    let flags = pipelined_flags.clone();
    let (phases, logs) = svc(move |req, e| {
        flags.lock().unwrap().push(e.request(req).is_pipelined());
        let body = e.request(req).path().to_vec();
        respond(e, req, &body)
    });

    let conn = Connection::new(Plain::new(io), vhosts(ServerOptions::default()), phases);
    conn.await.expect("clean close");

    let out = handles.written_str();
    let first = out.find("\r\n\r\n/a").expect("first response body");
    let second = out.find("\r\n\r\n/b").expect("second response body");
    assert!(first < second, "responses in request order:\n{}", out);
    assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);

    assert_eq!(&*pipelined_flags.lock().unwrap(), &[false, true]);
    assert_eq!(logs.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn fragmented_request_line_parses_like_one_shot() {
    let (io, handles) = mock(vec![
        data(b"GE"),
        data(b"T /foo HTT"),
        data(b"P/1.1\r\nHost: y\r\n\r\n"),
    ]);
    let seen = Arc::new(Mutex::new(None));
    let seen2 = seen.clone();
    let (phases, _logs) = svc(move |req, e| {
        let r = e.request(req);
        *seen2.lock().unwrap() = Some((r.path().to_vec(), r.host().map(String::from)));
        respond(e, req, b"ok")
    });

    let conn = Connection::new(Plain::new(io), vhosts(ServerOptions::default()), phases);
    conn.await.expect("clean close");

    let (path, host) = seen.lock().unwrap().clone().expect("handler ran");
    assert_eq!(path, b"/foo");
    assert_eq!(host.as_deref(), Some("y"));
    assert!(handles.written_str().contains("200 OK"));
}

#[tokio::test]
async fn large_header_moves_to_large_buffer() {
    let mut opts = ServerOptions::default();
    opts.client_header_buffer_size(48)
        .large_client_header_buffers(2, 512);

    let long_value = "v".repeat(200);
    let request = format!("GET / HTTP/1.1\r\nHost: x\r\nX-Long: {}\r\n\r\n", long_value);
    let (io, handles) = mock(vec![data(request.as_bytes())]);

    let got = Arc::new(Mutex::new(None));
    let got2 = got.clone();
    let (phases, _logs) = svc(move |req, e| {
        *got2.lock().unwrap() = e.header(req, "x-long").map(|v| v.len());
        respond(e, req, b"ok")
    });

    let conn = Connection::new(Plain::new(io), vhosts(opts), phases);
    conn.await.expect("clean close");

    assert_eq!(got.lock().unwrap().unwrap(), 200);
    assert!(handles.written_str().contains("200 OK"));
}

#[tokio::test]
async fn over_long_request_line_is_414() {
    let mut opts = ServerOptions::default();
    opts.client_header_buffer_size(32)
        .large_client_header_buffers(1, 64);

    let request = format!("GET /{} HTTP/1.1\r\nHost: x\r\n\r\n", "a".repeat(120));
    let (io, handles) = mock(vec![data(request.as_bytes())]);
    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = ran.clone();
    let (phases, _logs) = svc(move |_req, _e| {
        ran2.store(true, Ordering::SeqCst);
        PhaseResult::Ok
    });

    let conn = Connection::new(Plain::new(io), vhosts(opts), phases);
    conn.await.expect("engine answered, then closed");

    assert!(!ran.load(Ordering::SeqCst), "no handler for a rejected head");
    let out = handles.written_str();
    assert!(out.starts_with("HTTP/1.1 414 URI Too Long\r\n"), "{}", out);
    assert!(out.contains("<h1>414 URI Too Long</h1>"));
}

#[tokio::test]
async fn over_long_header_is_431() {
    let mut opts = ServerOptions::default();
    opts.client_header_buffer_size(32)
        .large_client_header_buffers(1, 64);

    let request = format!("GET / HTTP/1.1\r\nX-Big: {}\r\n\r\n", "b".repeat(120));
    let (io, handles) = mock(vec![data(request.as_bytes())]);
    let (phases, _logs) = svc(move |_req, _e| PhaseResult::Ok);

    let conn = Connection::new(Plain::new(io), vhosts(opts), phases);
    conn.await.expect("engine answered, then closed");

    let out = handles.written_str();
    assert!(
        out.starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n"),
        "{}",
        out
    );
}

#[tokio::test]
async fn subrequest_output_is_depth_first_on_the_wire() {
    let (io, handles) = mock(vec![data(b"GET / HTTP/1.0\r\n\r\n")]);
    let (phases, _logs) = svc(move |req, e| {
        let path = e.request(req).path().to_vec();
        match path.as_slice() {
            b"/" => {
                e.request_mut(req).headers_out_mut().content_length = Some(5);
                if e.send_header(req).is_err() {
                    return PhaseResult::Error;
                }
                e.output(req, &b"A"[..], false).unwrap();
                e.subrequest(req, "/s1", None).unwrap();
                e.output(req, &b"D"[..], false).unwrap();
                e.subrequest(req, "/s2", None).unwrap();
                PhaseResult::Ok
            }
            b"/s1" => {
                e.output(req, &b"B"[..], false).unwrap();
                e.output(req, &b"C"[..], false).unwrap();
                PhaseResult::Ok
            }
            b"/s2" => {
                e.output(req, &b"E"[..], false).unwrap();
                PhaseResult::Ok
            }
            other => panic!("unexpected subrequest target {:?}", other),
        }
    });

    let conn = Connection::new(Plain::new(io), vhosts(ServerOptions::default()), phases);
    conn.await.expect("clean close");

    let out = handles.written_str();
    let body = out.split("\r\n\r\n").nth(1).expect("response body");
    assert_eq!(body, "ABCDE", "full response:\n{}", out);
}

#[tokio::test]
async fn response_without_length_is_chunked_on_11() {
    let (io, handles) = mock(vec![data(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")]);
    let (phases, _logs) = svc(move |req, e| {
        if e.send_header(req).is_err() {
            return PhaseResult::Error;
        }
        e.output(req, &b"hello"[..], true).unwrap();
        PhaseResult::Ok
    });

    let conn = Connection::new(Plain::new(io), vhosts(ServerOptions::default()), phases);
    conn.await.expect("clean close");

    let out = handles.written_str();
    assert!(out.contains("Transfer-Encoding: chunked\r\n"));
    assert!(out.ends_with("5\r\nhello\r\n0\r\n\r\n"), "{}", out);
}

#[tokio::test]
async fn expect_100_continue_then_body() {
    let (io, handles) = mock(vec![
        data(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n"),
        data(b"wiki"),
    ]);
    let mut collected: Vec<u8> = Vec::new();
    let (phases, _logs) = svc(move |req, e| loop {
        match e.read_body(req) {
            Ok(BodyRead::Chunk(b)) => collected.extend_from_slice(&b),
            Ok(BodyRead::Again) => return PhaseResult::Again,
            Ok(BodyRead::Eof) => {
                let body = collected.clone();
                return respond(e, req, &body);
            }
            Err(_) => return PhaseResult::Error,
        }
    });

    let conn = Connection::new(Plain::new(io), vhosts(ServerOptions::default()), phases);
    conn.await.expect("clean close");

    let out = handles.written_str();
    let continue_at = out.find("HTTP/1.1 100 Continue\r\n\r\n").expect("interim response");
    let ok_at = out.find("HTTP/1.1 200 OK").expect("final response");
    assert!(continue_at < ok_at);
    assert!(out.ends_with("wiki"));
}

#[tokio::test]
async fn trace_is_rejected_with_405() {
    let (io, handles) = mock(vec![data(b"TRACE / HTTP/1.1\r\nHost: x\r\n\r\n")]);
    let (phases, _logs) = svc(move |_req, _e| panic!("TRACE must not reach handlers"));

    let conn = Connection::new(Plain::new(io), vhosts(ServerOptions::default()), phases);
    conn.await.expect("clean close");

    assert!(handles
        .written_str()
        .starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
}

#[tokio::test]
async fn http11_without_host_is_400() {
    let (io, handles) = mock(vec![data(b"GET / HTTP/1.1\r\n\r\n")]);
    let (phases, _logs) = svc(move |_req, _e| panic!("must not reach handlers"));

    let conn = Connection::new(Plain::new(io), vhosts(ServerOptions::default()), phases);
    conn.await.expect("clean close");

    assert!(handles.written_str().starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[tokio::test]
async fn underscored_header_visibility_follows_config() {
    for (allow, expected) in [(false, None), (true, Some(5))] {
        let mut opts = ServerOptions::default();
        opts.underscores_in_headers(allow);
        let (io, _handles) = mock(vec![data(
            b"GET / HTTP/1.1\r\nHost: x\r\nX_Meta: abcde\r\n\r\n",
        )]);
        let got = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        let (phases, _logs) = svc(move |req, e| {
            *got2.lock().unwrap() = e.header(req, "x_meta").map(|v| v.len());
            respond(e, req, b"ok")
        });

        let conn = Connection::new(Plain::new(io), vhosts(opts), phases);
        conn.await.expect("clean close");
        assert_eq!(*got.lock().unwrap(), expected, "underscores={}", allow);
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_header_read_times_out() {
    let (io, handles) = mock(vec![data(b"GET /slow HT"), Step::Stall]);
    let (phases, _logs) = svc(move |_req, _e| panic!("head never completes"));

    let conn = Connection::new(Plain::new(io), vhosts(ServerOptions::default()), phases);
    let err = conn.await.expect_err("read timeout is an error");
    assert!(err.is_timeout(), "{:?}", err);
    // nothing was promised to the client
    assert_eq!(handles.written(), b"");
}

#[tokio::test(start_paused = true)]
async fn keepalive_idle_timeout_closes_quietly() {
    let (io, handles) = mock(vec![data(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"), Step::Stall]);
    let (phases, logs) = svc(move |req, e| respond(e, req, b"ok"));

    let conn = Connection::new(Plain::new(io), vhosts(ServerOptions::default()), phases);
    conn.await.expect("idle timeout is a clean close");

    assert_eq!(handles.written_str().matches("200 OK").count(), 1);
    assert_eq!(logs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn eof_mid_head_is_incomplete_message() {
    let (io, handles) = mock(vec![data(b"GET / HTT")]);
    let (phases, _logs) = svc(move |_req, _e| panic!("head never completes"));

    let conn = Connection::new(Plain::new(io), vhosts(ServerOptions::default()), phases);
    let res = conn.await;
    assert_matches!(res, Err(ref e) if e.is_incomplete_message());
    assert_eq!(handles.written(), b"");
}

#[tokio::test]
async fn oversized_body_gets_413_then_lingering_drain() {
    let (io, handles) = mock(vec![
        data(b"POST /up HTTP/1.1\r\nHost: x\r\nContent-Length: 1000\r\n\r\npartial"),
        data(b"more bytes the client already had in flight"),
    ]);
    let (phases, _logs) = svc(move |_req, _e| PhaseResult::Status(StatusCode::PAYLOAD_TOO_LARGE));

    let conn = Connection::new(Plain::new(io), vhosts(ServerOptions::default()), phases);
    conn.await.expect("lingering close is clean");

    let out = handles.written_str();
    assert!(out.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{}", out);
    assert!(out.contains("Connection: close\r\n"));
    assert!(
        handles.shutdown_called(),
        "write side must half-close before the drain"
    );
}

#[tokio::test]
async fn connection_close_header_disables_reuse() {
    let (io, handles) = mock(vec![data(
        b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )]);
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    let (phases, _logs) = svc(move |req, e| {
        calls2.fetch_add(1, Ordering::SeqCst);
        respond(e, req, b"bye")
    });

    let conn = Connection::new(Plain::new(io), vhosts(ServerOptions::default()), phases);
    conn.await.expect("clean close");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(handles.written_str().contains("Connection: close\r\n"));
}

#[tokio::test]
async fn host_header_routes_between_virtual_servers() {
    let vs = Arc::new(
        VirtualServers::builder()
            .server(ServerBlock::new("fallback", ServerOptions::default()), &[])
            .server(
                ServerBlock::new("alpha", ServerOptions::default()),
                &["alpha.test"],
            )
            .server(
                ServerBlock::new("wild", ServerOptions::default()),
                &["*.beta.test"],
            )
            .build()
            .unwrap(),
    );

    for (host, expected) in [
        ("alpha.test", "alpha"),
        ("x.beta.test", "wild"),
        ("other.example", "fallback"),
    ] {
        let request = format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", host);
        let (io, _handles) = mock(vec![data(request.as_bytes())]);
        let seen = Arc::new(Mutex::new(String::new()));
        let seen2 = seen.clone();
        let (phases, _logs) = svc(move |req, e| {
            *seen2.lock().unwrap() = e.request(req).server_name().to_string();
            respond(e, req, b"ok")
        });

        let conn = Connection::new(Plain::new(io), vs.clone(), phases);
        conn.await.expect("clean close");
        assert_eq!(&*seen.lock().unwrap(), expected, "host {}", host);
    }
}

#[tokio::test]
async fn sni_host_disagreement_is_rejected_when_verified() {
    let (io, handles) = mock(vec![data(b"GET / HTTP/1.1\r\nHost: b.test\r\n\r\n")]);
    let (phases, _logs) = svc(move |_req, _e| panic!("mismatched host must not be served"));

    let conn = gable::Builder::new(vhosts(ServerOptions::default()))
        .ssl(true)
        .tls_established(true)
        .sni_host("a.test")
        .tls_verify(true)
        .serve(Plain::new(io), phases);
    conn.await.expect("rejected with a response");

    assert!(handles
        .written_str()
        .starts_with("HTTP/1.1 421 Misdirected Request\r\n"));
}

#[tokio::test]
async fn proxy_protocol_prefix_is_stripped() {
    let (io, handles) = mock(vec![data(
        b"PROXY TCP4 198.51.100.1 203.0.113.7 49152 80\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n",
    )]);
    let seen = Arc::new(Mutex::new(None));
    let seen2 = seen.clone();
    let (phases, _logs) = svc(move |req, e| {
        *seen2.lock().unwrap() = e.proxied_addrs();
        respond(e, req, b"ok")
    });

    let conn = gable::Builder::new(vhosts(ServerOptions::default()))
        .proxy_protocol(true)
        .serve(Plain::new(io), phases);
    conn.await.expect("clean close");

    let addrs = seen.lock().unwrap().expect("PROXY addresses recorded");
    assert_eq!(addrs.src, "198.51.100.1:49152".parse().unwrap());
    assert!(handles.written_str().contains("200 OK"));
}

#[tokio::test]
async fn absolute_uri_host_beats_host_header() {
    let (io, _handles) = mock(vec![data(
        b"GET http://line.host/pp HTTP/1.1\r\nHost: header.host\r\n\r\n",
    )]);
    let seen = Arc::new(Mutex::new(None));
    let seen2 = seen.clone();
    let (phases, _logs) = svc(move |req, e| {
        let r = e.request(req);
        *seen2.lock().unwrap() = Some((r.host().map(String::from), r.path().to_vec()));
        respond(e, req, b"ok")
    });

    let conn = Connection::new(Plain::new(io), vhosts(ServerOptions::default()), phases);
    conn.await.expect("clean close");

    let (host, path) = seen.lock().unwrap().clone().expect("handler ran");
    assert_eq!(host.as_deref(), Some("line.host"));
    assert_eq!(path, b"/pp");
}

#[tokio::test]
async fn post_subrequest_callback_sees_completion() {
    let (io, handles) = mock(vec![data(b"GET / HTTP/1.0\r\n\r\n")]);
    let cb_ran = Arc::new(AtomicBool::new(false));
    let cb_flag = cb_ran.clone();
    let (phases, _logs) = svc(move |req, e| {
        let path = e.request(req).path().to_vec();
        if path == b"/" {
            e.request_mut(req).headers_out_mut().content_length = Some(4);
            if e.send_header(req).is_err() {
                return PhaseResult::Error;
            }
            e.output(req, &b"main"[..], false).unwrap();
            let flag = cb_flag.clone();
            e.subrequest(
                req,
                "/side",
                Some(Box::new(move |_id, rc| {
                    flag.store(true, Ordering::SeqCst);
                    rc
                })),
            )
            .unwrap();
            PhaseResult::Ok
        } else {
            PhaseResult::Ok
        }
    });

    let conn = Connection::new(Plain::new(io), vhosts(ServerOptions::default()), phases);
    conn.await.expect("clean close");

    assert!(cb_ran.load(Ordering::SeqCst));
    assert!(handles.written_str().ends_with("main"));
}
