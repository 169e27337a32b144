use bytes::Bytes;
use estuary_core::http::{body::BodyError, RequestBody};
use http::{HeaderMap, StatusCode};

use super::*;

fn options() -> IngressOptions {
    IngressOptions {
        max_request_length: 0,
        max_streams: 100,
        max_header_list_size: 8192,
        max_reset_frames: 10,
        reset_frames_window: Duration::from_secs(60),
        max_requests: None,
        initial_connection_window: 1 << 20,
        initial_stream_window: 1 << 20,
    }
}

fn headers_frame(stream_id: StreamId, method: Option<&str>, end_stream: bool) -> InboundFrame {
    InboundFrame::Headers(HeadersFrame {
        stream_id,
        pseudo: PseudoHeaders {
            method: method.map(|m| m.to_string()),
            scheme: Some("http".to_string()),
            authority: Some("example.com".to_string()),
            path: Some("/test".to_string()),
            protocol: None,
        },
        headers: HeaderMap::new(),
        end_stream,
    })
}

fn data_frame(stream_id: StreamId, payload: &'static [u8], end_stream: bool) -> InboundFrame {
    InboundFrame::Data(DataFrame {
        stream_id,
        payload: Bytes::from_static(payload),
        padding: 0,
        end_stream,
    })
}

fn expect_status(frames: &[OutboundFrame], want: StatusCode) {
    assert!(
        frames.iter().any(|f| matches!(
            f,
            OutboundFrame::Headers { status, .. } if *status == want
        )),
        "expected {want} in {frames:?}"
    );
}

#[test]
fn headers_without_method_rejected_stream_survives_connection() {
    let (mut ingress, _releases) = Http2Ingress::new(options());

    let effects = ingress.on_frame(headers_frame(1, None, true)).unwrap();
    expect_status(&effects.frames, StatusCode::BAD_REQUEST);
    assert!(effects.request.is_none());

    // stream 3 can still be served
    let effects = ingress.on_frame(headers_frame(3, Some("GET"), true)).unwrap();
    let request = effects.request.expect("stream 3 dispatches");
    assert_eq!(request.stream_id, 3);
    assert_eq!(request.request.method(), &http::Method::GET);
    assert_eq!(request.request.uri().path(), "/test");
}

#[test]
fn unknown_method_and_bare_connect_rejected() {
    let (mut ingress, _releases) = Http2Ingress::new(options());
    let effects = ingress
        .on_frame(headers_frame(1, Some("SPLICE"), true))
        .unwrap();
    expect_status(&effects.frames, StatusCode::METHOD_NOT_ALLOWED);

    let effects = ingress
        .on_frame(headers_frame(3, Some("CONNECT"), true))
        .unwrap();
    expect_status(&effects.frames, StatusCode::METHOD_NOT_ALLOWED);
}

#[test]
fn extended_connect_is_accepted() {
    let (mut ingress, _releases) = Http2Ingress::new(options());
    let mut frame = headers_frame(1, Some("CONNECT"), false);
    if let InboundFrame::Headers(h) = &mut frame {
        h.pseudo.protocol = Some("websocket".to_string());
    }
    let effects = ingress.on_frame(frame).unwrap();
    assert!(effects.request.is_some());
}

#[test]
fn invalid_content_length_rejected() {
    let (mut ingress, _releases) = Http2Ingress::new(options());
    let mut frame = headers_frame(1, Some("POST"), false);
    if let InboundFrame::Headers(h) = &mut frame {
        h.headers
            .insert(http::header::CONTENT_LENGTH, "-5".parse().unwrap());
    }
    let effects = ingress.on_frame(frame).unwrap();
    expect_status(&effects.frames, StatusCode::BAD_REQUEST);
    // the stream was never registered and more frames were announced
    assert!(effects
        .frames
        .iter()
        .any(|f| matches!(f, OutboundFrame::RstStream { .. })));
}

#[test]
fn expect_100_continue_emits_interim_and_strips_header() {
    let (mut ingress, _releases) = Http2Ingress::new(options());
    let mut frame = headers_frame(1, Some("POST"), false);
    if let InboundFrame::Headers(h) = &mut frame {
        h.headers
            .insert(http::header::EXPECT, "100-continue".parse().unwrap());
    }
    let effects = ingress.on_frame(frame).unwrap();
    assert!(effects.frames.iter().any(|f| matches!(
        f,
        OutboundFrame::Headers { status, end_stream: false, .. } if *status == StatusCode::CONTINUE
    )));
    let request = effects.request.unwrap();
    assert!(request.request.headers().get(http::header::EXPECT).is_none());
}

#[test]
fn unknown_expectation_fails_with_417() {
    let (mut ingress, _releases) = Http2Ingress::new(options());
    let mut frame = headers_frame(1, Some("POST"), false);
    if let InboundFrame::Headers(h) = &mut frame {
        h.headers
            .insert(http::header::EXPECT, "204-teapot".parse().unwrap());
    }
    let effects = ingress.on_frame(frame).unwrap();
    expect_status(&effects.frames, StatusCode::EXPECTATION_FAILED);
    assert!(effects.request.is_none());
}

#[test]
fn request_ids_are_monotonic() {
    let (mut ingress, _releases) = Http2Ingress::new(options());
    let first = ingress
        .on_frame(headers_frame(1, Some("GET"), true))
        .unwrap()
        .request
        .unwrap();
    let second = ingress
        .on_frame(headers_frame(3, Some("GET"), true))
        .unwrap()
        .request
        .unwrap();
    let id = |r: &NewRequest| r.request.extensions().get::<RequestIdent>().unwrap().request_id;
    assert!(id(&second) > id(&first));
}

#[monoio::test]
async fn data_flows_into_body_stream() {
    let (mut ingress, _releases) = Http2Ingress::new(options());
    let new_request = ingress
        .on_frame(headers_frame(1, Some("POST"), false))
        .unwrap()
        .request
        .unwrap();

    ingress.on_frame(data_frame(1, b"hello ", false)).unwrap();
    ingress.on_frame(data_frame(1, b"world", true)).unwrap();

    let mut body = new_request.request.into_body();
    let data = body.aggregate(0).await.unwrap();
    assert_eq!(&data[..], b"hello world");
    assert!(new_request.handle.borrow().is_closed());
}

#[test]
fn oversized_body_before_response_gets_413_and_rst_cancel() {
    let mut opts = options();
    opts.max_request_length = 10;
    let (mut ingress, _releases) = Http2Ingress::new(opts);
    let new_request = ingress
        .on_frame(headers_frame(1, Some("POST"), false))
        .unwrap()
        .request
        .unwrap();

    let effects = ingress
        .on_frame(data_frame(1, b"0123456789abcdef", false))
        .unwrap();
    expect_status(&effects.frames, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(effects.frames.iter().any(|f| matches!(
        f,
        OutboundFrame::RstStream { error_code: Http2ErrorCode::Cancel, .. }
    )));
    assert_eq!(
        new_request.handle.borrow().close_reason(),
        Some(&BodyError::ContentTooLarge)
    );
    // exactly one close: the entry is gone, repeated DATA is flow-returned
    let effects = ingress.on_frame(data_frame(1, b"more", false)).unwrap();
    assert!(effects.request.is_none());
}

#[test]
fn oversized_body_after_response_start_aborts_silently() {
    let mut opts = options();
    opts.max_request_length = 10;
    let (mut ingress, _releases) = Http2Ingress::new(opts);
    let new_request = ingress
        .on_frame(headers_frame(1, Some("POST"), false))
        .unwrap()
        .request
        .unwrap();
    new_request.handle.borrow_mut().response_started = true;

    let effects = ingress
        .on_frame(data_frame(1, b"0123456789abcdef", false))
        .unwrap();
    // no 413, no RST: the in-progress response finishes
    assert!(!effects
        .frames
        .iter()
        .any(|f| matches!(f, OutboundFrame::Headers { .. } | OutboundFrame::RstStream { .. })));
    assert_eq!(new_request.handle.borrow().state(), StreamState::Aborted);
}

#[test]
fn rst_stream_cancels_request_connection_survives() {
    let (mut ingress, _releases) = Http2Ingress::new(options());
    let new_request = ingress
        .on_frame(headers_frame(5, Some("POST"), false))
        .unwrap()
        .request
        .unwrap();
    ingress.on_frame(data_frame(5, b"partial", false)).unwrap();

    ingress
        .on_frame(InboundFrame::RstStream {
            stream_id: 5,
            error_code: Http2ErrorCode::Cancel as u32,
        })
        .unwrap();
    assert_eq!(
        new_request.handle.borrow().close_reason(),
        Some(&BodyError::Reset)
    );

    // new streams still accepted
    let effects = ingress.on_frame(headers_frame(7, Some("GET"), true)).unwrap();
    assert!(effects.request.is_some());
}

#[test]
fn rst_flood_enhances_your_calm() {
    let mut opts = options();
    opts.max_reset_frames = 3;
    let (mut ingress, _releases) = Http2Ingress::new(opts);
    let mut result = Ok(());
    for i in 0..5u32 {
        let r = ingress.on_frame(InboundFrame::RstStream {
            stream_id: 9 + 2 * i,
            error_code: 0,
        });
        if let Err(e) = r {
            result = Err(e);
            break;
        }
    }
    let err = result.expect_err("flood must be fatal");
    assert_eq!(err.code, Http2ErrorCode::EnhanceYourCalm);
}

#[test]
fn data_on_unknown_stream_is_protocol_error() {
    let (mut ingress, _releases) = Http2Ingress::new(options());
    let err = ingress
        .on_frame(data_frame(11, b"x", false))
        .expect_err("must be fatal");
    assert_eq!(err.code, Http2ErrorCode::ProtocolError);
}

#[test]
fn push_promise_is_protocol_error() {
    let (mut ingress, _releases) = Http2Ingress::new(options());
    let err = ingress
        .on_frame(InboundFrame::PushPromise { stream_id: 2 })
        .expect_err("push from client");
    assert_eq!(err.code, Http2ErrorCode::ProtocolError);
}

#[test]
fn plain_ping_acked() {
    let (mut ingress, _releases) = Http2Ingress::new(options());
    let effects = ingress
        .on_frame(InboundFrame::Ping {
            payload: [7; 8],
            ack: false,
        })
        .unwrap();
    assert_eq!(
        effects.frames,
        vec![OutboundFrame::Ping {
            payload: [7; 8],
            ack: true,
        }]
    );
    let effects = ingress
        .on_frame(InboundFrame::Ping {
            payload: [7; 8],
            ack: true,
        })
        .unwrap();
    assert!(effects.frames.is_empty());
}

#[monoio::test]
async fn trailers_reach_the_body_and_close_the_request() {
    let (mut ingress, _releases) = Http2Ingress::new(options());
    let new_request = ingress
        .on_frame(headers_frame(1, Some("POST"), false))
        .unwrap()
        .request
        .unwrap();
    ingress.on_frame(data_frame(1, b"payload", false)).unwrap();

    let mut trailers = HeaderMap::new();
    trailers.insert("x-checksum", "ff".parse().unwrap());
    ingress
        .on_frame(InboundFrame::Headers(HeadersFrame {
            stream_id: 1,
            pseudo: PseudoHeaders::default(),
            headers: trailers,
            end_stream: true,
        }))
        .unwrap();
    assert!(new_request.handle.borrow().is_closed());

    let RequestBody::Streamed(mut stream) = new_request.request.into_body() else {
        panic!("expected streamed body");
    };
    assert!(stream.next_data().await.unwrap().is_ok());
    assert!(stream.next_data().await.is_none());
    assert_eq!(stream.trailers().unwrap()["x-checksum"], "ff");
}

#[test]
fn max_requests_per_connection_drains() {
    let mut opts = options();
    opts.max_requests = Some(1);
    let (mut ingress, _releases) = Http2Ingress::new(opts);

    let effects = ingress.on_frame(headers_frame(1, Some("GET"), true)).unwrap();
    assert!(effects.request.is_some());
    assert!(effects.frames.iter().any(|f| matches!(
        f,
        OutboundFrame::GoAway { error_code: Http2ErrorCode::NoError, .. }
    )));
    assert!(ingress.is_draining());

    let effects = ingress.on_frame(headers_frame(3, Some("GET"), true)).unwrap();
    assert!(effects.request.is_none());
    assert!(effects.frames.iter().any(|f| matches!(
        f,
        OutboundFrame::RstStream { error_code: Http2ErrorCode::RefusedStream, .. }
    )));
}

#[test]
fn max_concurrent_streams_refuses_excess() {
    let mut opts = options();
    opts.max_streams = 1;
    let (mut ingress, _releases) = Http2Ingress::new(opts);
    assert!(ingress
        .on_frame(headers_frame(1, Some("POST"), false))
        .unwrap()
        .request
        .is_some());
    let effects = ingress.on_frame(headers_frame(3, Some("GET"), true)).unwrap();
    assert!(effects.request.is_none());
    assert!(effects.frames.iter().any(|f| matches!(
        f,
        OutboundFrame::RstStream { error_code: Http2ErrorCode::RefusedStream, .. }
    )));
}

#[monoio::test]
async fn window_updates_follow_consumption() {
    let mut opts = options();
    opts.initial_connection_window = 64;
    opts.initial_stream_window = 64;
    let (mut ingress, mut releases) = Http2Ingress::new(opts);
    let new_request = ingress
        .on_frame(headers_frame(1, Some("POST"), false))
        .unwrap()
        .request
        .unwrap();

    let payload: &[u8] = &[0u8; 40];
    ingress
        .on_frame(InboundFrame::Data(DataFrame {
            stream_id: 1,
            payload: Bytes::copy_from_slice(payload),
            padding: 0,
            end_stream: true,
        }))
        .unwrap();

    // nothing advertised until the handler consumes the chunk
    let RequestBody::Streamed(mut stream) = new_request.request.into_body() else {
        panic!("expected streamed body");
    };
    let chunk = stream.next_data().await.unwrap().unwrap();
    drop(chunk);

    let (stream_id, released) = releases.recv().await.unwrap();
    assert_eq!((stream_id, released), (1, 40));
    let frames = ingress.on_window_release(stream_id, released);
    assert!(frames.iter().any(|f| matches!(
        f,
        OutboundFrame::WindowUpdate { stream_id: 0, increment: 40 }
    )));
    assert!(frames.iter().any(|f| matches!(
        f,
        OutboundFrame::WindowUpdate { stream_id: 1, increment: 40 }
    )));
}

#[test]
fn close_paths_are_idempotent_across_events() {
    let (mut ingress, _releases) = Http2Ingress::new(options());
    let new_request = ingress
        .on_frame(headers_frame(1, Some("POST"), false))
        .unwrap()
        .request
        .unwrap();

    ingress
        .on_frame(InboundFrame::RstStream {
            stream_id: 1,
            error_code: 0,
        })
        .unwrap();
    // transport close + connection teardown after the reset change nothing
    ingress.on_stream_closed(1);
    ingress.close_all(BodyError::Closed);
    assert_eq!(
        new_request.handle.borrow().close_reason(),
        Some(&BodyError::Reset)
    );
}
