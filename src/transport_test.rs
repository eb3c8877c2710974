use super::*;
use crate::event::ABNORMAL_CLOSURE;

#[test]
fn close_frame_code_and_reason_are_kept() {
    let event = close_event(Some(CloseFrame {
        code: CloseCode::from(4000),
        reason: Utf8Bytes::from_static("dropped"),
    }));
    assert_eq!(event, CloseEvent::new(4000, "dropped"));
    assert!(!event.is_normal());
}

#[test]
fn normal_close_frame_is_normal() {
    let event = close_event(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: Utf8Bytes::from_static(""),
    }));
    assert!(event.is_normal());
}

#[test]
fn close_without_status_is_1005() {
    let event = close_event(None);
    assert_eq!(event.code, NO_STATUS);
    assert_ne!(event.code, ABNORMAL_CLOSURE);
}

#[tokio::test]
async fn connect_to_closed_port_fails_as_transport_error() {
    let err = connect("ws://127.0.0.1:1/ws", Duration::from_secs(2))
        .await
        .expect_err("nothing listens on port 1");
    assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
}
