use super::*;

#[test]
fn batch_line_accepts_names_and_ids() {
    let (event, data) = parse_batch_line(r#"{"event": "EVENT_ADD", "data": {"key": "g"}}"#)
        .expect("parse")
        .expect("call line");
    assert_eq!(event, "EVENT_ADD");
    assert_eq!(data, serde_json::json!({"key": "g"}));

    let (event, data) = parse_batch_line(r#"{"event": 101}"#).expect("parse").expect("call line");
    assert_eq!(event, "101");
    assert_eq!(data, Value::Null);
}

#[test]
fn batch_line_skips_blank_comment_and_non_objects() {
    assert!(parse_batch_line("   \n").expect("blank").is_none());
    assert!(parse_batch_line("# setup").expect("comment").is_none());
    assert!(parse_batch_line("[1, 2]").expect("array").is_none());
}

#[test]
fn batch_line_without_event_is_rejected() {
    let err = parse_batch_line(r#"{"data": 1}"#).expect_err("no event");
    assert!(matches!(err, CliError::MissingField("event")));
}

#[test]
fn open_params_split_key_value_pairs() {
    let params = open_params(Some("abc".into()), &["room=lobby".into(), "q=a=b".into()]).expect("params");
    assert_eq!(params.session_id.as_deref(), Some("abc"));
    assert_eq!(
        params.extra,
        vec![("room".to_owned(), "lobby".to_owned()), ("q".to_owned(), "a=b".to_owned())]
    );

    let err = open_params(None, &["novalue".into()]).expect_err("missing =");
    assert!(matches!(err, CliError::InvalidParam(_)));
}
