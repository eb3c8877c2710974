use super::*;

fn inner_frame() -> Frame {
    Frame::new(
        Some(1_700_000_000_000),
        106,
        Value::Map(vec![
            (Value::from("blob"), Value::Binary((0..=255).collect())),
            (Value::from("text"), Value::from("x".repeat(300))),
        ]),
    )
}

fn feed(reassembler: &Reassembler, rid: u64, bytes: &[u8], k: usize) {
    let size = bytes.len().div_ceil(k);
    for chunk in bytes.chunks(size) {
        reassembler
            .append(rid, Value::Binary(chunk.to_vec()))
            .expect("binary chunk");
    }
}

#[test]
fn reassembles_for_any_chunk_count() {
    let frame = inner_frame();
    let bytes = frames::encode_frame(&frame).expect("encode");
    for k in [1, 2, 3, 7, 64] {
        let reassembler = Reassembler::new();
        feed(&reassembler, 9, &bytes, k);
        let decoded = reassembler.finish(9).expect("decodes");
        assert_eq!(decoded, frame, "k = {k}");
        assert!(reassembler.is_empty());
    }
}

#[test]
fn single_chunk_matches_unfragmented_decode() {
    let bytes = frames::encode_frame(&inner_frame()).expect("encode");
    let reassembler = Reassembler::new();
    feed(&reassembler, 1, &bytes, 1);
    assert_eq!(
        reassembler.finish(1).expect("decodes"),
        frames::decode_frame(&bytes).expect("direct decode")
    );
}

#[test]
fn empty_chunks_are_skipped() {
    let bytes = frames::encode_frame(&inner_frame()).expect("encode");
    let reassembler = Reassembler::new();
    reassembler.append(2, Value::Binary(Vec::new())).expect("empty chunk");
    reassembler.append(2, Value::Nil).expect("nil chunk");
    feed(&reassembler, 2, &bytes, 2);
    assert_eq!(reassembler.finish(2).expect("decodes"), inner_frame());
}

#[test]
fn interleaved_rids_are_kept_apart() {
    let a = Frame::new(Some(100), 1, "a");
    let b = Frame::new(Some(200), 2, "b");
    let (a_bytes, b_bytes) = (frames::encode_frame(&a).expect("encode"), frames::encode_frame(&b).expect("encode"));
    let (a_head, a_tail) = a_bytes.split_at(2);
    let (b_head, b_tail) = b_bytes.split_at(3);

    let reassembler = Reassembler::new();
    reassembler.append(1, Value::Binary(a_head.to_vec())).expect("a head");
    reassembler.append(2, Value::Binary(b_head.to_vec())).expect("b head");
    reassembler.append(1, Value::Binary(a_tail.to_vec())).expect("a tail");
    reassembler.append(2, Value::Binary(b_tail.to_vec())).expect("b tail");

    assert_eq!(reassembler.finish(2).expect("b"), b);
    assert!(reassembler.is_buffering(1));
    assert_eq!(reassembler.finish(1).expect("a"), a);
}

#[test]
fn non_binary_chunk_is_protocol_error() {
    let reassembler = Reassembler::new();
    let err = reassembler.append(3, Value::from("text")).expect_err("string chunk");
    assert!(matches!(err, DuctError::Protocol(_)));
}

#[test]
fn finish_without_chunks_fails_to_decode() {
    let reassembler = Reassembler::new();
    let err = reassembler.finish(4).expect_err("nothing buffered");
    assert!(matches!(err, DuctError::Codec(_)));
}

#[test]
fn corrupt_payload_clears_buffer() {
    let reassembler = Reassembler::new();
    reassembler.append(5, Value::Binary(vec![0x93, 0xc0])).expect("partial");
    assert!(reassembler.finish(5).is_err());
    assert!(!reassembler.is_buffering(5));
}
