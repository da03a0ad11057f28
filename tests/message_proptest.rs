//! Property-based tests for the message codec

use proptest::prelude::*;

use kagami::shared::message::{concat, encode, prepend_type, split_frame, MessageType};

const ALL_TYPES: [MessageType; 20] = [
    MessageType::Invalid,
    MessageType::InsertPost,
    MessageType::InsertImage,
    MessageType::Append,
    MessageType::Backspace,
    MessageType::Splice,
    MessageType::ClosePost,
    MessageType::Spoiler,
    MessageType::PostId,
    MessageType::Noop,
    MessageType::ServerTime,
    MessageType::Redirect,
    MessageType::Captcha,
    MessageType::ModeratePost,
    MessageType::Synchronise,
    MessageType::Reclaim,
    MessageType::Configs,
    MessageType::Concat,
    MessageType::MeguTv,
    MessageType::SyncCount,
];

fn message_type() -> impl Strategy<Value = MessageType> {
    (0..ALL_TYPES.len()).prop_map(|i| ALL_TYPES[i])
}

proptest! {
    #[test]
    fn test_encode_split_round_trip(typ in message_type(), payload in ".*") {
        let frame = encode(typ, &payload).unwrap();
        let (code, body) = split_frame(&frame).unwrap();
        prop_assert_eq!(MessageType::try_from(code).unwrap(), typ);

        let back: String = serde_json::from_str(body).unwrap();
        prop_assert_eq!(back, payload);
    }

    #[test]
    fn test_prepend_matches_encode(typ in message_type(), n in 0u64..u64::MAX) {
        let encoded = encode(typ, &n).unwrap();
        let prepended = prepend_type(typ, &n.to_string());
        prop_assert_eq!(encoded, prepended);
    }

    #[test]
    fn test_concat_round_trip(frames in prop::collection::vec("[ -~]*", 0..8)) {
        let wrapped = concat(&frames).unwrap();
        let (code, body) = split_frame(&wrapped).unwrap();
        prop_assert_eq!(MessageType::try_from(code).unwrap(), MessageType::Concat);

        let children: Vec<String> = serde_json::from_str(body).unwrap();
        prop_assert_eq!(children, frames);
    }

    #[test]
    fn test_split_never_panics(frame in ".*") {
        let _ = split_frame(&frame);
    }
}
