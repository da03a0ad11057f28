//! Property-based tests for the open post buffer

use proptest::prelude::*;

use kagami::backend::websocket::open_post::OpenPost;
use kagami::shared::config::{MAX_LEN_BODY, MAX_LINES_BODY};

fn printable_char() -> impl Strategy<Value = char> {
    prop_oneof![
        prop::char::range('a', 'z'),
        prop::char::range('A', 'Z'),
        prop::char::range('0', '9'),
        prop::char::range('α', 'ω'),
        Just(' '),
        Just('\n'),
        Just('>'),
        Just('#'),
    ]
}

fn printable_text(max: usize) -> impl Strategy<Value = String> {
    prop::collection::vec(printable_char(), 0..max).prop_map(|chars| chars.into_iter().collect())
}

#[derive(Debug, Clone)]
enum Op {
    Append(char),
    Backspace,
    Splice { start: u64, len: u64, text: String },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        printable_char().prop_map(Op::Append),
        Just(Op::Backspace),
        (0u64..60, 0u64..20, printable_text(30)).prop_map(|(start, len, text)| Op::Splice {
            start,
            len,
            text
        }),
    ]
}

fn check_invariants(post: &OpenPost) {
    // Counters always agree with the buffer
    assert_eq!(post.len, post.body.chars().count());
    assert_eq!(post.lines, post.body.matches('\n').count());
    assert!(post.len <= MAX_LEN_BODY);
    assert!(post.lines <= MAX_LINES_BODY);
    assert!(!post.body.contains('\0'));
    // The buffer is a String, so UTF-8 validity is structural; the
    // counters above are the part that can drift
}

proptest! {
    #[test]
    fn test_random_edit_sequences_hold_invariants(ops in prop::collection::vec(op(), 0..120)) {
        let mut post = OpenPost {
            id: 2,
            op: 1,
            time: chrono::Utc::now().timestamp(),
            ..Default::default()
        };

        for op in ops {
            // Rejected operations must leave the buffer untouched
            let before = post.clone();
            let outcome = match op {
                Op::Append(r) => post.append(r).map(|_| ()),
                Op::Backspace => post.backspace().map(|_| ()),
                Op::Splice { start, len, text } => {
                    post.splice(start, len, &text).map(|_| ())
                }
            };
            if outcome.is_err() {
                prop_assert_eq!(&post, &before);
            }
            check_invariants(&post);
        }
    }

    #[test]
    fn test_append_then_backspace_is_identity(body in printable_text(50), r in printable_char()) {
        let mut post = OpenPost {
            id: 2,
            body: body.clone(),
            len: body.chars().count(),
            lines: body.matches('\n').count(),
            time: chrono::Utc::now().timestamp(),
            ..Default::default()
        };
        if post.append(r).is_ok() {
            let popped = post.backspace().unwrap();
            prop_assert_eq!(popped, r);
            prop_assert_eq!(post.body, body);
        }
    }

    #[test]
    fn test_splice_inverse_restores_length(
        body in printable_text(80),
        start in 0u64..40,
        len in 0u64..20,
        text in printable_text(30),
    ) {
        let mut post = OpenPost {
            id: 2,
            body: body.clone(),
            len: body.chars().count(),
            lines: body.matches('\n').count(),
            time: chrono::Utc::now().timestamp(),
            ..Default::default()
        };
        let original_len = post.len;
        if let Ok(effect) = post.splice(start, len, &text) {
            // No truncation happened within these bounds
            prop_assert!(effect.len >= 0);
            let inserted = effect.text.chars().count() as u64;
            if inserted > 0 {
                post.splice(start, inserted, "").unwrap();
            }
            prop_assert_eq!(post.len as i64, original_len as i64 - len as i64);
        }
    }
}
