use proptest::prelude::*;
use std::time::Instant;
use trellis_link::window::OutgoingWindow;
use trellis_proto::constants::{LINK_START_SEQ, MAX_SEND_ON_LINK};

#[derive(Debug, Clone)]
enum Op {
    Push(u64),
    Release(u64),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (1u64..u64::MAX).prop_map(Op::Push),
            (0u64..MAX_SEND_ON_LINK).prop_map(Op::Release),
        ],
        1..200,
    )
}

proptest! {
    /// The cursor ordering and digest chain survive any interleaving of
    /// pushes and cumulative releases.
    #[test]
    fn window_cursors_and_digests_stay_consistent(ops in ops()) {
        let now = Instant::now();
        let mut win = OutgoingWindow::new(LINK_START_SEQ);
        // Model: nonce of every pushed sequence.
        let mut nonces: Vec<(u64, u64)> = Vec::new();

        for op in ops {
            match op {
                Op::Push(nonce) => {
                    if !win.is_full() {
                        let seq = win.push(vec![0u8; 4], 1, nonce, now);
                        nonces.push((seq, nonce));
                    }
                }
                Op::Release(offset) => {
                    let aru = win.tail_seq + offset;
                    if aru < win.head_seq {
                        win.release_through(aru);
                    }
                }
            }

            prop_assert!(win.tail_seq <= win.head_seq);
            prop_assert!(win.head_seq <= win.tail_seq + MAX_SEND_ON_LINK);

            // Digest at any live sequence equals the XOR of all nonces up to it.
            if win.head_seq > win.tail_seq {
                let seq = win.head_seq - 1;
                let expect = nonces
                    .iter()
                    .filter(|(s, _)| *s <= seq)
                    .fold(0u64, |acc, (_, n)| acc ^ n);
                prop_assert_eq!(win.digest_at(seq), expect);
            }
        }
    }
}
