//! Frame reassembly over a snapshot of a connection's inbound bytes.
//!
//! Reads arrive in arbitrary fragments: a snapshot may hold several frames,
//! part of a header, or part of a body. `scan` walks the snapshot from the
//! front and hands every complete frame to a callback. Whatever belongs to a
//! frame that has not fully arrived is reported through
//! [`ScanOutcome::carry_from`] so the caller can put it back in front of the
//! next read.
//!
//! ## Resynchronization
//!
//! Frame boundaries are found only by searching for the start marker. Bytes
//! that precede a marker, or that follow the last marker and cannot be the
//! start of one, are dropped and counted in [`ScanOutcome::discarded`]. This
//! is silent data loss for a peer that sends unframed bytes; the dispatcher's
//! strict resync policy turns it into a disconnect instead.
//!
//! The one exception is a trailing run that is a proper prefix of the start
//! marker: it is carried over, since the rest of the marker may be in the
//! next read.

use crate::protocol::{
    find_marker, partial_marker_suffix, FrameError, FrameHeader, HEADER_SIZE, START_MARKER,
};

/// What a single `scan` pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Complete frames handed to the callback.
    pub frames: usize,
    /// Offset from which the snapshot must be kept for the next pass.
    pub carry_from: Option<usize>,
    /// Bytes dropped because they were not part of any frame.
    pub discarded: usize,
    /// Headers rejected as malformed.
    pub rejected: usize,
    /// The most recent header rejection.
    pub last_error: Option<FrameError>,
}

impl ScanOutcome {
    /// True if any input was thrown away rather than framed or carried.
    pub fn lost_bytes(&self) -> bool {
        self.discarded > 0 || self.rejected > 0
    }
}

/// Extract every complete frame from `buf`.
///
/// `on_frame` receives each header with exactly `header.body_len` body bytes,
/// in arrival order. Headers declaring more than `max_body_size` are rejected
/// and scanning resumes after their start marker.
pub fn scan<F>(buf: &[u8], max_body_size: usize, mut on_frame: F) -> ScanOutcome
where
    F: FnMut(FrameHeader, &[u8]),
{
    let mut outcome = ScanOutcome::default();
    let mut offset = 0;

    while offset < buf.len() {
        let Some(start) = find_marker(buf, offset) else {
            let rest = &buf[offset..];
            let keep = partial_marker_suffix(rest);
            outcome.discarded += rest.len() - keep;
            if keep > 0 {
                outcome.carry_from = Some(buf.len() - keep);
            }
            break;
        };
        outcome.discarded += start - offset;

        let header = match FrameHeader::decode_bounded(&buf[start..], max_body_size) {
            Ok(header) => header,
            Err(FrameError::Truncated { .. }) => {
                // Header not arrived yet
                outcome.carry_from = Some(start);
                break;
            }
            Err(e) => {
                outcome.rejected += 1;
                outcome.last_error = Some(e);
                offset = start + START_MARKER.len();
                continue;
            }
        };

        let Some(end) = start.checked_add(header.frame_len()) else {
            outcome.rejected += 1;
            outcome.last_error = Some(FrameError::BodyTooLarge {
                declared: header.body_len as usize,
                max: max_body_size,
            });
            offset = start + START_MARKER.len();
            continue;
        };
        if end > buf.len() {
            // Body not arrived yet
            outcome.carry_from = Some(start);
            break;
        }

        on_frame(header, &buf[start + HEADER_SIZE..end]);
        outcome.frames += 1;
        offset = end;
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_frame, Command, DEFAULT_MAX_BODY_SIZE};
    use crate::runtime::buffer::Accumulator;
    use bytes::BytesMut;
    use proptest::prelude::*;
    use rstest::rstest;

    const MAX: usize = DEFAULT_MAX_BODY_SIZE;

    fn frames(bodies: &[&[u8]]) -> Vec<u8> {
        let mut out = BytesMut::new();
        for body in bodies {
            encode_frame(Command::Echo, body, &mut out).unwrap();
        }
        out.to_vec()
    }

    fn collect(buf: &[u8]) -> (Vec<Vec<u8>>, ScanOutcome) {
        let mut bodies = Vec::new();
        let outcome = scan(buf, MAX, |_, body| bodies.push(body.to_vec()));
        (bodies, outcome)
    }

    /// Feed `chunks` through an accumulator the way the runtime does:
    /// append, snapshot, scan, restore the carried tail.
    fn feed(chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        let acc = Accumulator::new();
        let mut bodies = Vec::new();
        for chunk in chunks {
            acc.append(chunk);
            let Some(snapshot) = acc.take() else { continue };
            let outcome = scan(&snapshot, MAX, |_, body| bodies.push(body.to_vec()));
            if let Some(from) = outcome.carry_from {
                acc.restore(&snapshot[from..]);
            }
        }
        bodies
    }

    #[test]
    fn test_single_frame() {
        let wire = frames(&[b"hello"]);
        let (bodies, outcome) = collect(&wire);
        assert_eq!(bodies, vec![b"hello".to_vec()]);
        assert_eq!(outcome.frames, 1);
        assert_eq!(outcome.carry_from, None);
        assert!(!outcome.lost_bytes());
    }

    #[test]
    fn test_multiple_frames_per_read() {
        let wire = frames(&[b"one", b"", b"three", b"4", b"five!"]);
        let (bodies, outcome) = collect(&wire);
        assert_eq!(outcome.frames, 5);
        assert_eq!(
            bodies,
            vec![
                b"one".to_vec(),
                b"".to_vec(),
                b"three".to_vec(),
                b"4".to_vec(),
                b"five!".to_vec()
            ]
        );
    }

    #[test]
    fn test_header_passed_through() {
        let mut wire = BytesMut::new();
        encode_frame(Command::Ping, b"x", &mut wire).unwrap();
        let mut seen = Vec::new();
        scan(&wire, MAX, |header, _| seen.push(header));
        assert_eq!(seen, vec![FrameHeader::new(Command::Ping, 1)]);
    }

    #[rstest]
    #[case::marker_only(4)]
    #[case::mid_header(7)]
    #[case::header_complete(HEADER_SIZE)]
    #[case::mid_body(HEADER_SIZE + 2)]
    fn test_partial_frame_is_carried(#[case] cut: usize) {
        let wire = frames(&[b"hello"]);
        let (bodies, outcome) = collect(&wire[..cut]);
        assert!(bodies.is_empty());
        assert_eq!(outcome.carry_from, Some(0));
        assert_eq!(outcome.discarded, 0);
    }

    #[rstest]
    #[case::split_in_marker(2)]
    #[case::split_in_header(HEADER_SIZE - 1)]
    #[case::split_at_body(HEADER_SIZE)]
    #[case::split_in_body(HEADER_SIZE + 3)]
    fn test_split_frame_dispatched_once(#[case] cut: usize) {
        let wire = frames(&[b"hello"]);
        let bodies = feed(&[&wire[..cut], &wire[cut..]]);
        assert_eq!(bodies, vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_echo_hello_split_four_and_rest() {
        let wire = frames(&[b"hello"]);
        let bodies = feed(&[&wire[..4], &wire[4..]]);
        assert_eq!(bodies, vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_every_two_way_split() {
        let wire = frames(&[b"alpha", b"", b"gamma-delta", b"e"]);
        let expected = vec![
            b"alpha".to_vec(),
            b"".to_vec(),
            b"gamma-delta".to_vec(),
            b"e".to_vec(),
        ];
        for a in 0..=wire.len() {
            for b in a..=wire.len() {
                let bodies = feed(&[&wire[..a], &wire[a..b], &wire[b..]]);
                assert_eq!(bodies, expected, "split at {a}/{b}");
            }
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let wire = frames(&[b"first", b"second"]);
        let chunks: Vec<&[u8]> = wire.chunks(1).collect();
        assert_eq!(feed(&chunks), vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn test_garbage_prefix_skipped() {
        let mut wire = b"garbage".to_vec();
        wire.extend_from_slice(&frames(&[b"payload"]));
        let (bodies, outcome) = collect(&wire);
        assert_eq!(bodies, vec![b"payload".to_vec()]);
        assert_eq!(outcome.discarded, 7);
        assert!(outcome.lost_bytes());
    }

    #[test]
    fn test_no_marker_discards_everything() {
        let (bodies, outcome) = collect(b"no frames in here");
        assert!(bodies.is_empty());
        assert_eq!(outcome.discarded, 17);
        assert_eq!(outcome.carry_from, None);
    }

    #[test]
    fn test_trailing_garbage_after_frame_discarded() {
        let mut wire = frames(&[b"ok"]);
        wire.extend_from_slice(b"zzz");
        let (bodies, outcome) = collect(&wire);
        assert_eq!(bodies, vec![b"ok".to_vec()]);
        assert_eq!(outcome.discarded, 3);
        assert_eq!(outcome.carry_from, None);
    }

    #[test]
    fn test_trailing_partial_marker_carried() {
        let mut wire = b"zz".to_vec();
        wire.extend_from_slice(&START_MARKER[..3]);
        let (bodies, outcome) = collect(&wire);
        assert!(bodies.is_empty());
        assert_eq!(outcome.discarded, 2);
        assert_eq!(outcome.carry_from, Some(2));
    }

    #[test]
    fn test_oversize_header_rejected_and_resynced() {
        let mut wire = FrameHeader::new(Command::Echo, 1_000).encode().to_vec();
        wire.extend_from_slice(&frames(&[b"next"]));

        let mut bodies = Vec::new();
        let outcome = scan(&wire, 64, |_, body| bodies.push(body.to_vec()));

        assert_eq!(bodies, vec![b"next".to_vec()]);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(
            outcome.last_error,
            Some(FrameError::BodyTooLarge {
                declared: 1_000,
                max: 64
            })
        );
        // The rejected header's kind and length bytes are skipped as garbage.
        assert_eq!(outcome.discarded, HEADER_SIZE - START_MARKER.len());
    }

    #[test]
    fn test_largest_declared_body_is_carried() {
        let mut wire = b"zz".to_vec();
        wire.extend_from_slice(&FrameHeader::new(Command::Echo, u32::MAX).encode());
        wire.extend_from_slice(b"partial body");

        let mut frames = 0;
        let outcome = scan(&wire, usize::MAX, |_, _| frames += 1);
        assert_eq!(frames, 0);
        assert_eq!(outcome.carry_from, Some(2));
        assert_eq!(outcome.rejected, 0);
    }

    #[test]
    fn test_unknown_kind_still_framed() {
        let mut wire = FrameHeader::new(Command::Echo, 3).encode();
        wire[4] = 0xFF;
        let mut wire = wire.to_vec();
        wire.extend_from_slice(b"abc");
        wire.extend_from_slice(&frames(&[b"after"]));

        let mut seen = Vec::new();
        scan(&wire, MAX, |header, body| seen.push((header.command(), body.to_vec())));
        assert_eq!(
            seen,
            vec![(None, b"abc".to_vec()), (Some(Command::Echo), b"after".to_vec())]
        );
    }

    #[test]
    fn test_empty_input() {
        let (bodies, outcome) = collect(b"");
        assert!(bodies.is_empty());
        assert_eq!(outcome, ScanOutcome::default());
    }

    fn garbage() -> impl Strategy<Value = Vec<u8>> {
        // Anything without the marker's first byte can never start a frame.
        prop::collection::vec(
            any::<u8>().prop_filter("marker byte", |b| *b != START_MARKER[0]),
            0..16,
        )
    }

    proptest! {
        #[test]
        fn test_generated_splits_round_trip(
            bodies in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let refs: Vec<&[u8]> = bodies.iter().map(Vec::as_slice).collect();
            let wire = frames(&refs);

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(wire.len() + 1)).collect();
            points.sort_unstable();
            let mut chunks = Vec::new();
            let mut last = 0;
            for p in points {
                chunks.push(&wire[last..p]);
                last = p;
            }
            chunks.push(&wire[last..]);

            prop_assert_eq!(feed(&chunks), bodies);
        }

        #[test]
        fn test_generated_garbage_never_dispatched(
            prefix in garbage(),
            body in prop::collection::vec(any::<u8>(), 0..32),
        ) {
            let mut wire = prefix.clone();
            wire.extend_from_slice(&frames(&[body.as_slice()]));

            let (bodies, outcome) = collect(&wire);
            prop_assert_eq!(bodies, vec![body]);
            prop_assert_eq!(outcome.discarded, prefix.len());
        }
    }
}
