//! Unit tests for the transcript matcher.

use super::*;
use rstest::rstest;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

const SHORT: Duration = Duration::from_millis(50);

fn transcript_with(chunks: &[&[u8]]) -> (UnboundedSender<Vec<u8>>, Transcript) {
    let (sender, receiver) = unbounded_channel();
    for chunk in chunks {
        sender.send(chunk.to_vec()).expect("queue chunk");
    }
    (sender, Transcript::new(receiver))
}

#[rstest]
#[tokio::test]
async fn earliest_match_wins_regardless_of_candidate_order() {
    let (_sender, mut transcript) = transcript_with(&[b"alpha beta gamma"]);
    let patterns = [Pattern::literal("gamma"), Pattern::literal("beta")];

    let found = transcript
        .expect(&patterns, Some(SHORT))
        .await
        .expect("beta should match");

    assert_eq!(found.index, 1);
    assert_eq!(found.before, "alpha ");
    assert_eq!(found.matched, "beta");
    assert_eq!(transcript.buffered(), " gamma");
}

#[rstest]
#[tokio::test]
async fn equal_start_prefers_earlier_candidate() {
    let (_sender, mut transcript) = transcript_with(&[b"Permission denied (publickey)."]);
    let patterns = [
        Pattern::literal("Permission denied"),
        Pattern::literal("Permission denied ("),
    ];

    let found = transcript
        .expect(&patterns, Some(SHORT))
        .await
        .expect("both candidates match");

    assert_eq!(found.index, 0);
}

#[rstest]
#[tokio::test]
async fn remaining_text_serves_the_next_wait() {
    let (_sender, mut transcript) = transcript_with(&[b"one\r\ntwo\r\n"]);

    let first = transcript
        .expect(&[Pattern::literal("one")], Some(SHORT))
        .await
        .expect("first");
    let second = transcript
        .expect(&[Pattern::literal("two")], Some(SHORT))
        .await
        .expect("second");

    assert_eq!(first.before, "");
    assert_eq!(second.before, "\r\n");
}

#[rstest]
#[tokio::test]
async fn regex_captures_are_reported_from_group_one() {
    let (_sender, mut transcript) = transcript_with(&[b"Submitted batch job 12345\r\n"]);
    let pattern = Pattern::regex(r"Submitted batch job (\d+)").expect("pattern compiles");

    let found = transcript
        .expect(&[pattern], Some(SHORT))
        .await
        .expect("job id");

    assert_eq!(found.capture(1), Some("12345"));
    assert_eq!(found.capture(0), None);
    assert_eq!(found.capture(2), None);
}

#[rstest]
#[tokio::test]
async fn matches_across_chunk_boundaries() {
    let (_sender, mut transcript) = transcript_with(&[b"Are you su", b"re you want to continue"]);

    let found = transcript
        .expect(&[Pattern::literal("sure you want")], Some(SHORT))
        .await
        .expect("split text should match");

    assert_eq!(found.before, "Are you ");
}

#[rstest]
#[tokio::test]
async fn reassembles_utf8_split_between_chunks() {
    let snowman = "☃".as_bytes();
    let (head, rest) = snowman.split_at(1);
    let (_sender, mut transcript) = transcript_with(&[b"x", head, rest, b"y"]);

    let found = transcript
        .expect(&[Pattern::literal("y")], Some(SHORT))
        .await
        .expect("y");

    assert_eq!(found.before, "x☃");
}

#[rstest]
#[tokio::test]
async fn replaces_invalid_bytes() {
    let (_sender, mut transcript) = transcript_with(&[b"a\xffb"]);

    let found = transcript
        .expect(&[Pattern::literal("b")], Some(SHORT))
        .await
        .expect("b");

    assert_eq!(found.before, "a\u{FFFD}");
}

#[rstest]
#[tokio::test]
async fn times_out_with_recent_output() {
    let (_sender, mut transcript) = transcript_with(&[b"still booting"]);

    let err = transcript
        .expect(&[Pattern::literal("ready")], Some(SHORT))
        .await
        .expect_err("nothing should match");

    let MatchError::Timeout { tail, patterns, .. } = err else {
        panic!("expected timeout, got {err:?}");
    };
    assert_eq!(tail, "still booting");
    assert_eq!(patterns, "\"ready\"");
}

#[rstest]
#[tokio::test]
async fn reports_closed_stream() {
    let (sender, mut transcript) = transcript_with(&[b"Connection closed"]);
    drop(sender);

    let err = transcript
        .expect(&[Pattern::literal("$ ")], None)
        .await
        .expect_err("stream ended");

    assert!(
        matches!(err, MatchError::StreamClosed { ref tail, .. } if tail == "Connection closed"),
        "unexpected error: {err:?}"
    );
    assert!(transcript.is_closed());
}

#[rstest]
#[tokio::test]
async fn buffer_keeps_only_the_newest_text() {
    let (_sender, receiver) = unbounded_channel::<Vec<u8>>();
    let mut transcript = Transcript::new(receiver).with_limit(8);
    transcript.ingest(b"0123456789abcdef");

    assert_eq!(transcript.buffered(), "89abcdef");
}

#[rstest]
fn rejects_invalid_regex() {
    let err = Pattern::regex("(unclosed").expect_err("invalid regex");
    assert!(matches!(err, MatchError::InvalidPattern { .. }));
}

#[rstest]
fn describes_candidates() {
    let patterns = [
        Pattern::literal("yes"),
        Pattern::regex(r"\d+").expect("pattern compiles"),
    ];
    assert_eq!(describe(&patterns), r#""yes", /\d+/"#);
}
