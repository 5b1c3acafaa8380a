use std::time::Duration;

use replog::state_log::StateLog;
use replog::term_log::CommitWait;

fn open(tmp: &tempfile::TempDir) -> StateLog {
    StateLog::open_with_sizing(tmp.path().join("db"), 1024, 64 * 1024).unwrap()
}

#[tokio::test]
async fn write_commit_read_across_terms() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open(&tmp);

    let t1 = log.define_term(0, 1, 0).unwrap().unwrap();
    let mut w1 = t1.open_writer(0).unwrap();
    w1.write(&[1u8; 1500], 1500).unwrap();
    log.commit(1500);

    let t2 = log.define_term(1, 2, 1500).unwrap().unwrap();
    let mut w2 = t2.open_writer(1500).unwrap();
    w2.write(&[2u8; 500], 2000).unwrap();
    log.commit(2000);

    // read the whole stream back, crossing the term boundary
    let mut got = Vec::new();
    let mut pos = 0u64;
    while pos < 2000 {
        let mut reader = log.open_reader(pos).unwrap();
        let mut buf = [0u8; 4096];
        let n = reader.read(&mut buf).await.unwrap();
        if n == 0 {
            pos = reader.position().max(pos + 1);
            continue;
        }
        got.extend_from_slice(&buf[..n]);
        pos = reader.position();
    }
    assert_eq!(&got[..1500], &[1u8; 1500][..]);
    assert_eq!(&got[1500..2000], &[2u8; 500][..]);
}

#[tokio::test]
async fn commit_wait_sees_term_end_on_close() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open(&tmp);
    let t1 = log.define_term(0, 1, 0).unwrap().unwrap();

    let waiter = {
        let t1 = t1.clone();
        tokio::spawn(async move { t1.wait_for_commit(100, Duration::from_secs(10)).await })
    };
    tokio::task::yield_now().await;
    log.close();
    assert_eq!(waiter.await.unwrap(), CommitWait::TermEnded);
}

#[tokio::test]
async fn non_contiguous_catch_up_flow() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open(&tmp);
    let t1 = log.define_term(0, 1, 0).unwrap().unwrap();

    // a replica that received a late chunk first
    let mut late = t1.open_writer(3000).unwrap();
    late.write(&[9u8; 1000], 4000).unwrap();
    log.commit(4000);
    assert_eq!(log.capture_highest().appliable(), 0);

    let missing = log.missing_ranges(8);
    assert_eq!(missing, vec![(0, 3000)]);

    // catch-up data arrives
    let mut fill = t1.open_writer(0).unwrap();
    fill.write(&[8u8; 3000], 3000).unwrap();
    assert!(log.missing_ranges(8).is_empty());
    assert_eq!(log.capture_highest().appliable(), 4000);

    let mut reader = log.open_reader(2999).unwrap();
    let mut buf = [0u8; 2];
    reader.read(&mut buf).await.unwrap();
    assert_eq!(buf[0], 8);
}

#[tokio::test]
async fn redefine_discards_unfinished_suffix() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open(&tmp);

    let t1 = log.define_term(0, 1, 0).unwrap().unwrap();
    let mut w1 = t1.open_writer(0).unwrap();
    w1.write(&[1u8; 1000], 1000).unwrap();
    log.commit(1000);

    // a deposed leader's dangling bytes
    let mut dangling = t1.open_writer(1000).unwrap();
    dangling.write(&[7u8; 500], 1500).unwrap();
    drop(dangling);
    drop(w1);

    // the new leader roots its term at the committed position
    let t2 = log.define_term(1, 2, 1000).unwrap().unwrap();
    assert_eq!(t1.end_position(), 1000);
    let mut w2 = t2.open_writer(1000).unwrap();
    w2.write(&[3u8; 200], 1200).unwrap();
    log.commit(1200);

    let mut reader = log.open_reader(1000).unwrap();
    let mut buf = [0u8; 200];
    let mut read = 0;
    while read < 200 {
        read += reader.read(&mut buf[read..]).await.unwrap();
    }
    assert_eq!(&buf, &[3u8; 200]);
}

#[test]
fn sync_then_recover_preserves_durability() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("db");
    {
        let log = StateLog::open_with_sizing(&base, 1024, 64 * 1024).unwrap();
        let t1 = log.define_term(0, 1, 0).unwrap().unwrap();
        let mut w = t1.open_writer(0).unwrap();
        w.write(&[4u8; 5000], 5000).unwrap();
        log.commit(5000);
        assert_eq!(log.sync_commit(0, 1, 5000).unwrap(), Some(5000));
        log.close();
    }
    let log = StateLog::open_with_sizing(&base, 1024, 64 * 1024).unwrap();
    assert!(log.is_durable(5000));
    assert!(!log.is_durable(5001));
    assert_eq!(log.capture_highest().appliable(), 5000);

    let mut reader = log.open_reader(4096).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(reader.try_read(&mut buf).unwrap(), 16);
    assert_eq!(buf, [4u8; 16]);
}

#[test]
fn compaction_is_monotone_across_terms() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open(&tmp);

    let t1 = log.define_term(0, 1, 0).unwrap().unwrap();
    let mut w1 = t1.open_writer(0).unwrap();
    w1.write(&[1u8; 3000], 3000).unwrap();
    log.commit(3000);
    let t2 = log.define_term(1, 2, 3000).unwrap().unwrap();
    let mut w2 = t2.open_writer(3000).unwrap();
    w2.write(&[2u8; 1000], 4000).unwrap();
    log.commit(4000);

    log.compact(3000).unwrap();
    assert!(log.term_log(1).is_none());
    // repeated and lower compaction requests are no-ops
    log.compact(3000).unwrap();
    log.compact(100).unwrap();
    assert!(log.term_log(2).is_some());
    assert_eq!(log.capture_highest().appliable(), 4000);
}
