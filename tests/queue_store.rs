use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use tempfile::tempdir;

use ozone_device::queue::{QueueError, RecordQueue};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Rec {
    n: u32,
}

// `{"n":1}\n` is 8 bytes.
const REC_BYTES: u64 = 8;

#[test]
fn records_come_out_in_append_order() {
    let dir = tempdir().unwrap();
    let queue = RecordQueue::<Rec>::open(dir.path().join("q.jsonl"), 1024).unwrap();
    for n in 1..=3 {
        queue.append(&Rec { n }).unwrap();
    }

    let mut drained = Vec::new();
    while let Some(rec) = queue.peek_oldest().unwrap() {
        drained.push(rec.n);
        queue.remove_oldest().unwrap();
    }
    assert_eq!(drained, vec![1, 2, 3]);
    assert!(queue.is_empty().unwrap());
}

#[test]
fn peek_does_not_consume() {
    let dir = tempdir().unwrap();
    let queue = RecordQueue::<Rec>::open(dir.path().join("q.jsonl"), 1024).unwrap();
    queue.append(&Rec { n: 7 }).unwrap();
    assert_eq!(queue.peek_oldest().unwrap(), Some(Rec { n: 7 }));
    assert_eq!(queue.peek_oldest().unwrap(), Some(Rec { n: 7 }));
    assert_eq!(queue.len().unwrap(), 1);
}

#[test]
fn full_queue_rejects_append_and_keeps_existing_records() {
    let dir = tempdir().unwrap();
    let queue = RecordQueue::<Rec>::open(dir.path().join("q.jsonl"), 2 * REC_BYTES).unwrap();
    queue.append(&Rec { n: 1 }).unwrap();
    queue.append(&Rec { n: 2 }).unwrap();
    assert_eq!(queue.size_bytes(), 2 * REC_BYTES);

    let err = queue.append(&Rec { n: 3 }).unwrap_err();
    assert!(matches!(err, QueueError::Full { size, max, .. } if size == 2 * REC_BYTES && max == 2 * REC_BYTES));
    assert_eq!(queue.len().unwrap(), 2);
    assert_eq!(queue.peek_oldest().unwrap(), Some(Rec { n: 1 }));

    // Space frees up once the front is delivered.
    queue.remove_oldest().unwrap();
    queue.append(&Rec { n: 3 }).unwrap();
    assert_eq!(queue.len().unwrap(), 2);
}

#[test]
fn corrupt_front_record_is_dropped_not_requeued() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("q.jsonl");
    fs::write(&path, "this is not json\n{\"n\":2}\n").unwrap();
    let queue = RecordQueue::<Rec>::open(&path, 1024).unwrap();

    assert_eq!(queue.peek_oldest().unwrap(), Some(Rec { n: 2 }));
    assert_eq!(queue.len().unwrap(), 1);
    assert!(!fs::read_to_string(&path).unwrap().contains("not json"));
}

#[test]
fn torn_tail_is_sealed_before_next_append() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("q.jsonl");
    let queue = RecordQueue::<Rec>::open(&path, 1024).unwrap();
    queue.append(&Rec { n: 1 }).unwrap();

    // Power loss in the middle of writing the second record.
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"{\"n\":").unwrap();
    drop(file);

    queue.append(&Rec { n: 3 }).unwrap();
    assert_eq!(queue.len().unwrap(), 3);

    assert_eq!(queue.peek_oldest().unwrap(), Some(Rec { n: 1 }));
    queue.remove_oldest().unwrap();
    // The torn record is skipped as corrupt; the new one is intact.
    assert_eq!(queue.peek_oldest().unwrap(), Some(Rec { n: 3 }));
    queue.remove_oldest().unwrap();
    assert_eq!(queue.peek_oldest().unwrap(), None);
}

#[test]
fn blank_lines_are_ignored() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("q.jsonl");
    fs::write(&path, "\n\n{\"n\":1}\n\n{\"n\":2}\n").unwrap();
    let queue = RecordQueue::<Rec>::open(&path, 1024).unwrap();
    assert_eq!(queue.len().unwrap(), 2);
    queue.remove_oldest().unwrap();
    assert_eq!(queue.peek_oldest().unwrap(), Some(Rec { n: 2 }));
}

#[test]
fn records_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("q.jsonl");
    {
        let queue = RecordQueue::<Rec>::open(&path, 1024).unwrap();
        queue.append(&Rec { n: 1 }).unwrap();
        queue.append(&Rec { n: 2 }).unwrap();
    }
    let queue = RecordQueue::<Rec>::open(&path, 1024).unwrap();
    assert_eq!(queue.len().unwrap(), 2);
    assert_eq!(queue.peek_oldest().unwrap(), Some(Rec { n: 1 }));
}

#[test]
fn remove_and_clear_on_empty_queue_are_noops() {
    let dir = tempdir().unwrap();
    let queue = RecordQueue::<Rec>::open(dir.path().join("nested/q.jsonl"), 1024).unwrap();
    queue.remove_oldest().unwrap();
    queue.clear().unwrap();
    assert_eq!(queue.peek_oldest().unwrap(), None);
    assert_eq!(queue.size_bytes(), 0);
}

#[test]
fn clear_drops_everything() {
    let dir = tempdir().unwrap();
    let queue = RecordQueue::<Rec>::open(dir.path().join("q.jsonl"), 1024).unwrap();
    for n in 0..5 {
        queue.append(&Rec { n }).unwrap();
    }
    queue.clear().unwrap();
    assert!(queue.is_empty().unwrap());
    queue.append(&Rec { n: 9 }).unwrap();
    assert_eq!(queue.peek_oldest().unwrap(), Some(Rec { n: 9 }));
}

#[test]
fn append_after_removal_lands_in_the_renamed_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("q.jsonl");
    {
        let queue = RecordQueue::<Rec>::open(&path, 1024).unwrap();
        queue.append(&Rec { n: 1 }).unwrap();
        queue.append(&Rec { n: 2 }).unwrap();
        queue.remove_oldest().unwrap();
        queue.append(&Rec { n: 3 }).unwrap();
    }
    assert!(!path.with_extension("tmp").exists());

    let queue = RecordQueue::<Rec>::open(&path, 1024).unwrap();
    assert_eq!(queue.len().unwrap(), 2);
    assert_eq!(queue.peek_oldest().unwrap(), Some(Rec { n: 2 }));
    queue.remove_oldest().unwrap();
    assert_eq!(queue.peek_oldest().unwrap(), Some(Rec { n: 3 }));
}
