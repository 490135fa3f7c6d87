use range_store::{
    commit_log::{CommitLog, CommitLogOptions, CommitLogReader},
    Filesystem, LocalBroker, TableIdentifier,
};
use std::sync::Arc;

#[test_log::test]
fn linked_log_replays_in_place() -> range_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(folder.path()));
    let table = TableIdentifier::new("T", 1);

    // Log B carries revisions 1..=3
    let log_b = CommitLog::create(fs.clone(), "log-b", CommitLogOptions::default())?;
    for revision in 1..=3i64 {
        log_b.write(&table, format!("b{revision}").as_bytes(), revision)?;
    }
    log_b.close()?;

    // Log A links B, then writes revision 4
    let log_a = CommitLog::create(fs.clone(), "log-a", CommitLogOptions::default())?;
    log_a.link_log("log-b", 3)?;
    log_a.write(&table, b"a4", 4)?;
    log_a.close()?;

    let entries = CommitLogReader::new(fs, "log-a", 0).collect::<range_store::Result<Vec<_>>>()?;

    let revisions: Vec<i64> = entries.iter().map(|e| e.revision).collect();
    assert_eq!(vec![1, 2, 3, 4], revisions);

    let payloads: Vec<&[u8]> = entries.iter().map(|e| e.payload.as_slice()).collect();
    assert_eq!(
        vec![b"b1" as &[u8], b"b2", b"b3", b"a4"],
        payloads
    );

    Ok(())
}
