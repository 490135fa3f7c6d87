use range_store::{
    Cell, Config, Key, LocalBroker, RangeServer, RangeSpec, RangeState, ScanSpec, Schema,
    TableIdentifier,
};
use std::sync::Arc;

#[test_log::test]
fn tombstone_masks_older_insert() -> range_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let fs = Arc::new(LocalBroker::new(folder.path()));
    let server = RangeServer::open(Config::default(), fs)?;

    let table = TableIdentifier::new("T", 1);
    server.update_schema(&table, Schema::parse_simple("T", &[("default", &["x"])])?)?;
    server.load_range(&table, RangeSpec::whole_table(), None, RangeState::Active)?;
    server.acknowledge_load(&table, &RangeSpec::whole_table())?;

    server.update(
        &table,
        vec![Cell::new(Key::insert("r", 1, "", 10, 0), "v")],
        0,
    )?;
    server.update(
        &table,
        vec![Cell::new(Key::delete_cell("r", 1, "", 20, 0), [])],
        0,
    )?;

    let spec = ScanSpec {
        max_versions: 1,
        return_deletes: false,
        ..Default::default()
    };

    let block = server.create_scanner(&table, &spec)?;
    assert!(block.eos);
    assert!(block.is_empty(), "the delete at ts=20 must mask the insert at ts=10");

    // The tombstone itself is visible when asked for
    let spec = ScanSpec {
        return_deletes: true,
        ..Default::default()
    };
    let block = server.create_scanner(&table, &spec)?;
    assert_eq!(1, block.len());

    server.shutdown()?;
    Ok(())
}
