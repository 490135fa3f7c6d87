use range_store::{
    Cell, Config, Key, LocalBroker, RangeServer, RangeSpec, RangeState, ScanSpec, Schema,
    TableIdentifier,
};
use std::sync::Arc;

fn collect_rows(server: &RangeServer, table: &TableIdentifier) -> range_store::Result<Vec<Cell>> {
    let mut cells = vec![];

    let mut block = server.create_scanner(table, &ScanSpec::default())?;
    loop {
        for (key, value) in &block.cells {
            cells.push(Cell {
                key: Key::decode(key)?,
                value: value.clone(),
            });
        }
        if block.eos {
            break;
        }
        block = server.fetch_scanblock(block.scanner_id)?;
    }

    Ok(cells)
}

#[test_log::test]
fn write_read_roundtrip_across_restart() -> range_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let table = TableIdentifier::new("T", 1);

    {
        let fs = Arc::new(LocalBroker::new(folder.path()));
        let server = RangeServer::open(Config::default(), fs)?;

        server.update_schema(&table, Schema::parse_simple("T", &[("default", &["x"])])?)?;
        server.load_range(&table, RangeSpec::whole_table(), None, RangeState::Active)?;
        server.acknowledge_load(&table, &RangeSpec::whole_table())?;

        server.update(
            &table,
            vec![
                Cell::new(Key::insert("a", 1, "", 10, 0), "v1"),
                Cell::new(Key::insert("b", 1, "", 10, 0), "v2"),
            ],
            0,
        )?;

        // Visible before any flush
        let cells = collect_rows(&server, &table)?;
        assert_eq!(2, cells.len());

        server.shutdown()?;
    }

    // Reopen: the commit log replays into the caches
    let fs = Arc::new(LocalBroker::new(folder.path()));
    let server = RangeServer::open(Config::default(), fs)?;

    let cells = collect_rows(&server, &table)?;
    assert_eq!(2, cells.len());

    assert_eq!(b"a", &*cells[0].key.row);
    assert_eq!(10, cells[0].key.timestamp);
    assert_eq!(b"v1", &*cells[0].value);

    assert_eq!(b"b", &*cells[1].key.row);
    assert_eq!(b"v2", &*cells[1].value);

    Ok(())
}
