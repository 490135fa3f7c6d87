use rand::RngCore;
use range_store::{
    Cell, CompactionKind, Config, IntervalScanner, Key, LocalBroker, LocalClient, LocalLocator,
    Locator, RangeServer, RangeServerClient, RangeSpec, RangeState, ScanSpec, Schema,
    TableIdentifier,
};
use std::{sync::Arc, time::Duration};

#[test_log::test]
fn scanner_sees_every_row_across_a_split() -> range_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let fs = Arc::new(LocalBroker::new(folder.path()));

    let config = Config::default()
        .split_size(64 * 1024)
        .commit_log_flush(false);
    let server = RangeServer::open_at(config, fs, "rs1")?;

    let table = TableIdentifier::new("T", 1);
    server.update_schema(&table, Schema::parse_simple("T", &[("default", &["x"])])?)?;
    server.load_range(&table, RangeSpec::whole_table(), None, RangeState::Active)?;
    server.acknowledge_load(&table, &RangeSpec::whole_table())?;

    let mut rng = rand::rng();
    let mut cells = vec![];
    for row in b'a'..=b'z' {
        let mut value = vec![0u8; 8 * 1024];
        rng.fill_bytes(&mut value);
        cells.push(Cell::new(
            Key::insert([row].as_slice(), 1, "", 10, 0),
            value,
        ));
    }
    server.update(&table, cells, 0)?;

    let client = Arc::new(LocalClient::new());
    client.register("rs1", server.clone());
    let locator = Arc::new(LocalLocator::new(server.clone()));

    // Open the scan, then split the range underneath it
    let locator_dyn: Arc<dyn Locator> = locator.clone();
    let client_dyn: Arc<dyn RangeServerClient> = client.clone();

    let mut scanner = IntervalScanner::new(
        locator_dyn.clone(),
        client_dyn.clone(),
        table.clone(),
        ScanSpec::default(),
        Duration::from_secs(10),
    )?;

    let mut rows = vec![];
    for _ in 0..5 {
        let cell = scanner.next().expect("26 rows queued")?;
        rows.push(cell.key.row.to_vec());
    }

    server.compact(&table, None, CompactionKind::Minor)?;
    server.run_maintenance_cycle()?;
    server.wait_for_maintenance();

    let info = server.context().tables.get("T")?;
    assert_eq!(2, info.ranges().len(), "the split must have completed");

    for cell in scanner {
        rows.push(cell?.key.row.to_vec());
    }

    let expected: Vec<Vec<u8>> = (b'a'..=b'z').map(|row| vec![row]).collect();
    assert_eq!(expected, rows, "every row exactly once, in order");

    // A fresh scan crosses both ranges
    let scanner = IntervalScanner::new(
        locator_dyn,
        client_dyn,
        table,
        ScanSpec::default(),
        Duration::from_secs(10),
    )?;

    let rows: Vec<Vec<u8>> = scanner
        .collect::<range_store::Result<Vec<_>>>()?
        .iter()
        .map(|cell| cell.key.row.to_vec())
        .collect();

    assert_eq!(expected, rows);

    server.shutdown()?;
    Ok(())
}
