use helion::boundary;
use helion::telemetry::{BusMetrics, TelemetrySnapshot};
use std::collections::BTreeMap;

fn populated_snapshot() -> TelemetrySnapshot {
    let mut registers = BTreeMap::new();
    registers.insert(1013, 120);
    registers.insert(1040, 950);
    registers.insert(1060, 3);
    registers.insert(1070, 2);
    registers.insert(1090, 4987);
    TelemetrySnapshot {
        timestamp: "01/08/2026 16:40:00".to_string(),
        ts_iso: "2026-08-01T16:40:00".to_string(),
        bus_ok: true,
        registers,
        metrics: BusMetrics {
            read_ok: 1234,
            read_err: 7,
            write_ok: 55,
            write_err: 2,
            resyncs: 1,
            last_reset_iso: "2026-08-01T09:00:00".to_string(),
            last_writer_id: "418".to_string(),
            foreign_frames_total: 4,
            foreign_alert: true,
            foreign_last_iso: "2026-08-01T16:39:58".to_string(),
        },
    }
}

#[test]
fn snapshot_round_trips_losslessly() {
    let snapshot = populated_snapshot();
    let rendered = snapshot.render(&[1013, 1040, 1060, 1070, 1090]);
    let parsed = TelemetrySnapshot::parse(&rendered);
    assert_eq!(parsed, snapshot);
}

#[test]
fn rendered_document_exposes_the_meta_section() {
    let snapshot = populated_snapshot();
    let rendered = snapshot.render(&[1040]);

    assert!(rendered.contains("<BUS_OK>1</BUS_OK>"));
    assert!(rendered.contains("<READ_OK_TOTAL>1234</READ_OK_TOTAL>"));
    assert!(rendered.contains("<WRITE_ERR_TOTAL>2</WRITE_ERR_TOTAL>"));
    assert!(rendered.contains("<RESYNCS>1</RESYNCS>"));
    assert!(rendered.contains("<WRITER_LAST_ID>418</WRITER_LAST_ID>"));
    assert!(rendered.contains("<FOREIGN_FRAMES_TOTAL>4</FOREIGN_FRAMES_TOTAL>"));
    assert!(rendered.contains("<FOREIGN_ALERT>1</FOREIGN_ALERT>"));
}

#[test]
fn neighbor_file_read_consumes_only_the_grid_sensor() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("FromSnapshot_remote.xml");
    let snapshot = populated_snapshot();
    boundary::write_atomic(&path, &snapshot.render(&[1013, 1040, 1090])).unwrap();

    assert_eq!(boundary::read_register_from_file(&path, 1090), Some(4987));
    // a missing file reads as nothing, not as an error
    assert_eq!(
        boundary::read_register_from_file(&dir.path().join("absent.xml"), 1090),
        None
    );
}

#[test]
fn atomic_replace_leaves_a_parsable_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("FromSnapshot.xml");

    for i in 0..20 {
        let mut snapshot = populated_snapshot();
        snapshot.registers.insert(1090, 4000 + i);
        boundary::write_atomic(&path, &snapshot.render(&[1090])).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let parsed = TelemetrySnapshot::parse(&text);
        assert_eq!(parsed.get(1090), Some(4000 + i));
    }
}
