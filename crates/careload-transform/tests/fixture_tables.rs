use std::path::{Path, PathBuf};

use careload_core::{Entity, LoadMode, RunStamp};
use careload_transform::{read_table, transform};

fn fixture(mode: LoadMode, entity: Entity) -> (String, Vec<u8>) {
    let key = mode.source_key(entity);
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/healthcare-source")
        .join(&key);
    let bytes = std::fs::read(&path).unwrap_or_else(|err| panic!("{}: {err}", path.display()));
    (key, bytes)
}

#[test]
fn every_fixture_normalizes_cleanly() {
    let stamp = RunStamp::now();
    for mode in [LoadMode::Full, LoadMode::Delta] {
        for entity in Entity::ALL {
            let (key, bytes) = fixture(mode, entity);
            let table = read_table(&key, &bytes).expect("fixture parses");
            let rows = table.len();
            let out = transform(entity, mode, table, &stamp)
                .unwrap_or_else(|err| panic!("{key}: {err}"));

            assert_eq!(out.len(), rows, "{key}");
            let (date_column, actor_column) = mode.audit_columns();
            for row in 0..out.len() {
                assert!(out.value(row, entity.primary_key()).is_some(), "{key}");
                assert_eq!(out.value(row, actor_column), Some("ETL_USER"));
                assert!(out.value(row, date_column).is_some());
            }
        }
    }
}

#[test]
fn delta_treatments_fixture_is_header_only() {
    let (key, bytes) = fixture(LoadMode::Delta, Entity::Treatments);
    let table = read_table(&key, &bytes).expect("parses");
    assert!(table.is_empty());
    assert!(table.column_index("treatment_type").is_some());
}
