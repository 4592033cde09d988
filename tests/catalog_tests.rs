use std::fs;
use std::path::Path;

use tempfile::tempdir;

use tcengine::catalog::{extract_catalog, CatalogError, ParamType, ReadinessLevel};
use tcengine::TcmdId;

fn write_source(dir: &Path, name: &str, content: &str) {
    fs::write(dir.join(name), content).unwrap();
}

const POWER_DECLARATION: &str = r"
// Power subsystem telecommands.
//
// @tcmd SET_POWER 0x10
// @args level: uint8
// @doc Set the EPS output power level.
// @end
";

#[test]
fn test_valid_declaration_is_extracted() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "eps.c", POWER_DECLARATION);

    let report = extract_catalog(dir.path()).unwrap();
    assert_eq!(report.catalog.len(), 1);
    assert!(report.warnings.is_empty());

    let def = report.catalog.get(TcmdId(0x10)).unwrap();
    assert_eq!(def.name, "SET_POWER");
    assert_eq!(def.params.len(), 1);
    assert_eq!(def.params[0].name, "level");
    assert_eq!(def.params[0].ty, ParamType::U8);
    assert_eq!(def.doc, "Set the EPS output power level.");
    assert_eq!(def.readiness, ReadinessLevel::InDevelopment);
}

#[test]
fn test_malformed_declaration_excluded_with_warning() {
    // The §8 example: one valid declaration and one with an unresolvable
    // type yields a catalog with one entry and one warning.
    let dir = tempdir().unwrap();
    write_source(dir.path(), "eps.c", POWER_DECLARATION);
    write_source(
        dir.path(),
        "adcs.c",
        r"
// @tcmd SET_ATTITUDE 0x20
// @args target: quaternion
// @doc Slew to an attitude.
// @end
",
    );

    let report = extract_catalog(dir.path()).unwrap();
    assert_eq!(report.catalog.len(), 1);
    assert!(report.catalog.get(TcmdId(0x10)).is_some());
    assert!(report.catalog.get(TcmdId(0x20)).is_none());
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].message.contains("quaternion"));
}

#[test]
fn test_duplicate_id_is_fatal() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "a.c", POWER_DECLARATION);
    write_source(
        dir.path(),
        "b.c",
        r"
// @tcmd REBOOT 0x10
// @doc Reboot the OBC.
// @end
",
    );

    let err = extract_catalog(dir.path()).unwrap_err();
    match err {
        CatalogError::DuplicateId { id, .. } => assert_eq!(id, TcmdId(0x10)),
        other => panic!("expected DuplicateId, got {other:?}"),
    }
}

#[test]
fn test_duplicate_name_distinct_ids_is_flagged_not_fatal() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "a.c", POWER_DECLARATION);
    write_source(
        dir.path(),
        "b.c",
        r"
// @tcmd SET_POWER 0x11
// @args level: uint8
// @doc Legacy duplicate.
// @end
",
    );

    let report = extract_catalog(dir.path()).unwrap();
    assert_eq!(report.catalog.len(), 2);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].message.contains("duplicate name"));
    // First declaration wins for name lookup.
    assert_eq!(
        report.catalog.get_by_name("SET_POWER").unwrap().id,
        TcmdId(0x10)
    );
}

#[test]
fn test_empty_tree_is_fatal() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "main.c", "int main(void) { return 0; }\n");

    let err = extract_catalog(dir.path()).unwrap_err();
    assert!(matches!(err, CatalogError::NoTelecommands { .. }));
}

#[test]
fn test_missing_root_is_unreadable() {
    let err = extract_catalog(Path::new("/nonexistent/firmware/tree")).unwrap_err();
    assert!(matches!(err, CatalogError::Unreadable { .. }));
}

#[test]
fn test_scan_recurses_and_tolerates_binary_files() {
    let dir = tempdir().unwrap();
    let sub = dir.path().join("drivers").join("eps");
    fs::create_dir_all(&sub).unwrap();
    write_source(&sub, "eps.c", POWER_DECLARATION);
    fs::write(dir.path().join("firmware.bin"), [0x00, 0xFF, 0xFE, 0x80]).unwrap();

    let report = extract_catalog(dir.path()).unwrap();
    assert_eq!(report.catalog.len(), 1);
    // The binary file is skipped with a warning, not an error.
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].message.contains("unreadable"));
}

#[test]
fn test_full_block_with_bounds_readiness_and_response_hint() {
    let dir = tempdir().unwrap();
    write_source(
        dir.path(),
        "comms.c",
        r"
/* @tcmd SET_TX_POWER 0x31
 * @args power_dbm: i32 in 0..=30, beacon: str
 * @ready for_flight
 * @resp u8, u32
 * @doc Set the transmit power.
 * @doc Takes effect on the next pass.
 * @end
 */
",
    );

    let report = extract_catalog(dir.path()).unwrap();
    let def = report.catalog.get_by_name("SET_TX_POWER").unwrap();
    assert_eq!(def.id, TcmdId(0x31));
    assert_eq!(def.readiness, ReadinessLevel::ForFlight);
    assert_eq!(
        def.response_hint,
        Some(vec![ParamType::U8, ParamType::U32])
    );
    let bounds = def.params[0].bounds.unwrap();
    assert_eq!((bounds.min, bounds.max), (0, 30));
    assert_eq!(def.params[1].ty, ParamType::Str);
    assert_eq!(def.doc, "Set the transmit power.\nTakes effect on the next pass.");
}

#[test]
fn test_unterminated_block_is_excluded() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "a.c", POWER_DECLARATION);
    write_source(
        dir.path(),
        "b.c",
        "// @tcmd DANGLING 0x55\n// @doc never closed\n",
    );

    let report = extract_catalog(dir.path()).unwrap();
    assert_eq!(report.catalog.len(), 1);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].message.contains("unterminated"));
}

#[test]
fn test_catalog_iterates_in_declaration_order() {
    let dir = tempdir().unwrap();
    write_source(
        dir.path(),
        "all.c",
        r"
// @tcmd ZULU 0x30
// @doc Last id, first declared.
// @end
// @tcmd ALPHA 0x05
// @doc First id, last declared.
// @end
",
    );

    let report = extract_catalog(dir.path()).unwrap();
    let names: Vec<&str> = report.catalog.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, ["ZULU", "ALPHA"]);
}
