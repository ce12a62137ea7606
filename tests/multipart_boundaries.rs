//! Integration coverage for multi-part byte concatenation: a part boundary
//! landing inside a number, inside a string literal, and
//! inside a Unicode escape must all be handled as if the document had never
//! been split, because `StreamReader` concatenates parts byte-exact with no
//! injected separator and the extractor's scanner just keeps reading.

use cpt_compare::core::{Core, LoadOutcome, SourceFormat};
use cpt_compare::config::Config;
use std::path::PathBuf;

fn core_with_scratch(dir: &std::path::Path) -> Core {
    Core::new(Config {
        scratch_dir: dir.to_path_buf(),
        ..Config::default()
    })
}

fn write_part(dir: &std::path::Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

#[test]
fn part_boundary_inside_a_number_is_stitched_seamlessly() {
    let dir = tempfile::tempdir().unwrap();
    let core = core_with_scratch(dir.path());

    let whole = r#"{"in_network":[{"billing_code_type":"CPT","billing_code":"99213","description":"Office visit","negotiated_rates":[{"negotiated_prices":[{"negotiated_type":"negotiated","negotiated_rate":123.45,"billing_class":"professional"}]}]}]}"#;
    let split_at = whole.find("123").unwrap() + 2; // split between '2' and '3' of 123.45
    let (head, tail) = whole.split_at(split_at);

    let p1 = write_part(dir.path(), "p1", head.as_bytes());
    let p2 = write_part(dir.path(), "p2", tail.as_bytes());

    let outcome = core.load_source_from_parts(vec![p1, p2], "source-a").unwrap();
    match outcome {
        LoadOutcome::Ingested(report) => {
            assert_eq!(report.count, 1);
            assert_eq!(report.preview[0].code, "99213");
        }
        LoadOutcome::Index(_) => panic!("expected an ingest"),
    }
}

#[test]
fn part_boundary_inside_a_string_literal_is_stitched_seamlessly() {
    let dir = tempfile::tempdir().unwrap();
    let core = core_with_scratch(dir.path());

    let whole = r#"{"in_network":[{"billing_code_type":"CPT","billing_code":"99214","description":"Extended office visit with counseling","negotiated_rates":[{"negotiated_prices":[{"negotiated_type":"negotiated","negotiated_rate":200.0,"billing_class":"professional"}]}]}]}"#;
    let split_at = whole.find("with counseling").unwrap() + 5; // split mid-word, inside the string
    let (head, tail) = whole.split_at(split_at);

    let p1 = write_part(dir.path(), "p1", head.as_bytes());
    let p2 = write_part(dir.path(), "p2", tail.as_bytes());

    let outcome = core.load_source_from_parts(vec![p1, p2], "source-a").unwrap();
    match outcome {
        LoadOutcome::Ingested(report) => {
            assert_eq!(report.count, 1);
            assert_eq!(report.preview[0].description, "Extended office visit with counseling");
        }
        LoadOutcome::Index(_) => panic!("expected an ingest"),
    }
}

#[test]
fn part_boundary_inside_a_unicode_escape_is_stitched_seamlessly() {
    let dir = tempfile::tempdir().unwrap();
    let core = core_with_scratch(dir.path());

    // The description spells "Café" as a literal JSON Unicode escape
    // (not a raw UTF-8 byte) so the split can land inside the four hex
    // digits.
    let whole = "{\"in_network\":[{\"billing_code_type\":\"CPT\",\"billing_code\":\"99215\",\"description\":\"Caf\\u00e9 consultation\",\"negotiated_rates\":[{\"negotiated_prices\":[{\"negotiated_type\":\"negotiated\",\"negotiated_rate\":50.0,\"billing_class\":\"professional\"}]}]}]}";
    let split_at = whole.find("\\u00e9").unwrap() + 3; // split between the 2nd and 3rd hex digit of é
    let (head, tail) = whole.split_at(split_at);

    let p1 = write_part(dir.path(), "p1", head.as_bytes());
    let p2 = write_part(dir.path(), "p2", tail.as_bytes());

    let outcome = core.load_source_from_parts(vec![p1, p2], "source-a").unwrap();
    match outcome {
        LoadOutcome::Ingested(report) => {
            assert_eq!(report.count, 1);
            assert_eq!(report.preview[0].code, "99215");
        }
        LoadOutcome::Index(_) => panic!("expected an ingest"),
    }
}

#[test]
fn three_parts_split_across_multiple_items_still_yields_every_code() {
    let dir = tempfile::tempdir().unwrap();
    let core = core_with_scratch(dir.path());

    let whole = r#"{"in_network":[
        {"billing_code_type":"CPT","billing_code":"10001","description":"a","negotiated_rates":[{"negotiated_prices":[{"negotiated_type":"negotiated","negotiated_rate":10.0,"billing_class":"professional"}]}]},
        {"billing_code_type":"CPT","billing_code":"10002","description":"b","negotiated_rates":[{"negotiated_prices":[{"negotiated_type":"negotiated","negotiated_rate":20.0,"billing_class":"professional"}]}]},
        {"billing_code_type":"CPT","billing_code":"10003","description":"c","negotiated_rates":[{"negotiated_prices":[{"negotiated_type":"negotiated","negotiated_rate":30.0,"billing_class":"professional"}]}]}
    ]}"#;
    let third = whole.len() / 3;
    let p1 = write_part(dir.path(), "p1", &whole.as_bytes()[..third]);
    let p2 = write_part(dir.path(), "p2", &whole.as_bytes()[third..2 * third]);
    let p3 = write_part(dir.path(), "p3", &whole.as_bytes()[2 * third..]);

    let outcome = core.load_source_from_parts(vec![p1, p2, p3], "source-a").unwrap();
    match outcome {
        LoadOutcome::Ingested(report) => assert_eq!(report.count, 3),
        LoadOutcome::Index(_) => panic!("expected an ingest"),
    }
}
