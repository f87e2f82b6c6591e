//! Tests for chunk validation and error collection.

use ampbeam::validation::*;
use ampbeam::*;
use anyhow::{Result, anyhow};
use tempfile::tempdir;

fn prediction(index: usize, rows: &[[&str; 2]]) -> StageResult {
    StageResult::new(
        index,
        vec!["Access".into(), "AMP_probability".into()],
        rows.iter().map(|r| r.iter().map(|s| (*s).to_string()).collect()).collect(),
    )
}

#[derive(Debug)]
struct Thresholds {
    amp: f64,
    solubility: f64,
}

impl Validate for Thresholds {
    fn validate(&self) -> ValidationResult {
        combine_validations(vec![
            validators::in_range("amp", self.amp, 0.0, 1.0),
            validators::in_range("solubility", self.solubility, 0.0, 100.0),
        ])
    }
}

#[test]
fn test_named_schema_accepts_exact_shape() -> Result<()> {
    let v = ChunkValidator::new(ChunkSchema::named(
        Stage::Classify,
        ["Access", "AMP_probability"],
        RowExpectation::Exact { offset: 0 },
    ));
    let ok = v
        .check(prediction(0, &[["a", "0.9"], ["b", "0.1"]]), 2)
        .map_err(|w| anyhow!("{w}"))?;
    assert_eq!(ok.len(), 2);
    assert_eq!(v.rejected(), 0);
    Ok(())
}

#[test]
fn test_identifier_column_rejects_whitespace_and_blanks() -> Result<()> {
    let v = ChunkValidator::new(
        ChunkSchema::named(Stage::CallCandidates, ["Access", "AMP_probability"], RowExpectation::Any)
            .with_identifier("Access"),
    );
    let w = v.check(prediction(3, &[["c1_1", "KWK"], ["c1_2 # 40 # 1", "GIG"]]), 0).unwrap_err();
    assert_eq!(w.chunk, Some(3));
    assert!(w.message.contains("row 2: `c1_2 # 40 # 1`"));
    assert!(w.message.contains("(code: identifier)"));
    assert!(v.check(prediction(4, &[["", "KWK"]]), 0).is_err());

    let ok = v
        .check(prediction(5, &[["c2_1", "KWK"]]), 0)
        .map_err(|w| anyhow!("{w}"))?;
    assert_eq!(ok.rows[0][0], "c2_1");
    assert_eq!(v.rejected(), 2);
    Ok(())
}

#[test]
fn test_named_schema_rejects_renamed_header() {
    let v = ChunkValidator::new(ChunkSchema::named(
        Stage::Classify,
        ["Access", "AMP_prob"],
        RowExpectation::Exact { offset: 0 },
    ));
    let w = v.check(prediction(4, &[["a", "0.9"]]), 1).unwrap_err();
    assert_eq!(w.stage, Stage::Classify);
    assert_eq!(w.chunk, Some(4));
    assert!(w.message.contains("expected [Access, AMP_prob]"));
}

#[test]
fn test_exact_rows_checks_count_not_content() {
    let v = ChunkValidator::new(ChunkSchema::width(Stage::Classify, 2, RowExpectation::Exact { offset: 0 }));
    assert!(v.check(prediction(0, &[["a", "0.9"]]), 2).is_err());
    assert!(v.check(prediction(1, &[["a", "0.9"], ["b", "0.2"], ["c", "0.3"]]), 2).is_err());
    assert!(v.check(prediction(2, &[["x", "not-a-number"], ["y", ""]]), 2).is_ok());
    assert_eq!(v.rejected(), 2);
}

#[test]
fn test_rejections_export_as_json() -> Result<()> {
    let dir = tempdir()?;
    let v = ChunkValidator::new(ChunkSchema::width(Stage::ComputeFeatures, 2, RowExpectation::Exact { offset: 0 }));
    let _ = v.check(prediction(7, &[]), 3);

    let mut collector = ErrorCollector::new();
    collector.extend(v.take_errors());
    collector.add_error(Stage::Enrich, None, vec![ValidationError::new("join refused")]);
    assert_eq!(collector.error_count(), 2);

    let path = dir.path().join("rejected.json");
    collector.write_to_file(&path)?;
    let parsed: Vec<RejectedChunk> = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].chunk, Some(7));
    assert_eq!(parsed[0].errors[0].code.as_deref(), Some("row_count"));
    assert_eq!(parsed[1].stage, Stage::Enrich);
    Ok(())
}

#[test]
fn test_validate_trait_collects_every_field() {
    let errors = Thresholds {
        amp: 1.5,
        solubility: -1.0,
    }
    .validate()
    .unwrap_err();
    let fields: Vec<_> = errors.iter().filter_map(|e| e.field.as_deref()).collect();
    assert_eq!(fields, ["amp", "solubility"]);
    assert!(
        Thresholds {
            amp: 0.5,
            solubility: 50.0
        }
        .validate()
        .is_ok()
    );
}

#[test]
fn test_validation_error_display() {
    let e = ValidationError::field("rows", "row count 1 != expected 2").with_code("row_count");
    assert!(e.to_string().contains("rows"));
    assert!(e.to_string().contains("row count 1 != expected 2"));
}
