//! Tests for aggregation, filtering and key-based joins.

use ampbeam::aggregate::{AggregateError, PREDICTION_COLUMNS, filter_threshold, promising_subset};
use ampbeam::*;
use anyhow::Result;

fn strings(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| (*s).to_string()).collect()
}

fn prediction_chunk(index: usize, rows: &[(&str, &str, f64, &str)]) -> StageResult {
    StageResult::new(
        index,
        strings(&PREDICTION_COLUMNS),
        rows.iter()
            .map(|&(id, family, p, hemo)| {
                let p = format!("{p:.3}");
                strings(&[id, "KWKLFKKIGAVLKVL", family, p.as_str(), hemo, "0.500"])
            })
            .collect(),
    )
}

#[test]
fn test_aggregation_concatenates_in_chunk_order() -> Result<()> {
    let mut agg = Aggregator::new();
    agg.push(prediction_chunk(2, &[("c", "CLP", 0.7, "Hemo")]))?;
    agg.push(prediction_chunk(0, &[("a", "CLP", 0.9, "NonHemo"), ("b", "NAMP", 0.2, "NonHemo")]))?;
    assert_eq!(agg.row_count(), 3);
    assert_eq!(agg.chunk_count(), 2);
    let table = agg.finish();
    let ids: Vec<_> = table.column("Access")?.collect();
    assert_eq!(ids, ["a", "b", "c"]);
    Ok(())
}

#[test]
fn test_aggregation_refuses_mixed_headers() -> Result<()> {
    let mut agg = Aggregator::new();
    agg.push(prediction_chunk(0, &[("a", "CLP", 0.9, "Hemo")]))?;
    let other = StageResult::new(1, strings(&["Access", "Score"]), vec![strings(&["b", "1"])]);
    assert!(matches!(agg.push(other), Err(AggregateError::ColumnMismatch { chunk: 1, .. })));
    Ok(())
}

#[test]
fn test_threshold_keeps_rows_strictly_above() -> Result<()> {
    let mut agg = Aggregator::new();
    agg.push(prediction_chunk(
        0,
        &[
            ("a", "CLP", 0.5, "Hemo"),
            ("b", "NAMP", 0.499, "Hemo"),
            ("c", "CLP", 0.95, "NonHemo"),
            ("d", "CLP", 0.6, "NonHemo"),
        ],
    ))?;
    let kept = filter_threshold(agg.finish(), "AMP_probability", 0.5)?;
    let ids: Vec<_> = kept.column("Access")?.collect();
    assert_eq!(ids, ["c", "d"]);
    Ok(())
}

#[test]
fn test_threshold_on_non_numeric_value_is_an_error() {
    let table = Table::new(strings(&["Access", "AMP_probability"]), vec![strings(&["a", "high"])]);
    assert!(matches!(
        filter_threshold(table, "AMP_probability", 0.5),
        Err(AggregateError::BadValue { .. })
    ));
}

#[test]
fn test_summary_counts_family_and_hemolysis() -> Result<()> {
    let mut agg = Aggregator::new();
    agg.push(prediction_chunk(
        0,
        &[("a", "CLP", 0.9, "Hemo"), ("b", "CLP", 0.8, "Hemo"), ("c", "MAM", 0.7, "NonHemo")],
    ))?;
    let summary = summarize(&agg.finish(), &["AMP_family", "Hemolytic"])?;
    assert_eq!(summary.total(), 3);
    assert_eq!(summary.counts[&strings(&["CLP", "Hemo"])], 2);
    assert!(summary.to_string().starts_with("AMP_family\tHemolytic\tcount\n"));
    Ok(())
}

#[test]
fn test_join_matches_by_key_regardless_of_order() -> Result<()> {
    let mut main = Table::new(
        strings(&["Access", "Hemolytic"]),
        vec![strings(&["a", "NonHemo"]), strings(&["b", "NonHemo"])],
    );
    let enrichment = EnrichmentTable::from_results(
        "solubility",
        vec![
            StageResult::new(1, strings(&["Access", "Percent_soluble"]), vec![strings(&["a", "75"])]),
            StageResult::new(0, strings(&["Access", "Percent_soluble"]), vec![strings(&["b", "20"])]),
        ],
    )?;
    join_enrichment(&mut main, enrichment)?;
    assert_eq!(main.columns, ["Access", "Hemolytic", "Percent_soluble"]);
    assert_eq!(main.rows[0], ["a", "NonHemo", "75"]);
    assert_eq!(main.rows[1], ["b", "NonHemo", "20"]);
    Ok(())
}

#[test]
fn test_enrichment_chunks_are_aligned_by_column_name() -> Result<()> {
    let mut main = Table::new(strings(&["Access"]), vec![strings(&["a"]), strings(&["b"])]);
    let enrichment = EnrichmentTable::from_results(
        "properties",
        vec![
            StageResult::new(
                1,
                strings(&["Access", "Antigenicity", "Percent_soluble"]),
                vec![strings(&["b", "antigenic", "10"])],
            ),
            StageResult::new(
                0,
                strings(&["Access", "Percent_soluble", "Antigenicity"]),
                vec![strings(&["a", "80", "non-antigenic"])],
            ),
        ],
    )?;
    join_enrichment(&mut main, enrichment)?;
    assert_eq!(main.columns, ["Access", "Percent_soluble", "Antigenicity"]);
    assert_eq!(main.rows[0], ["a", "80", "non-antigenic"]);
    assert_eq!(main.rows[1], ["b", "10", "antigenic"]);
    Ok(())
}

#[test]
fn test_enrichment_chunks_with_different_columns_are_refused() {
    let result = EnrichmentTable::from_results(
        "properties",
        vec![
            StageResult::new(0, strings(&["Access", "Percent_soluble"]), vec![strings(&["a", "80"])]),
            StageResult::new(1, strings(&["Access", "Antigenicity"]), vec![strings(&["b", "antigenic"])]),
        ],
    );
    assert!(matches!(result, Err(AggregateError::ColumnMismatch { chunk: 1, .. })));
}

#[test]
fn test_join_refuses_mismatched_ids_and_leaves_main_alone() {
    let mut main = Table::new(strings(&["Access"]), vec![strings(&["a"]), strings(&["b"])]);
    let before = main.clone();
    let mut enrichment = EnrichmentTable::new("antigenicity", strings(&["Antigenicity"]));
    enrichment.insert("a", strings(&["non-antigenic"]));
    enrichment.insert("z", strings(&["antigenic"]));
    let err = join_enrichment(&mut main, enrichment).unwrap_err();
    match err {
        AggregateError::JoinMismatch { missing, extra, .. } => {
            assert_eq!(missing, 1);
            assert_eq!(extra, 1);
        }
        other => panic!("unexpected {other}"),
    }
    assert_eq!(main, before);
}

#[test]
fn test_join_refuses_duplicate_ids_and_collisions() {
    let mut main = Table::new(strings(&["Access", "Antigenicity"]), vec![strings(&["a", "x"])]);
    let mut dup = EnrichmentTable::new("dup", strings(&["Percent_soluble"]));
    dup.insert("a", strings(&["1"]));
    dup.insert("a", strings(&["2"]));
    assert!(matches!(
        join_enrichment(&mut main, dup),
        Err(AggregateError::JoinMismatch { duplicates: 1, .. })
    ));

    let mut clash = EnrichmentTable::new("clash", strings(&["Antigenicity"]));
    clash.insert("a", strings(&["y"]));
    assert!(matches!(
        join_enrichment(&mut main, clash),
        Err(AggregateError::ColumnCollision { .. })
    ));
}

#[test]
fn test_promising_needs_every_property() -> Result<()> {
    let table = Table::new(
        strings(&[
            "Access",
            "Hemolytic",
            "Percent_soluble",
            "Antigenicity",
            "Susceptible_to_proteases",
        ]),
        vec![
            strings(&["good", "NonHemo", "80", "non-antigenic", "resistant"]),
            strings(&["hemo", "Hemo", "80", "non-antigenic", "resistant"]),
            strings(&["insoluble", "NonHemo", "10", "non-antigenic", "resistant"]),
            strings(&["antigenic", "NonHemo", "80", "antigenic", "resistant"]),
            strings(&["cleaved", "NonHemo", "80", "non-antigenic", "susceptible"]),
            strings(&["unknown", "NonHemo", "80", "maybe", "resistant"]),
        ],
    );
    let promising = promising_subset(&table, 50.0)?;
    let ids: Vec<_> = promising.column("Access")?.collect();
    assert_eq!(ids, ["good"]);
    Ok(())
}
