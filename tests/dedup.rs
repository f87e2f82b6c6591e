//! Tests for external sort-merge deduplication.

use ampbeam::dedup::{DedupStats, VALUE_SEPARATOR};
use ampbeam::*;
use anyhow::{Context, Result};
use rayon::ThreadPoolBuilder;
use std::collections::BTreeMap;
use std::io;

fn group_all(records: Vec<SequenceRecord>, bucket_bytes: usize) -> Result<(Vec<ClusterRecord>, DedupStats)> {
    let workspace = Workspace::create(None)?;
    let pool = ThreadPoolBuilder::new().num_threads(3).build()?;
    let mut resequencer = Resequencer::new();
    let mut clusters = Vec::new();
    let stats = group_records(
        &workspace,
        &pool,
        bucket_bytes,
        records.into_iter().map(Ok::<_, io::Error>),
        |group| {
            clusters.push(resequencer.assign(group));
            Ok(())
        },
    )?;
    Ok((clusters, stats))
}

#[test]
fn test_duplicates_share_one_representative() -> Result<()> {
    let records = vec![
        SequenceRecord::new("id1", "KWKLFKKIGAVLKVL"),
        SequenceRecord::new("id2", "kwklfkki gavlkvl"),
        SequenceRecord::new("id3", "GIGKFLHSAKKFGKAFVGEIMNS"),
    ];
    let (clusters, stats) = group_all(records, 1 << 20)?;
    assert_eq!(stats.groups, 2);
    assert_eq!(clusters.len(), 2);
    let kw = clusters
        .iter()
        .find(|c| c.sequence == "KWKLFKKIGAVLKVL")
        .context("KWK cluster")?;
    assert_eq!(kw.members, format!("id1{VALUE_SEPARATOR}id2"));
    assert_eq!(kw.member_ids().collect::<Vec<_>>(), ["id1", "id2"]);
    Ok(())
}

#[test]
fn test_representatives_are_numbered_without_gaps() -> Result<()> {
    let records: Vec<_> = (0..500)
        .map(|i| SequenceRecord::new(format!("r{i}"), format!("KK{}", "W".repeat(i % 37 + 1))))
        .collect();
    let (clusters, _) = group_all(records, 256)?;
    assert_eq!(clusters.len(), 37);
    for (i, c) in clusters.iter().enumerate() {
        assert_eq!(c.representative, i as u64 + 1);
        assert_eq!(c.access(), format!("smORF_{}", i + 1));
    }
    Ok(())
}

#[test]
fn test_spilled_result_matches_in_memory_grouping() -> Result<()> {
    let records: Vec<_> = (0..3_000)
        .map(|i| SequenceRecord::new(format!("p{i:05}"), format!("GIGK{}", (i * 7919) % 613)))
        .collect();
    let mut expected: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for r in &records {
        expected.entry(r.key()).or_default().push(r.id.clone());
    }
    for ids in expected.values_mut() {
        ids.sort();
    }

    let (clusters, stats) = group_all(records, 512)?;
    assert!(stats.runs > 1);
    assert_eq!(stats.pairs, 3_000);
    let got: BTreeMap<String, Vec<String>> = clusters
        .iter()
        .map(|c| (c.sequence.clone(), c.member_ids().map(String::from).collect()))
        .collect();
    assert_eq!(got, expected);

    let keys: Vec<_> = clusters.iter().map(|c| c.sequence.clone()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
    Ok(())
}

#[test]
fn test_blank_sequences_are_skipped() -> Result<()> {
    let records = vec![
        SequenceRecord::new("empty", "  "),
        SequenceRecord::new("a", "KKK"),
        SequenceRecord::new("b", "KKK"),
    ];
    let (clusters, stats) = group_all(records, 1 << 20)?;
    assert_eq!(stats.blank_keys, 1);
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].members, "a b");
    Ok(())
}

#[test]
fn test_grouper_refuses_values_with_separator() -> Result<()> {
    let workspace = Workspace::create(None)?;
    let pool = ThreadPoolBuilder::new().num_threads(2).build()?;
    let pairs = vec![Ok(("KKK".to_string(), "two words".to_string()))];
    let err = ExternalGrouper::new(&workspace, &pool, 1024)
        .group(pairs, |_| Ok(()))
        .unwrap_err();
    assert!(matches!(err, PipelineError::DedupFailure(_)));
    assert_eq!(err.exit_code(), 5);
    Ok(())
}

#[test]
fn test_cluster_row_layout() {
    let c = ClusterRecord {
        representative: 12,
        sequence: "KWK".into(),
        members: "x y".into(),
    };
    assert_eq!(c.to_row(), ["smORF_12", "KWK", "x y"]);
    assert_eq!(c.to_record(), SequenceRecord::new("smORF_12", "KWK"));
}
