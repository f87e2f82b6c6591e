//! Property tests for partitioning and deduplication.

use ampbeam::*;
use proptest::prelude::*;
use rayon::ThreadPoolBuilder;
use std::collections::BTreeSet;
use std::io;

fn record_strategy() -> impl Strategy<Value = Vec<SequenceRecord>> {
    prop::collection::vec("[ACDEFGHIKLMNPQRSTVWY]{0,40}", 0..120).prop_map(|seqs| {
        seqs.into_iter()
            .enumerate()
            .map(|(i, s)| SequenceRecord::new(format!("r{i}"), s))
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_partition_reconstructs_input(records in record_strategy(), budget in 1u64..400) {
        let result = partition_all(records.iter().cloned().map(Ok::<_, io::Error>), ByteSize::new(budget));
        if records.is_empty() {
            prop_assert!(matches!(result, Err(PipelineError::EmptyInput { .. })), "expected EmptyInput error");
        } else {
            let chunks = result?;
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index, i);
                prop_assert!(chunk.bytes as u64 <= budget || chunk.len() == 1);
            }
            let rebuilt: Vec<_> = chunks.into_iter().flat_map(|c| c.records).collect();
            prop_assert_eq!(rebuilt, records);
        }
    }

    #[test]
    fn test_dedup_groups_distinct_keys(
        seqs in prop::collection::vec("[KWG ]{0,6}", 1..150),
        bucket in 32usize..512,
    ) {
        let records: Vec<_> = seqs
            .iter()
            .enumerate()
            .map(|(i, s)| SequenceRecord::new(format!("id{i}"), s.clone()))
            .collect();
        let expected: BTreeSet<String> = records
            .iter()
            .map(SequenceRecord::key)
            .filter(|k| !k.is_empty())
            .collect();

        let workspace = Workspace::create(None)?;
        let pool = ThreadPoolBuilder::new().num_threads(2).build()?;
        let mut resequencer = Resequencer::new();
        let mut clusters = Vec::new();
        let stats = group_records(
            &workspace,
            &pool,
            bucket,
            records.into_iter().map(Ok::<_, io::Error>),
            |group| {
                clusters.push(resequencer.assign(group));
                Ok(())
            },
        )?;

        prop_assert_eq!(stats.groups, expected.len() as u64);
        let numbers: Vec<u64> = clusters.iter().map(|c| c.representative).collect();
        let dense: Vec<u64> = (1..=expected.len() as u64).collect();
        prop_assert_eq!(numbers, dense);
        let keys: BTreeSet<String> = clusters.iter().map(|c| c.sequence.clone()).collect();
        prop_assert_eq!(keys, expected);
    }
}
