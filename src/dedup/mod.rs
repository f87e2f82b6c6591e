//! External sort-merge deduplication.
//!
//! Groups a key/value stream that may be far larger than memory:
//!
//! 1. pairs are collected into buckets of at most `bucket_bytes`;
//! 2. once `threads` buckets are pending they are sorted in parallel on the
//!    worker pool and spilled as run files into the workspace;
//! 3. runs are merged with a k-way heap merge (in several passes when there
//!    are more than [`MAX_FAN_IN`] runs);
//! 4. consecutive equal keys are collapsed and their values joined by
//!    [`VALUE_SEPARATOR`].
//!
//! Output keys are strictly increasing and every non-blank input value lands
//! in exactly one group. [`Resequencer`] then numbers the groups densely.
//!
//! ```
//! use ampbeam::dedup::{group_records, Resequencer};
//! use ampbeam::record::SequenceRecord;
//! use ampbeam::workspace::Workspace;
//!
//! let ws = Workspace::create(None)?;
//! let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build()?;
//! let recs = vec![
//!     SequenceRecord::new("r1", "kwklf"),
//!     SequenceRecord::new("r2", "KWKLF"),
//!     SequenceRecord::new("r3", "GIGK"),
//! ];
//! let mut reseq = Resequencer::new();
//! let mut clusters = Vec::new();
//! group_records(&ws, &pool, 1 << 20, recs.into_iter().map(Ok), |g| {
//!     clusters.push(reseq.assign(g));
//!     Ok(())
//! })?;
//! assert_eq!(clusters.len(), 2);
//! assert_eq!(clusters[1].members, "r1 r2");
//! assert_eq!(clusters[1].representative, 2);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod merge;
pub mod run;

use crate::error::PipelineError;
use crate::record::SequenceRecord;
use crate::workspace::{Artifact, Workspace};
use merge::{GroupConsecutive, KWayMerge, PairSource};
use rayon::ThreadPool;
use rayon::prelude::*;
use run::{Pair, RunReader, RunWriter, write_run};
use serde::{Deserialize, Serialize};
use std::io;
use std::mem::size_of;

pub use merge::Group;

/// Joins the values of one group. Record ids are cut at the first
/// whitespace, so a space cannot occur inside a value.
pub const VALUE_SEPARATOR: char = ' ';

/// Maximum number of runs merged at once.
pub const MAX_FAN_IN: usize = 128;

/// Prefix of resequenced representative ids.
pub const REPRESENTATIVE_PREFIX: &str = "smORF_";

/// Header of the mapping table written from [`ClusterRecord::to_row`].
pub const CLUSTER_COLUMNS: [&str; 3] = ["Access", "Sequence", "Members"];

/// One row of the deduplication mapping table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// Dense 1-based number in output order.
    pub representative: u64,
    pub sequence: String,
    /// Original ids joined by [`VALUE_SEPARATOR`].
    pub members: String,
}

impl ClusterRecord {
    /// Identifier used for the representative downstream, e.g. `smORF_3`.
    #[must_use]
    pub fn access(&self) -> String {
        format!("{REPRESENTATIVE_PREFIX}{}", self.representative)
    }

    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        self.members.split(VALUE_SEPARATOR)
    }

    #[must_use]
    pub fn to_record(&self) -> SequenceRecord {
        SequenceRecord::new(self.access(), self.sequence.clone())
    }

    #[must_use]
    pub fn to_row(&self) -> Vec<String> {
        vec![self.access(), self.sequence.clone(), self.members.clone()]
    }
}

/// Assigns representative numbers 1..N in output order.
#[derive(Debug, Default)]
pub struct Resequencer {
    next: u64,
}

impl Resequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, group: Group) -> ClusterRecord {
        self.next += 1;
        let mut members = String::new();
        for (i, v) in group.values.iter().enumerate() {
            if i > 0 {
                members.push(VALUE_SEPARATOR);
            }
            members.push_str(v);
        }
        ClusterRecord {
            representative: self.next,
            sequence: group.key,
            members,
        }
    }

    /// Number of representatives assigned so far.
    #[must_use]
    pub fn assigned(&self) -> u64 {
        self.next
    }
}

/// Counters for one grouping pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    /// Pairs read, including blank keys.
    pub pairs: u64,
    pub blank_keys: u64,
    pub runs: usize,
    pub groups: u64,
}

fn pair_cost(pair: &Pair) -> usize {
    pair.0.len() + pair.1.len() + 2 * size_of::<String>()
}

/// Bucketed external grouper bound to one workspace and worker pool.
pub struct ExternalGrouper<'a> {
    workspace: &'a Workspace,
    pool: &'a ThreadPool,
    bucket_bytes: usize,
}

impl<'a> ExternalGrouper<'a> {
    /// `bucket_bytes` is the in-memory budget of a single bucket; up to
    /// `pool.current_num_threads()` buckets are held at once.
    pub fn new(workspace: &'a Workspace, pool: &'a ThreadPool, bucket_bytes: usize) -> Self {
        Self {
            workspace,
            pool,
            bucket_bytes: bucket_bytes.max(1),
        }
    }

    fn sort_and_spill(&self, pending: &mut Vec<Vec<Pair>>, runs: &mut Vec<Artifact>) -> Result<(), PipelineError> {
        let buckets = std::mem::take(pending);
        let spilled = self.pool.install(|| {
            buckets
                .into_par_iter()
                .map(|mut bucket| {
                    bucket.par_sort_unstable();
                    write_run(self.workspace, &bucket)
                })
                .collect::<Result<Vec<_>, PipelineError>>()
        })?;
        runs.extend(spilled);
        Ok(())
    }

    fn open_all(runs: Vec<Artifact>) -> Result<Vec<PairSource>, PipelineError> {
        runs.into_iter()
            .map(|a| RunReader::open(a).map(|r| Box::new(r) as PairSource))
            .collect()
    }

    /// Merge runs in passes until at most [`MAX_FAN_IN`] remain.
    fn reduce_runs(&self, mut runs: Vec<Artifact>) -> Result<Vec<Artifact>, PipelineError> {
        while runs.len() > MAX_FAN_IN {
            let mut next = Vec::with_capacity(runs.len().div_ceil(MAX_FAN_IN));
            let mut rest = runs.into_iter();
            loop {
                let batch: Vec<Artifact> = rest.by_ref().take(MAX_FAN_IN).collect();
                if batch.is_empty() {
                    break;
                }
                let mut writer = RunWriter::create(self.workspace)?;
                for pair in KWayMerge::new(Self::open_all(batch)?) {
                    writer.push(&pair?)?;
                }
                next.push(writer.finish()?);
            }
            log::debug!("dedup: intermediate merge pass left {} runs", next.len());
            runs = next;
        }
        Ok(runs)
    }

    /// Group `pairs` by key and hand every group, in key order, to `emit`.
    ///
    /// # Errors
    /// - [`PipelineError::DedupFailure`] if a value contains [`VALUE_SEPARATOR`],
    ///   if merged keys come out of order, or if non-blank input yields no group
    /// - I/O errors from spilling runs
    /// - any error from `pairs` or `emit`
    pub fn group<I, F>(&self, pairs: I, mut emit: F) -> Result<DedupStats, PipelineError>
    where
        I: IntoIterator<Item = Result<Pair, PipelineError>>,
        F: FnMut(Group) -> Result<(), PipelineError>,
    {
        let threads = self.pool.current_num_threads().max(1);
        let mut stats = DedupStats::default();
        let mut runs: Vec<Artifact> = Vec::new();
        let mut pending: Vec<Vec<Pair>> = Vec::new();
        let mut bucket: Vec<Pair> = Vec::new();
        let mut bucket_used = 0usize;

        for pair in pairs {
            let (key, value) = pair?;
            stats.pairs += 1;
            if key.trim().is_empty() {
                stats.blank_keys += 1;
                continue;
            }
            if value.contains(VALUE_SEPARATOR) {
                return Err(PipelineError::DedupFailure(format!(
                    "value `{value}` contains the group separator"
                )));
            }
            let pair = (key, value);
            let cost = pair_cost(&pair);
            if !bucket.is_empty() && bucket_used + cost > self.bucket_bytes {
                pending.push(std::mem::take(&mut bucket));
                bucket_used = 0;
                if pending.len() >= threads {
                    self.sort_and_spill(&mut pending, &mut runs)?;
                }
            }
            bucket_used += cost;
            bucket.push(pair);
        }
        let non_blank = stats.pairs - stats.blank_keys;

        let sources = if runs.is_empty() && pending.is_empty() {
            // Everything fits in one bucket.
            stats.runs = 1;
            self.pool.install(|| bucket.par_sort_unstable());
            vec![Box::new(bucket.into_iter().map(Ok::<Pair, PipelineError>)) as PairSource]
        } else {
            if !bucket.is_empty() {
                pending.push(bucket);
            }
            self.sort_and_spill(&mut pending, &mut runs)?;
            stats.runs = runs.len();
            Self::open_all(self.reduce_runs(runs)?)?
        };
        log::info!(
            "dedup: {non_blank} pairs ({} blank keys dropped) in {} sorted runs",
            stats.blank_keys,
            stats.runs
        );

        for group in GroupConsecutive::new(KWayMerge::new(sources)) {
            emit(group?)?;
            stats.groups += 1;
        }

        if non_blank > 0 && stats.groups == 0 {
            return Err(PipelineError::DedupFailure(format!(
                "{non_blank} input pairs produced no groups"
            )));
        }
        Ok(stats)
    }
}

/// Group sequence records by normalized sequence, using ids as values.
///
/// # Errors
/// See [`ExternalGrouper::group`]; read errors become [`PipelineError::FatalInput`].
pub fn group_records<I, F>(
    workspace: &Workspace,
    pool: &ThreadPool,
    bucket_bytes: usize,
    records: I,
    emit: F,
) -> Result<DedupStats, PipelineError>
where
    I: IntoIterator<Item = io::Result<SequenceRecord>>,
    F: FnMut(Group) -> Result<(), PipelineError>,
{
    let pairs = records.into_iter().map(|r| {
        r.map(|rec| (rec.key(), rec.id))
            .map_err(|e| PipelineError::FatalInput {
                stage: crate::plan::Stage::Dedup,
                message: format!("reading candidates: {e}"),
            })
    });
    ExternalGrouper::new(workspace, pool, bucket_bytes).group(pairs, emit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(n).build().unwrap()
    }

    #[test]
    fn tiny_buckets_force_multiple_runs() {
        let ws = Workspace::create(None).unwrap();
        let pool = pool(2);
        let pairs = (0..50).map(|i| Ok((format!("K{}", i % 7), format!("id{i}"))));
        let mut groups = Vec::new();
        let stats = ExternalGrouper::new(&ws, &pool, 64)
            .group(pairs, |g| {
                groups.push(g);
                Ok(())
            })
            .unwrap();
        assert!(stats.runs > 1);
        assert_eq!(groups.len(), 7);
        assert_eq!(groups.iter().map(|g| g.values.len()).sum::<usize>(), 50);
        assert!(groups.windows(2).all(|w| w[0].key < w[1].key));
        assert_eq!(std::fs::read_dir(ws.stage_dir(crate::plan::Stage::Dedup).unwrap()).unwrap().count(), 0);
    }

    #[test]
    fn separator_in_value_is_rejected() {
        let ws = Workspace::create(None).unwrap();
        let pool = pool(1);
        let err = ExternalGrouper::new(&ws, &pool, 1024)
            .group([Ok(("KK".to_string(), "a b".to_string()))], |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, PipelineError::DedupFailure(_)));
    }

    #[test]
    fn blank_keys_are_discarded() {
        let ws = Workspace::create(None).unwrap();
        let pool = pool(1);
        let mut n = 0;
        let stats = ExternalGrouper::new(&ws, &pool, 1024)
            .group([Ok(("  ".to_string(), "a".to_string())), Ok(("KK".into(), "b".into()))], |_| {
                n += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!((stats.blank_keys, n), (1, 1));
    }

    #[test]
    fn many_runs_need_intermediate_passes() {
        let ws = Workspace::create(None).unwrap();
        let pool = pool(2);
        let total = MAX_FAN_IN * 3;
        let pairs = (0..total).map(|i| Ok((format!("S{:04}", i % 500), format!("id{i}"))));
        let mut seen = 0;
        let stats = ExternalGrouper::new(&ws, &pool, 1)
            .group(pairs, |g| {
                seen += g.values.len();
                Ok(())
            })
            .unwrap();
        assert!(stats.runs > MAX_FAN_IN);
        assert_eq!(seen, total);
    }
}
