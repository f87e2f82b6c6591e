//! k-way merge of sorted pair streams and grouping of equal keys.

use super::run::Pair;
use crate::error::PipelineError;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// A sorted source of pairs: a run file or an in-memory bucket.
pub type PairSource = Box<dyn Iterator<Item = Result<Pair, PipelineError>> + Send>;

/// Merges sorted sources into one globally sorted stream.
///
/// Every source must already be sorted by `(key, value)`. The merge checks
/// this as it goes: a pair smaller than the previous output is reported as
/// [`PipelineError::DedupFailure`] and ends the stream.
pub struct KWayMerge {
    sources: Vec<PairSource>,
    heap: BinaryHeap<Reverse<(Pair, usize)>>,
    last: Option<Pair>,
    primed: bool,
    failed: bool,
}

impl KWayMerge {
    pub fn new(sources: Vec<PairSource>) -> Self {
        let heap = BinaryHeap::with_capacity(sources.len());
        Self {
            sources,
            heap,
            last: None,
            primed: false,
            failed: false,
        }
    }

    fn pull(&mut self, source: usize) -> Result<(), PipelineError> {
        if let Some(next) = self.sources[source].next() {
            self.heap.push(Reverse((next?, source)));
        }
        Ok(())
    }

    fn step(&mut self) -> Result<Option<Pair>, PipelineError> {
        if !self.primed {
            self.primed = true;
            for i in 0..self.sources.len() {
                self.pull(i)?;
            }
        }
        let Some(Reverse((pair, source))) = self.heap.pop() else {
            return Ok(None);
        };
        self.pull(source)?;
        if let Some(last) = &self.last
            && pair < *last
        {
            return Err(PipelineError::DedupFailure(format!(
                "merge out of order: `{}` after `{}`",
                pair.0, last.0
            )));
        }
        self.last = Some(pair.clone());
        Ok(Some(pair))
    }
}

impl Iterator for KWayMerge {
    type Item = Result<Pair, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.step() {
            Ok(pair) => pair.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// One distinct key with every value that carried it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub key: String,
    pub values: Vec<String>,
}

/// Collapses consecutive equal keys of a sorted stream into [`Group`]s.
pub struct GroupConsecutive<I> {
    inner: I,
    current: Option<Group>,
    failed: bool,
}

impl<I> GroupConsecutive<I>
where
    I: Iterator<Item = Result<Pair, PipelineError>>,
{
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            current: None,
            failed: false,
        }
    }
}

impl<I> Iterator for GroupConsecutive<I>
where
    I: Iterator<Item = Result<Pair, PipelineError>>,
{
    type Item = Result<Group, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            match self.inner.next() {
                None => return self.current.take().map(Ok),
                Some(Err(e)) => {
                    self.failed = true;
                    return Some(Err(e));
                }
                Some(Ok((key, value))) => match &mut self.current {
                    Some(group) if group.key == key => group.values.push(value),
                    Some(group) if key < group.key => {
                        self.failed = true;
                        return Some(Err(PipelineError::DedupFailure(format!(
                            "grouping out of order: `{key}` after `{}`",
                            group.key
                        ))));
                    }
                    slot => {
                        let finished = slot.replace(Group {
                            key,
                            values: vec![value],
                        });
                        if finished.is_some() {
                            return finished.map(Ok);
                        }
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pairs: &[(&str, &str)]) -> PairSource {
        let v: Vec<Result<Pair, PipelineError>> = pairs
            .iter()
            .map(|(k, v)| Ok(((*k).to_string(), (*v).to_string())))
            .collect();
        Box::new(v.into_iter())
    }

    #[test]
    fn merges_and_groups() {
        let merged = KWayMerge::new(vec![
            source(&[("AA", "1"), ("CC", "3")]),
            source(&[("AA", "2"), ("BB", "4")]),
            source(&[]),
        ]);
        let groups: Vec<Group> = GroupConsecutive::new(merged).collect::<Result<_, _>>().unwrap();
        let keys: Vec<_> = groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, ["AA", "BB", "CC"]);
        assert_eq!(groups[0].values, ["1", "2"]);
    }

    #[test]
    fn unsorted_source_is_detected() {
        let merged = KWayMerge::new(vec![source(&[("CC", "1"), ("AA", "2")])]);
        let out: Vec<_> = merged.collect();
        assert!(matches!(out.last(), Some(Err(PipelineError::DedupFailure(_)))));
    }
}
