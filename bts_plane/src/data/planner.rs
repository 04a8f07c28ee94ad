use std::{cmp::Reverse, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    data::manifest::UtteranceRecord,
    ml::ShuffleRng,
    Error, Result,
};

/// How utterances are ordered before being cut into groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortPolicy {
    /// Shuffle, then cut into fixed size groups.
    #[default]
    None,
    /// Longest token sequence first, adaptive group size.
    Input,
    /// Longest feature sequence first, adaptive group size.
    Output,
}

impl std::fmt::Display for SortPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortPolicy::None => write!(f, "none"),
            SortPolicy::Input => write!(f, "input"),
            SortPolicy::Output => write!(f, "output"),
        }
    }
}

impl FromStr for SortPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(SortPolicy::None),
            "input" => Ok(SortPolicy::Input),
            "output" => Ok(SortPolicy::Output),
            _ => Err(Error::Configuration(format!(
                "batch_sort_key should be selected from none, input, and output (got '{s}')"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_length_in: usize,
    pub max_length_out: usize,
    /// Keep only the first `num_batches` groups; `0` keeps all.
    pub num_batches: usize,
    pub policy: SortPolicy,
}

impl BatchConfig {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Configuration("batch size must be positive".to_string()));
        }
        if self.policy != SortPolicy::None && (self.max_length_in == 0 || self.max_length_out == 0) {
            return Err(Error::Configuration(
                "maxlen-in and maxlen-out must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ordered groups of utterances; every utterance appears in exactly one group.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    groups: Vec<Vec<Arc<UtteranceRecord>>>,
}

impl BatchPlan {
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[Vec<Arc<UtteranceRecord>>] {
        &self.groups
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vec<Arc<UtteranceRecord>>> {
        self.groups.iter()
    }

    pub fn utterance_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    /// Plan with the groups in a new order, used for per-epoch reshuffling.
    pub fn shuffled<R: ShuffleRng>(&self, rng: &R) -> Self {
        let mut groups = self.groups.clone();
        rng.shuffle_vec(&mut groups);
        Self { groups }
    }
}

pub fn make_batchset<R>(
    records: &[Arc<UtteranceRecord>],
    config: &BatchConfig,
    rng: &R,
) -> Result<BatchPlan>
where
    R: ShuffleRng + ?Sized,
{
    config.validate()?;

    let mut groups = match config.policy {
        SortPolicy::None => {
            let mut shuffled = records.to_vec();
            rng.shuffle_vec(&mut shuffled);
            shuffled
                .chunks(config.batch_size)
                .map(|chunk| chunk.to_vec())
                .collect()
        }
        SortPolicy::Input => {
            let mut sorted = records.to_vec();
            sorted.sort_by_key(|x| Reverse(x.token_len()));
            // scale factor read from the manifest's declared lengths, swapped
            adaptive_groups(&sorted, config, |x| {
                (x.token_len() / config.max_length_in).max(x.frame_len() / config.max_length_out)
            })
        }
        SortPolicy::Output => {
            let mut sorted = records.to_vec();
            sorted.sort_by_key(|x| Reverse(x.frame_len()));
            adaptive_groups(&sorted, config, |x| {
                (x.frame_len() / config.max_length_in).max(x.token_len() / config.max_length_out)
            })
        }
    };

    if config.num_batches > 0 {
        groups.truncate(config.num_batches);
    }
    info!("# minibatches: {}", groups.len());

    Ok(BatchPlan { groups })
}

/// Cuts a sorted list into groups whose size shrinks with the first member's length.
fn adaptive_groups<F>(
    sorted: &[Arc<UtteranceRecord>],
    config: &BatchConfig,
    factor: F,
) -> Vec<Vec<Arc<UtteranceRecord>>>
where
    F: Fn(&UtteranceRecord) -> usize,
{
    let mut groups = vec![];
    let mut start = 0;
    while start < sorted.len() {
        let size = (config.batch_size / (1 + factor(&sorted[start]))).max(1);
        let end = sorted.len().min(start + size);
        groups.push(sorted[start..end].to_vec());
        start = end;
    }
    groups
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::ml::RngStrategy;

    use super::*;

    fn record(id: usize, frames: usize, tokens: usize) -> Arc<UtteranceRecord> {
        Arc::new(UtteranceRecord {
            id: format!("utt{id:03}"),
            feat: None,
            tokens: vec![1; tokens],
            ilen: frames,
            olen: tokens,
            idim: 4,
            odim: 10,
        })
    }

    fn dataset(n: usize) -> Vec<Arc<UtteranceRecord>> {
        (0..n)
            .map(|i| record(i, 20 + (i * 37) % 500, 3 + (i * 13) % 200))
            .collect()
    }

    fn config(policy: SortPolicy, batch_size: usize) -> BatchConfig {
        BatchConfig {
            batch_size,
            max_length_in: 50,
            max_length_out: 150,
            num_batches: 0,
            policy,
        }
    }

    fn ids(plan: &BatchPlan) -> Vec<String> {
        plan.iter().flatten().map(|x| x.id.clone()).collect()
    }

    #[test_log::test]
    fn every_policy_covers_each_utterance_once() {
        let records = dataset(97);
        let rng = RngStrategy::testable(42).to_arc();
        for policy in [SortPolicy::None, SortPolicy::Input, SortPolicy::Output] {
            let plan = make_batchset(&records, &config(policy, 8), &rng).unwrap();
            let ids = ids(&plan);
            assert_eq!(ids.len(), 97, "policy {policy}");
            assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 97, "policy {policy}");
            assert!(plan.iter().all(|g| !g.is_empty()));
        }
    }

    #[test]
    fn none_policy_uses_fixed_group_size() {
        let records = dataset(23);
        let rng = RngStrategy::testable(7).to_arc();
        let plan = make_batchset(&records, &config(SortPolicy::None, 5), &rng).unwrap();
        let sizes: Vec<_> = plan.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![5, 5, 5, 5, 3]);
    }

    #[test]
    fn none_policy_is_reproducible_for_a_seed() {
        let records = dataset(40);
        let first = make_batchset(
            &records,
            &config(SortPolicy::None, 4),
            &RngStrategy::testable(3).to_arc(),
        )
        .unwrap();
        let second = make_batchset(
            &records,
            &config(SortPolicy::None, 4),
            &RngStrategy::testable(3).to_arc(),
        )
        .unwrap();
        assert_eq!(ids(&first), ids(&second));
    }

    #[test_log::test]
    fn input_policy_sorts_by_token_length_and_adapts_size() {
        let records: Vec<_> = (0..60)
            .map(|i| {
                let tokens = 3 + (i * 13) % 200;
                record(i, tokens * 3, tokens)
            })
            .collect();
        let rng = RngStrategy::testable(1).to_arc();
        let cfg = config(SortPolicy::Input, 16);
        let plan = make_batchset(&records, &cfg, &rng).unwrap();

        let lens: Vec<_> = plan.iter().flatten().map(|x| x.token_len()).collect();
        assert!(lens.windows(2).all(|w| w[0] >= w[1]));

        for group in plan.iter() {
            assert!(group.len() >= 1 && group.len() <= cfg.batch_size);
            let first = &group[0];
            let factor = (first.token_len() / cfg.max_length_in)
                .max(first.frame_len() / cfg.max_length_out);
            let expected = (cfg.batch_size / (1 + factor)).max(1);
            assert!(group.len() <= expected);
        }

        // factors only shrink as lengths shrink, so groups only grow (bar the tail)
        let sizes: Vec<_> = plan.iter().map(Vec::len).collect();
        let body = &sizes[..sizes.len() - 1];
        assert!(body.windows(2).all(|w| w[0] <= w[1]), "{sizes:?}");
    }

    #[test]
    fn output_policy_sorts_by_frame_length() {
        let records = dataset(60);
        let rng = RngStrategy::testable(1).to_arc();
        let cfg = config(SortPolicy::Output, 16);
        let plan = make_batchset(&records, &cfg, &rng).unwrap();

        let lens: Vec<_> = plan.iter().flatten().map(|x| x.frame_len()).collect();
        assert!(lens.windows(2).all(|w| w[0] >= w[1]));

        let first = &plan.groups()[0][0];
        let factor =
            (first.frame_len() / cfg.max_length_in).max(first.token_len() / cfg.max_length_out);
        assert_eq!(plan.groups()[0].len(), (cfg.batch_size / (1 + factor)).max(1));
    }

    #[test]
    fn long_utterances_still_get_a_group() {
        let records = vec![record(0, 100_000, 100_000), record(1, 10, 2)];
        let rng = RngStrategy::testable(1).to_arc();
        let plan = make_batchset(&records, &config(SortPolicy::Input, 4), &rng).unwrap();
        assert_eq!(plan.groups()[0].len(), 1);
        assert_eq!(plan.utterance_count(), 2);
    }

    #[test]
    fn batch_cap_truncates_plan() {
        let records = dataset(50);
        let rng = RngStrategy::testable(1).to_arc();
        let mut cfg = config(SortPolicy::None, 4);
        cfg.num_batches = 3;
        let plan = make_batchset(&records, &cfg, &rng).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.utterance_count(), 12);
    }

    #[test]
    fn empty_dataset_gives_empty_plan() {
        let rng = RngStrategy::testable(1).to_arc();
        let plan = make_batchset(&[], &config(SortPolicy::Input, 4), &rng).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn unknown_policy_is_a_configuration_error() {
        let err = "length".parse::<SortPolicy>().unwrap_err();
        assert!(err.is_configuration());
        assert_eq!("output".parse::<SortPolicy>().unwrap(), SortPolicy::Output);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let rng = RngStrategy::testable(1).to_arc();
        let err = make_batchset(&dataset(3), &config(SortPolicy::None, 0), &rng).unwrap_err();
        assert!(err.is_configuration());
    }
}
