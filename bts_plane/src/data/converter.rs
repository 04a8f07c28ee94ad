use std::{cmp::Reverse, sync::Arc};

use tracing::debug;

use crate::{
    data::{manifest::UtteranceRecord, store::FeatureReader},
    device::Device,
    ml::linear::Linear,
    Error, Result,
};

/// Padded tensors for one minibatch, rows sorted by descending token length.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub ids: Vec<String>,
    /// `batch × max_token_len` token ids, padded with 0.
    pub xs: Vec<Vec<usize>>,
    /// Token lengths including the appended end-of-sequence id.
    pub ilens: Vec<usize>,
    /// One `max_frames × dim` matrix per row, padded with 0.0.
    pub ys: Vec<Linear>,
    /// `batch × max_frames`, 1.0 from the last real frame onward.
    pub labels: Option<Linear>,
    pub olens: Option<Vec<usize>>,
    pub device: Device,
}

impl Batch {
    pub fn empty(device: Device) -> Self {
        Self {
            ids: vec![],
            xs: vec![],
            ilens: vec![],
            ys: vec![],
            labels: None,
            olens: None,
            device,
        }
    }

    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    pub fn max_token_len(&self) -> usize {
        self.xs.first().map(Vec::len).unwrap_or_default()
    }

    pub fn max_frames(&self) -> usize {
        self.ys.first().map(Linear::count).unwrap_or_default()
    }

    pub fn feature_dim(&self) -> usize {
        self.ys.first().map(Linear::stride).unwrap_or_default()
    }

    pub fn has_targets(&self) -> bool {
        self.labels.is_some() && self.olens.is_some()
    }

    /// Real tokens of row `idx`, without padding.
    pub fn tokens(&self, idx: usize) -> &[usize] {
        &self.xs[idx][..self.ilens[idx]]
    }

    /// Splits rows into at most `n` contiguous shards of `ceil(len / n)` rows.
    pub fn shard(&self, n: usize) -> Vec<Batch> {
        if n <= 1 || self.len() <= 1 {
            return vec![self.clone()];
        }
        let chunk = (self.len() + n - 1) / n;
        (0..self.len())
            .step_by(chunk)
            .map(|start| {
                let end = self.len().min(start + chunk);
                Batch {
                    ids: self.ids[start..end].to_vec(),
                    xs: self.xs[start..end].to_vec(),
                    ilens: self.ilens[start..end].to_vec(),
                    ys: self.ys[start..end].to_vec(),
                    labels: self.labels.as_ref().map(|x| x.slice_rows(start, end)),
                    olens: self.olens.as_ref().map(|x| x[start..end].to_vec()),
                    device: self.device,
                }
            })
            .collect()
    }
}

/// Turns a planned group of utterances into a [`Batch`].
#[derive(Clone)]
pub struct Converter {
    reader: Arc<dyn FeatureReader>,
    device: Device,
    return_targets: bool,
}

impl Converter {
    pub fn new(reader: Arc<dyn FeatureReader>, device: Device) -> Self {
        Self {
            reader,
            device,
            return_targets: true,
        }
    }

    /// Leave out stop labels and frame lengths, as used by attention plotting.
    pub fn without_targets(mut self) -> Self {
        self.return_targets = false;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn convert(&self, group: &[Arc<UtteranceRecord>]) -> Result<Batch> {
        let first = match group.first() {
            Some(first) => first,
            None => return Ok(Batch::empty(self.device)),
        };
        let eos = first.eos()?;

        let kept: Vec<&Arc<UtteranceRecord>> = group
            .iter()
            .filter(|x| {
                if x.tokens.is_empty() {
                    debug!("dropping utterance '{}' with empty token sequence", x.id);
                }
                !x.tokens.is_empty()
            })
            .collect();

        let feats = self.read_features(&kept)?;

        let mut rows: Vec<(&Arc<UtteranceRecord>, Linear)> = kept.into_iter().zip(feats).collect();
        rows.sort_by_key(|(x, _)| Reverse(x.tokens.len()));

        let dim = rows.first().map(|(_, y)| y.stride()).unwrap_or_default();
        if let Some((x, y)) = rows.iter().find(|(_, y)| y.stride() != dim) {
            return Err(Error::Shape(format!(
                "utterance '{}' has feature dim {}, expected {dim}",
                x.id,
                y.stride()
            )));
        }

        let ilens: Vec<usize> = rows.iter().map(|(x, _)| x.tokens.len() + 1).collect();
        let olens: Vec<usize> = rows.iter().map(|(_, y)| y.count()).collect();
        let max_in = ilens.iter().copied().max().unwrap_or_default();
        let max_out = olens.iter().copied().max().unwrap_or_default();

        let xs = rows
            .iter()
            .map(|(x, _)| {
                let mut padded = Vec::with_capacity(max_in);
                padded.extend_from_slice(&x.tokens);
                padded.push(eos);
                padded.resize(max_in, 0);
                padded
            })
            .collect();
        let ys = rows
            .iter()
            .map(|(_, y)| y.padded_rows(max_out, 0.0))
            .collect();

        let labels = self.return_targets.then(|| stop_labels(&olens, max_out));
        let ids = rows.iter().map(|(x, _)| x.id.clone()).collect();

        Ok(Batch {
            ids,
            xs,
            ilens,
            ys,
            labels,
            olens: self.return_targets.then_some(olens),
            device: self.device,
        })
    }

    fn read_features(&self, records: &[&Arc<UtteranceRecord>]) -> Result<Vec<Linear>> {
        let read = |x: &&Arc<UtteranceRecord>| -> Result<Linear> {
            let reference = x.feat.as_deref().ok_or_else(|| {
                Error::DataNotFound(format!("utterance '{}' has no feature reference", x.id))
            })?;
            self.reader.read(reference)
        };

        #[cfg(feature = "threadpool")]
        {
            use rayon::prelude::*;
            records.par_iter().map(read).collect()
        }

        #[cfg(not(feature = "threadpool"))]
        {
            records.iter().map(read).collect()
        }
    }
}

/// Row `i` is 0.0 before frame `olens[i] - 1` and 1.0 from there on.
fn stop_labels(olens: &[usize], max_out: usize) -> Linear {
    let mut labels = Linear::new(olens.len(), max_out);
    for (i, &len) in olens.iter().enumerate() {
        let boundary = match len {
            0 => max_out.saturating_sub(1),
            len => len - 1,
        };
        labels.row_mut(i)[boundary..].fill(1.0);
    }
    labels
}
