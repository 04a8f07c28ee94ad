use tracing::{debug, instrument};

use crate::{
    data::Batch,
    device::Device,
    ml::{
        linear::Linear,
        model::{Observation, Trainable},
        param::Parameter,
        NodeValue,
    },
    Result,
};

/// Replicates a model across devices and splits each batch between replicas.
///
/// Each replica works on a contiguous shard of rows. Gradients and losses are
/// merged back as a mean weighted by shard size. Shards keep the batch's
/// padded width, so without loss masking this equals a single pass over the
/// whole batch; with masking each shard normalizes by its own frame count.
#[derive(Debug, Clone)]
pub struct DataParallel<M> {
    module: M,
    devices: Vec<Device>,
    sequential: bool,
}

impl<M: Trainable + Clone + Send + Sync> DataParallel<M> {
    pub fn new(module: M, devices: Vec<Device>) -> Self {
        Self {
            module,
            devices,
            sequential: false,
        }
    }

    /// Run replicas one after another, keeping rng draws in a fixed order.
    pub fn sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    pub fn into_inner(self) -> M {
        self.module
    }

    fn replica_pass(&self, shard: &Batch) -> Result<(Vec<Linear>, Observation)> {
        let mut replica = self.module.clone();
        replica.zero_grad();
        let observation = replica.forward_backward(shard)?;
        let grads = replica
            .parameters()
            .iter()
            .map(|x| x.grad().clone())
            .collect();
        Ok((grads, observation))
    }

    fn scatter(&self, shards: &[Batch]) -> Result<Vec<(Vec<Linear>, Observation)>> {
        #[cfg(feature = "threadpool")]
        if !self.sequential {
            use rayon::prelude::*;
            return shards.par_iter().map(|x| self.replica_pass(x)).collect();
        }

        shards.iter().map(|x| self.replica_pass(x)).collect()
    }
}

impl<M: Trainable + Clone + Send + Sync> Trainable for DataParallel<M> {
    fn parameters(&self) -> &[Parameter] {
        self.module.parameters()
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        self.module.parameters_mut()
    }

    #[instrument(level = "trace", skip_all, fields(replicas = self.devices.len()))]
    fn forward_backward(&mut self, batch: &Batch) -> Result<Observation> {
        let shards = batch.shard(self.devices.len());
        if shards.len() == 1 {
            return self.module.forward_backward(batch);
        }
        debug!("scattering {} rows over {} replicas", batch.len(), shards.len());

        let results = self.scatter(&shards)?;
        let total = batch.len() as NodeValue;

        let mut observation = Observation::new();
        for (shard, (grads, shard_observation)) in shards.iter().zip(results) {
            let weight = shard.len() as NodeValue / total;
            for (param, grad) in self.module.parameters_mut().iter_mut().zip(&grads) {
                param.accumulate_grad(grad, weight)?;
            }
            for (key, value) in shard_observation {
                *observation.entry(key).or_default() += weight * value;
            }
        }
        Ok(observation)
    }

    fn evaluate(&self, batch: &Batch) -> Result<Observation> {
        self.module.evaluate(batch)
    }

    fn set_training(&mut self, training: bool) {
        self.module.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.module.is_training()
    }
}

/// The model as the training loop holds it: bare, or wrapped for replication.
///
/// Checkpointing always goes through [`ModelHandle::module`], so weights are
/// saved the same way in both cases.
#[derive(Debug, Clone)]
pub enum ModelHandle<M> {
    Single(M),
    Replicated(DataParallel<M>),
}

impl<M: Trainable + Clone + Send + Sync> ModelHandle<M> {
    /// Wraps `module` for `ngpu` devices; more than one device replicates it.
    pub fn new(module: M, ngpu: usize, sequential: bool) -> Self {
        if ngpu > 1 {
            ModelHandle::Replicated(
                DataParallel::new(module, Device::ids(ngpu)).sequential(sequential),
            )
        } else {
            ModelHandle::Single(module)
        }
    }

    pub fn module(&self) -> &M {
        match self {
            ModelHandle::Single(module) => module,
            ModelHandle::Replicated(parallel) => parallel.module(),
        }
    }

    pub fn module_mut(&mut self) -> &mut M {
        match self {
            ModelHandle::Single(module) => module,
            ModelHandle::Replicated(parallel) => parallel.module_mut(),
        }
    }

    pub fn is_replicated(&self) -> bool {
        matches!(self, ModelHandle::Replicated(_))
    }

    pub fn into_inner(self) -> M {
        match self {
            ModelHandle::Single(module) => module,
            ModelHandle::Replicated(parallel) => parallel.into_inner(),
        }
    }
}

impl<M: Trainable + Clone + Send + Sync> Trainable for ModelHandle<M> {
    fn parameters(&self) -> &[Parameter] {
        self.module().parameters()
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        self.module_mut().parameters_mut()
    }

    fn forward_backward(&mut self, batch: &Batch) -> Result<Observation> {
        match self {
            ModelHandle::Single(module) => module.forward_backward(batch),
            ModelHandle::Replicated(parallel) => parallel.forward_backward(batch),
        }
    }

    fn evaluate(&self, batch: &Batch) -> Result<Observation> {
        self.module().evaluate(batch)
    }

    fn set_training(&mut self, training: bool) {
        self.module_mut().set_training(training);
    }

    fn is_training(&self) -> bool {
        self.module().is_training()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use crate::ml::{
        tacotron::{Tacotron, TacotronConfig},
        RngStrategy,
    };

    use super::*;

    fn model() -> Tacotron {
        let config = TacotronConfig {
            embed_dim: 3,
            dropout_rate: 0.0,
            ..TacotronConfig::new(5, 2)
        };
        Tacotron::new(config, &RngStrategy::testable(99)).unwrap()
    }

    fn batch() -> Batch {
        let rows = 3;
        let mut labels = Linear::new(rows, 4);
        for row in 0..rows {
            labels.row_mut(row)[3] = 1.0;
        }
        Batch {
            ids: (0..rows).map(|x| x.to_string()).collect(),
            xs: vec![vec![1, 2, 3], vec![4, 1, 0], vec![2, 0, 0]],
            ilens: vec![3, 2, 1],
            ys: (0..rows)
                .map(|r| {
                    Linear::from_iter(2, (0..8).map(|x| ((x + r) as NodeValue * 0.3).sin()))
                        .unwrap()
                })
                .collect(),
            labels: Some(labels),
            olens: Some(vec![4, 4, 4]),
            device: Device::Cpu,
        }
    }

    #[test_log::test]
    fn replicated_gradients_match_single_pass() {
        let batch = batch();
        let mut single = ModelHandle::new(model(), 1, false);
        let mut replicated = ModelHandle::new(model(), 2, false);
        assert!(!single.is_replicated());
        assert!(replicated.is_replicated());

        let a = single.forward_backward(&batch).unwrap();
        let b = replicated.forward_backward(&batch).unwrap();
        assert_abs_diff_eq!(a["loss"], b["loss"], epsilon = 1e-9);

        for (x, y) in single.parameters().iter().zip(replicated.parameters()) {
            for (g1, g2) in x.grad().iter().zip(y.grad().iter()) {
                assert_abs_diff_eq!(g1, g2, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn sequential_replicas_match_parallel_ones() {
        let batch = batch();
        let mut parallel = ModelHandle::new(model(), 3, false);
        let mut sequential = ModelHandle::new(model(), 3, true);
        let a = parallel.forward_backward(&batch).unwrap();
        let b = sequential.forward_backward(&batch).unwrap();
        assert_abs_diff_eq!(a["loss"], b["loss"], epsilon = 1e-12);
    }

    #[test]
    fn module_accessor_reaches_wrapped_model() {
        let mut handle = ModelHandle::new(model(), 2, false);
        handle.set_training(false);
        assert!(!handle.module().is_training());
        assert_eq!(handle.module().parameters().len(), 6);
    }
}
