use std::collections::BTreeMap;

use tracing::{debug, instrument};

use plane::{
    data::{BatchPlan, Converter},
    ml::{
        model::{EvalMode, Trainable},
        NodeValue,
    },
    Result,
};

use crate::report::{Summary, VALIDATION};

/// Runs the model over every group of `plan` without updating it.
///
/// The model is switched to evaluation mode for the pass and switched back
/// when this returns, whether or not a batch failed.
#[instrument(level = "debug", skip_all, fields(groups = plan.len()))]
pub fn evaluate<M>(
    model: &mut M,
    plan: &BatchPlan,
    converter: &Converter,
) -> Result<BTreeMap<String, NodeValue>>
where
    M: Trainable + ?Sized,
{
    let model = EvalMode::new(model);
    let mut summary = Summary::default();

    for group in plan.iter() {
        let batch = converter.convert(group)?;
        if batch.is_empty() {
            debug!("skipping empty validation batch");
            continue;
        }
        let observation = model.evaluate(&batch)?;
        summary.add(VALIDATION, &observation);
    }

    Ok(summary.compute_mean())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use plane::{
        data::{
            planner::make_batchset, store::MemoryStore, BatchConfig, SortPolicy, UtteranceRecord,
        },
        device::Device,
        ml::{linear::Linear, model::Observation, param::Parameter, RngStrategy},
        Error,
    };

    use super::*;

    struct FlakyModel {
        params: Vec<Parameter>,
        training: bool,
        calls: AtomicUsize,
        fail_on: usize,
    }

    impl Trainable for FlakyModel {
        fn parameters(&self) -> &[Parameter] {
            &self.params
        }

        fn parameters_mut(&mut self) -> &mut [Parameter] {
            &mut self.params
        }

        fn forward_backward(&mut self, batch: &plane::data::Batch) -> Result<Observation> {
            self.evaluate(batch)
        }

        fn evaluate(&self, batch: &plane::data::Batch) -> Result<Observation> {
            assert!(!self.training, "evaluation must run outside training mode");
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == self.fail_on {
                return Err(Error::Shape("forced failure".to_string()));
            }
            Ok(Observation::from([("loss".to_string(), batch.len() as NodeValue)]))
        }

        fn set_training(&mut self, training: bool) {
            self.training = training;
        }

        fn is_training(&self) -> bool {
            self.training
        }
    }

    fn fixtures(n: usize) -> (BatchPlan, Converter) {
        let store = MemoryStore::new();
        let records = (0..n).map(|i| {
            store.insert(format!("f{i}"), Linear::new(3, 2));
            UtteranceRecord {
                id: format!("u{i}"),
                feat: Some(format!("f{i}")),
                tokens: vec![1, 2],
                ilen: 3,
                olen: 2,
                idim: 2,
                odim: 5,
            }
        });
        let records: Vec<_> = records.map(Arc::new).collect();
        let config = BatchConfig {
            batch_size: 2,
            max_length_in: 10,
            max_length_out: 10,
            num_batches: 0,
            policy: SortPolicy::Input,
        };
        let plan = make_batchset(&records, &config, &RngStrategy::testable(1).to_arc()).unwrap();
        (plan, Converter::new(Arc::new(store), Device::Cpu))
    }

    fn model(fail_on: usize) -> FlakyModel {
        FlakyModel {
            params: vec![Parameter::new("w", Linear::new(1, 1))],
            training: true,
            calls: AtomicUsize::new(0),
            fail_on,
        }
    }

    #[test_log::test]
    fn evaluation_averages_batches_and_restores_training_mode() {
        let (plan, converter) = fixtures(5);
        let mut model = model(usize::MAX);
        let means = evaluate(&mut model, &plan, &converter).unwrap();

        // groups of 2, 2 and 1 rows
        assert!((means["validation/main/loss"] - 5.0 / 3.0).abs() < 1e-12);
        assert!(model.is_training());
    }

    #[test]
    fn training_mode_is_restored_after_a_failing_batch() {
        let (plan, converter) = fixtures(5);
        let mut model = model(1);
        assert!(evaluate(&mut model, &plan, &converter).is_err());
        assert!(model.is_training());
    }
}
