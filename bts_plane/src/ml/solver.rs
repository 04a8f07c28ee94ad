use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    ml::{linear::Linear, param::Parameter, NodeValue},
    Error, Result,
};

pub trait Optimizer {
    fn step(&mut self, params: &mut [Parameter]) -> Result<()>;
    fn learn_rate(&self) -> NodeValue;
}

/// Adam with L2 weight decay folded into the gradient.
///
/// Moment estimates are keyed by parameter name so the whole optimizer state
/// serializes into a run snapshot and restores onto a rebuilt model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamOptimizer {
    momentum: BTreeMap<String, Linear>,
    rms: BTreeMap<String, Linear>,
    beta: (NodeValue, NodeValue),
    epsilon: NodeValue,
    eta: NodeValue,
    weight_decay: NodeValue,
    t: u64,
}

impl AdamOptimizer {
    pub fn new(learn_rate: NodeValue) -> Self {
        Self::new_builder().with_eta(learn_rate).build()
    }

    pub fn new_builder() -> builder::AdamOptimizerBuilder {
        builder::AdamOptimizerBuilder::default()
    }

    pub fn steps(&self) -> u64 {
        self.t
    }

    fn moments_for(&self, param: &Parameter) -> (Linear, Linear) {
        let zero = || Linear::with_dimensions(param.value());
        let momentum = self
            .momentum
            .get(param.name())
            .filter(|x| x.shape() == param.value().shape())
            .cloned()
            .unwrap_or_else(zero);
        let rms = self
            .rms
            .get(param.name())
            .filter(|x| x.shape() == param.value().shape())
            .cloned()
            .unwrap_or_else(zero);
        (momentum, rms)
    }
}

impl Optimizer for AdamOptimizer {
    fn step(&mut self, params: &mut [Parameter]) -> Result<()> {
        let (beta1, beta2) = self.beta;
        let t = (self.t + 1) as i32;
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2 = 1.0 - beta2.powi(t);

        let mut updates = Vec::with_capacity(params.len());
        for param in params.iter() {
            let (mut momentum, mut rms) = self.moments_for(param);
            let mut next_value = param.value().clone();

            let values = param.value().values();
            let grads = param.grad().values();
            for (idx, (&value, &grad)) in values.iter().zip(grads).enumerate() {
                let grad = grad + self.weight_decay * value;
                let m = &mut momentum.values_mut()[idx];
                *m = beta1 * *m + (1.0 - beta1) * grad;
                let v = &mut rms.values_mut()[idx];
                *v = beta2 * *v + (1.0 - beta2) * grad * grad;

                let m_hat = momentum.values()[idx] / bias_correction1;
                let v_hat = rms.values()[idx] / bias_correction2;
                next_value.values_mut()[idx] = value - self.eta * m_hat / (v_hat.sqrt() + self.epsilon);
            }

            if !next_value.is_finite() {
                return Err(Error::Shape(format!(
                    "failed to update '{}': invalid gradients",
                    param.name()
                )));
            }
            updates.push((param.name().to_string(), next_value, momentum, rms));
        }

        for (param, (name, next_value, momentum, rms)) in params.iter_mut().zip(updates) {
            *param.value_mut() = next_value;
            self.momentum.insert(name.clone(), momentum);
            self.rms.insert(name, rms);
        }
        self.t += 1;
        Ok(())
    }

    fn learn_rate(&self) -> NodeValue {
        self.eta
    }
}

pub mod builder {
    use crate::ml::NodeValue;

    use super::AdamOptimizer;

    pub struct AdamOptimizerBuilder {
        beta: (NodeValue, NodeValue),
        epsilon: NodeValue,
        eta: NodeValue,
        weight_decay: NodeValue,
    }

    impl Default for AdamOptimizerBuilder {
        fn default() -> Self {
            Self {
                beta: (0.9, 0.999),
                epsilon: 1e-8,
                eta: 1e-3,
                weight_decay: 0.0,
            }
        }
    }

    impl AdamOptimizerBuilder {
        pub fn build(self) -> AdamOptimizer {
            AdamOptimizer {
                momentum: Default::default(),
                rms: Default::default(),
                beta: self.beta,
                epsilon: self.epsilon,
                eta: self.eta,
                weight_decay: self.weight_decay,
                t: 0,
            }
        }

        pub fn with_beta(mut self, beta1: NodeValue, beta2: NodeValue) -> Self {
            self.beta = (beta1, beta2);
            self
        }

        pub fn with_epsilon(mut self, epsilon: NodeValue) -> Self {
            self.epsilon = epsilon;
            self
        }

        pub fn with_eta(mut self, eta: NodeValue) -> Self {
            self.eta = eta;
            self
        }

        pub fn with_weight_decay(mut self, weight_decay: NodeValue) -> Self {
            self.weight_decay = weight_decay;
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn quadratic_params() -> Vec<Parameter> {
        vec![Parameter::new("w", Linear::with_value(1, 2, 3.0))]
    }

    #[test]
    fn adam_first_step_moves_by_learn_rate() {
        let mut params = quadratic_params();
        params[0].grad_mut().values_mut().copy_from_slice(&[2.0, -4.0]);

        let mut opt = AdamOptimizer::new(0.1);
        opt.step(&mut params).unwrap();

        // bias corrected first step is eta * sign(grad)
        assert_abs_diff_eq!(params[0].value().get(0, 0), 2.9, epsilon = 1e-6);
        assert_abs_diff_eq!(params[0].value().get(0, 1), 3.1, epsilon = 1e-6);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn adam_can_minimise_quadratic() {
        let mut params = quadratic_params();
        let mut opt = AdamOptimizer::new_builder().with_eta(0.05).build();

        for _ in 0..1000 {
            let grad: Vec<NodeValue> = params[0].value().iter().map(|x| 2.0 * x).collect();
            params[0].grad_mut().values_mut().copy_from_slice(&grad);
            opt.step(&mut params).unwrap();
        }
        assert!(params[0].value().iter().all(|x| x.abs() < 0.25));
    }

    #[test]
    fn adam_rejects_non_finite_updates_without_touching_params() {
        let mut params = quadratic_params();
        params[0].grad_mut().values_mut()[0] = NodeValue::NAN;

        let mut opt = AdamOptimizer::new(0.1);
        assert!(opt.step(&mut params).is_err());
        assert_eq!(params[0].value(), &Linear::with_value(1, 2, 3.0));
        assert_eq!(opt.steps(), 0);
    }

    #[test]
    fn adam_state_survives_serialization() {
        let mut params = quadratic_params();
        params[0].grad_mut().values_mut().copy_from_slice(&[1.0, 1.0]);
        let mut opt = AdamOptimizer::new(0.1);
        opt.step(&mut params).unwrap();

        let json = serde_json::to_string(&opt).unwrap();
        let restored: AdamOptimizer = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, opt);
    }
}
