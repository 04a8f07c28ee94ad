use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ml::NodeValue, Error};

/// Activation applied to predicted frames before the loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
    #[default]
    Linear,
    Sigmoid,
    Tanh,
    RelU,
}

impl std::fmt::Display for OutputActivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OutputActivation::Linear => "linear",
            OutputActivation::Sigmoid => "sigmoid",
            OutputActivation::Tanh => "tanh",
            OutputActivation::RelU => "relu",
        };
        write!(f, "{name}")
    }
}

impl FromStr for OutputActivation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" | "none" | "identity" => Ok(Self::Linear),
            "sigmoid" => Ok(Self::Sigmoid),
            "tanh" => Ok(Self::Tanh),
            "relu" => Ok(Self::RelU),
            other => Err(Error::Configuration(format!(
                "there is no such an activation function. ({other})"
            ))),
        }
    }
}

impl OutputActivation {
    pub fn apply(&self, x: NodeValue) -> NodeValue {
        match self {
            OutputActivation::Linear => x,
            OutputActivation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            OutputActivation::Tanh => x.tanh(),
            OutputActivation::RelU => x.max(0.0),
        }
    }

    /// Derivative expressed in terms of the activation output.
    pub fn derivative(&self, activation: NodeValue) -> NodeValue {
        match self {
            OutputActivation::Linear => 1.0,
            OutputActivation::Sigmoid => activation * (1.0 - activation),
            OutputActivation::Tanh => 1.0 - activation.powi(2),
            OutputActivation::RelU => {
                if activation == 0.0 {
                    0.0
                } else {
                    1.0
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_names_parse_at_configuration_time() {
        assert_eq!("tanh".parse::<OutputActivation>().unwrap(), OutputActivation::Tanh);
        assert_eq!("ReLU".parse::<OutputActivation>().unwrap(), OutputActivation::RelU);
        assert_eq!("none".parse::<OutputActivation>().unwrap(), OutputActivation::Linear);

        let err = "softsign".parse::<OutputActivation>().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn activation_derivative_matches_finite_difference() {
        for activation in [
            OutputActivation::Linear,
            OutputActivation::Sigmoid,
            OutputActivation::Tanh,
            OutputActivation::RelU,
        ] {
            let x = 0.3;
            let h = 1e-4;
            let numeric = (activation.apply(x + h) - activation.apply(x - h)) / (2.0 * h);
            let analytic = activation.derivative(activation.apply(x));
            assert!((numeric - analytic).abs() < 1e-3, "{activation}: {numeric} vs {analytic}");
        }
    }
}
