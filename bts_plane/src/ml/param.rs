use std::collections::BTreeMap;

use crate::{ml::linear::Linear, Error, Result};

/// Named weights keyed the same way the optimizer state and weight blobs are.
pub type StateDict = BTreeMap<String, Linear>;

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    value: Linear,
    grad: Linear,
}

impl Parameter {
    pub fn new<S: Into<String>>(name: S, value: Linear) -> Self {
        let grad = Linear::with_dimensions(&value);
        Self {
            name: name.into(),
            value,
            grad,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Linear {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Linear {
        &mut self.value
    }

    pub fn grad(&self) -> &Linear {
        &self.grad
    }

    pub fn grad_mut(&mut self) -> &mut Linear {
        &mut self.grad
    }

    pub fn zero_grad(&mut self) {
        self.grad.zero();
    }

    pub fn accumulate_grad(&mut self, grad: &Linear, factor: crate::ml::NodeValue) -> Result<()> {
        self.grad.add_scaled(grad, factor)
    }

    pub fn set_value(&mut self, value: Linear) -> Result<()> {
        if value.shape() != self.value.shape() {
            return Err(Error::Shape(format!(
                "parameter '{}' expects {:?}, got {:?}",
                self.name,
                self.value.shape(),
                value.shape()
            )));
        }
        self.value = value;
        Ok(())
    }
}

pub fn state_dict(params: &[Parameter]) -> StateDict {
    params
        .iter()
        .map(|param| (param.name.clone(), param.value.clone()))
        .collect()
}

/// Copies weights into `params`. Every parameter must be present with a matching shape.
pub fn load_state_dict(params: &mut [Parameter], dict: &StateDict) -> Result<()> {
    if dict.len() != params.len() {
        return Err(Error::Shape(format!(
            "state dict has {} entries, model has {} parameters",
            dict.len(),
            params.len()
        )));
    }
    for param in params.iter_mut() {
        let value = dict
            .get(&param.name)
            .ok_or_else(|| Error::Shape(format!("missing parameter '{}'", param.name)))?;
        param.set_value(value.clone())?;
    }
    Ok(())
}

pub fn zero_grad(params: &mut [Parameter]) {
    params.iter_mut().for_each(Parameter::zero_grad);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_dict_round_trips_into_same_shaped_parameters() {
        let mut params = vec![
            Parameter::new("a", Linear::with_value(2, 2, 1.0)),
            Parameter::new("b", Linear::with_value(1, 3, 2.0)),
        ];
        let dict = state_dict(&params);

        params[0].value_mut().zero();
        load_state_dict(&mut params, &dict).unwrap();
        assert_eq!(params[0].value(), &Linear::with_value(2, 2, 1.0));
    }

    #[test]
    fn state_dict_rejects_shape_mismatch() {
        let mut params = vec![Parameter::new("a", Linear::new(2, 2))];
        let mut dict = StateDict::new();
        dict.insert("a".to_string(), Linear::new(3, 2));
        assert!(load_state_dict(&mut params, &dict).is_err());
    }
}
