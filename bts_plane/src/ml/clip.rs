use crate::ml::{param::Parameter, NodeValue};

/// Clips gradients by their global norm and returns the norm measured before clipping.
///
/// When the norm exceeds `max_norm` every gradient is scaled by
/// `max_norm / norm`, so the clipped global norm equals `max_norm`.
/// A NaN norm leaves the gradients untouched; the caller decides whether to
/// skip the update.
pub fn clip_grad_norm(params: &mut [Parameter], max_norm: NodeValue) -> NodeValue {
    let global_norm = grad_norm(params);

    if global_norm.is_finite() && global_norm > max_norm {
        let clip_coef = max_norm / global_norm;
        for param in params.iter_mut() {
            param.grad_mut().scale(clip_coef);
        }
    }

    global_norm
}

pub fn grad_norm(params: &[Parameter]) -> NodeValue {
    params
        .iter()
        .map(|param| param.grad().squared_norm())
        .sum::<NodeValue>()
        .sqrt()
}
