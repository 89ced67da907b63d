mod common;

use common::*;
use ember_core::*;

#[test]
fn layer_forward_then_backward() -> Result<()> {
    let layer = Conv2d::from_config_seeded(
        Conv2dConfig {
            in_channels: 3,
            out_channels: 5,
            kernel_size: (3, 3),
            padding: (1, 1),
            ..Default::default()
        },
        11,
    )?
    .with_backends(BackendSet::fallback_only());

    let mut rng = rng(12);
    let x = randn(&[2, 3, 8, 8], &mut rng).requires_grad_(true);
    let (y, mut op) = layer.forward(&x)?;
    assert_eq!(y.dims(), &[2, 5, 8, 8]);
    assert_eq!(op.saved_weight().map(|w| w.id()), Some(layer.weight.id()));

    let needs = layer.needs_grad_for(&x);
    assert_eq!(needs, NeedsGrad::all());
    let grads = op.backward(&Tensor::ones(y.shape().clone()), needs)?;
    assert_eq!(grads.arity(), 3);
    assert_eq!(grads.grad_input.tensor().map(|t| t.dims().to_vec()), Some(vec![2, 3, 8, 8]));
    assert_eq!(grads.grad_weight.tensor().map(|t| t.dims().to_vec()), Some(vec![5, 3, 3, 3]));

    // d(sum y)/d bias = number of output positions per channel
    let gb = grads.grad_bias.and_then(GradSlot::into_tensor).expect("bias gradient");
    assert_eq!(gb.to_vec(), vec![128.0; 5]);
    Ok(())
}

#[test]
fn every_forward_gets_its_own_operator() -> Result<()> {
    let layer = Conv2d::new(1, 1, 3, 1, 1)?.with_backends(BackendSet::fallback_only());
    let x = Tensor::ones(Shape::from([1, 1, 4, 4]));
    let (_, mut first) = layer.forward(&x)?;
    let (_, mut second) = layer.forward(&x)?;
    let go = Tensor::ones(Shape::from([1, 1, 4, 4]));
    first.backward(&go, NeedsGrad::all())?;
    second.backward(&go, NeedsGrad::all())?;
    Ok(())
}

#[test]
fn layer_without_bias_has_two_slots() -> Result<()> {
    let layer = Conv2d::from_config_seeded(Conv2dConfig { bias: false, ..Default::default() }, 0)?
        .with_backends(BackendSet::fallback_only());
    let x = Tensor::ones(Shape::from([1, 1, 5, 5]));
    let (y, mut op) = layer.forward(&x)?;
    let grads = op.backward(&Tensor::ones(y.shape().clone()), layer.needs_grad_for(&x))?;
    assert_eq!(grads.arity(), 2);
    assert!(!grads.grad_input.is_requested());
    assert!(grads.grad_weight.is_computed());
    Ok(())
}
