mod common;

use common::*;
use ember_core::*;

fn fallback_only(params: ConvParams) -> ConvolutionOperator {
    ConvolutionOperator::with_backends(params, BackendSet::fallback_only())
}

#[test]
fn fallback_rejects_groups_before_touching_anything() -> Result<()> {
    let recorder = RecordingFallback::default();
    let params = ConvParams::new((1, 1), (0, 0), 2)?;
    let mut op = ConvolutionOperator::with_backends(params, fallback_set(recorder.clone()));
    let x = Tensor::ones(Shape::from([1, 4, 5, 5]));
    let w = Tensor::ones(Shape::from([2, 2, 3, 3]));

    let err = op.forward(&x, &w, None).unwrap_err();
    assert!(matches!(err, EmberError::UnsupportedConfiguration(_)), "got {err}");
    assert!(recorder.calls().is_empty());
    assert!(op.backend_kind().is_none());
    assert!(op.workspaces().is_none());
    assert!(op.saved_input().is_none());

    // Nothing was recorded, so there is nothing to differentiate.
    let go = Tensor::zeros(Shape::from([1, 2, 3, 3]));
    assert!(matches!(op.backward(&go, NeedsGrad::all()), Err(EmberError::InvalidState(_))));
    Ok(())
}

#[test]
fn fallback_route_keeps_workspaces() -> Result<()> {
    let mut op = fallback_only(ConvParams::default());
    let x = Tensor::ones(Shape::from([2, 3, 6, 6]));
    let w = Tensor::ones(Shape::from([4, 3, 3, 3]));
    op.forward(&x, &w, None)?;

    assert_eq!(op.backend_kind(), Some(BackendKind::Fallback));
    let ws = op.workspaces().expect("fallback keeps workspaces");
    // unfolded input: [N, C*kH*kW, H_out*W_out]
    assert_eq!(ws.finput.dims(), &[2, 27, 16]);
    assert_eq!(ws.fgrad_input.elem_count(), 0);
    assert_eq!(op.saved_input().map(|t| t.id()), Some(x.id()));
    assert_eq!(op.saved_weight().map(|t| t.id()), Some(w.id()));
    assert!(op.saved_bias().is_none());
    Ok(())
}

#[test]
fn kernel_geometry_is_passed_width_first() -> Result<()> {
    let recorder = RecordingFallback::default();
    let params = ConvParams::new((2, 1), (1, 0), 1)?;
    let mut op = ConvolutionOperator::with_backends(params, fallback_set(recorder.clone()));
    let mut rng = rng(3);
    let x = randn(&[1, 2, 7, 5], &mut rng);
    // kH = 3, kW = 2
    let w = randn(&[3, 2, 3, 2], &mut rng);
    let b = randn(&[3], &mut rng);
    let y = op.forward(&x, &w, Some(&b))?;
    assert_eq!(y.dims(), &[1, 3, 4, 4]);
    op.backward(&Tensor::ones(y.shape().clone()), NeedsGrad::all())?;

    let calls = recorder.calls();
    assert_eq!(calls.len(), 3);
    let expected: Geometry = [2, 3, 1, 2, 0, 1];
    for call in &calls {
        let geometry = match call {
            Call::UpdateOutput { geometry, .. }
            | Call::UpdateGradInput { geometry, .. }
            | Call::AccGradParameters { geometry, .. } => geometry,
        };
        assert_eq!(geometry, &expected, "{:?}", call);
    }
    Ok(())
}

#[test]
fn kernel_failure_in_forward_finishes_the_operator() -> Result<()> {
    let mut op = fallback_only(ConvParams::default());
    let x = Tensor::ones(Shape::from([1, 2, 4, 4]));
    // weight channels do not match the input
    let w = Tensor::ones(Shape::from([1, 3, 3, 3]));
    assert!(matches!(op.forward(&x, &w, None), Err(EmberError::ShapeMismatch { .. })));

    let w_ok = Tensor::ones(Shape::from([1, 2, 3, 3]));
    assert!(matches!(op.forward(&x, &w_ok, None), Err(EmberError::InvalidState(_))));
    Ok(())
}

#[cfg(feature = "accelerated")]
mod accelerated {
    use super::*;

    fn accelerated(params: ConvParams) -> ConvolutionOperator {
        ConvolutionOperator::with_backends(params, BackendSet::reference_with_accelerated(true))
    }

    #[test]
    fn f32_input_takes_the_specialized_route() -> Result<()> {
        let mut op = accelerated(ConvParams::default());
        let x = Tensor::ones(Shape::from([1, 1, 4, 4]));
        let w = Tensor::ones(Shape::from([1, 1, 3, 3]));
        op.forward(&x, &w, None)?;
        assert_eq!(op.backend_kind(), Some(BackendKind::Specialized));
        assert!(op.workspaces().is_none());
        Ok(())
    }

    #[test]
    fn specialized_route_runs_grouped_convolution() -> Result<()> {
        let mut op = accelerated(ConvParams::new((1, 1), (1, 1), 2)?);
        let x = Tensor::ones(Shape::from([1, 4, 5, 5]));
        let w = Tensor::ones(Shape::from([2, 2, 3, 3]));
        let y = op.forward(&x, &w, None)?;
        assert_eq!(y.dims(), &[1, 2, 5, 5]);
        // centre tap sees 2 channels x 9 taps
        assert_eq!(y.data()[12], 18.0);
        Ok(())
    }

    #[test]
    fn bf16_input_falls_back() -> Result<()> {
        let mut op = accelerated(ConvParams::default());
        let x = Tensor::ones(Shape::from([1, 1, 4, 4])).to_dtype(DType::BF16)?;
        let w = Tensor::ones(Shape::from([1, 1, 3, 3]));
        let y = op.forward(&x, &w, None)?;
        assert_eq!(op.backend_kind(), Some(BackendKind::Fallback));
        assert_eq!(y.dtype(), DType::BF16);
        assert_eq!(op.workspaces().map(|ws| ws.finput.dtype()), Some(DType::BF16));
        assert_eq!(y.to_vec(), vec![9.0; 4]);
        Ok(())
    }

    #[test]
    fn bf16_grouped_input_is_rejected() -> Result<()> {
        let mut op = accelerated(ConvParams::new((1, 1), (0, 0), 2)?);
        let x = Tensor::zeros_dtype(Shape::from([1, 2, 3, 3]), DType::BF16);
        let w = Tensor::zeros(Shape::from([2, 1, 1, 1]));
        assert!(matches!(op.forward(&x, &w, None), Err(EmberError::UnsupportedConfiguration(_))));
        Ok(())
    }
}
