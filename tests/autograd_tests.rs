// tests/autograd_tests.rs
use approx::assert_abs_diff_eq;
use dual_tensor_lib::units::Linear;
use dual_tensor_lib::{compute, ops, Device, Error, Mode, Session, Tensor, Unit};

fn assert_all_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert_abs_diff_eq!(*a, *e, epsilon = 1e-5);
    }
}

fn accelerator_tensor(session: &mut Session, dims: &[usize], data: &[f32]) -> Tensor {
    let t = session
        .tensor_on(&Device::accelerator(0, "acc0"), dims, data)
        .unwrap();
    session.to_accelerator(t).unwrap();
    t
}

#[test]
fn test_fan_in_accumulates() {
    let mut session = Session::default();
    let a = session.tensor_from_vec(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let y = ops::add(&mut session, a, a).unwrap();
    session.backward(y).unwrap();
    assert_eq!(session.grad_values(a).unwrap(), vec![2.0; 4]);
    assert!(session.history().is_empty());
}

#[test]
fn test_gradients_from_separate_consumers_are_summed() {
    let mut session = Session::default();
    let a = session.tensor_from_vec(&[2], &[1.0, -1.0]).unwrap();
    let doubled = ops::scale(&mut session, a, 2.0).unwrap();
    let tripled = ops::scale(&mut session, a, 3.0).unwrap();
    let z = ops::add(&mut session, doubled, tripled).unwrap();
    session.backward(z).unwrap();
    assert_eq!(session.grad_values(a).unwrap(), vec![5.0, 5.0]);
    assert!(session.history().is_empty());
}

#[test]
fn test_failed_node_leaves_gradients_untouched() {
    let mut session = Session::default();
    let acc = Device::accelerator(0, "acc0");
    let a = session.tensor_on(&acc, &[2], &[1.0, 2.0]).unwrap();
    let b = session.tensor_on(&acc, &[2], &[3.0, 4.0]).unwrap();
    let y = ops::add(&mut session, a, b).unwrap();

    // b's gradient lives in a different mode than the contribution.
    session.set_mode(b, Mode::Accelerator).unwrap();
    assert!(matches!(session.backward(y), Err(Error::ModeMismatch { .. })));
    assert_eq!(session.grad_values(a).unwrap(), vec![0.0, 0.0]);
    assert_eq!(session.history().len(), 1);

    session.set_mode(b, Mode::Host).unwrap();
    session.backward(y).unwrap();
    assert_eq!(session.grad_values(a).unwrap(), vec![1.0, 1.0]);
    assert_eq!(session.grad_values(b).unwrap(), vec![1.0, 1.0]);
    assert!(session.history().is_empty());
}

#[test]
fn test_root_gradient_is_overwritten_with_ones() {
    let mut session = Session::default();
    let a = session.tensor_from_vec(&[2], &[1.0, 2.0]).unwrap();
    let y = ops::scale(&mut session, a, 2.0).unwrap();
    let z = ops::scale(&mut session, y, 3.0).unwrap();
    session.backward(z).unwrap();
    assert_eq!(session.grad_values(y).unwrap(), vec![3.0, 3.0]);

    // Seeding y replaces what z left there; no node produces y any more.
    session.backward(y).unwrap();
    assert_eq!(session.grad_values(y).unwrap(), vec![1.0, 1.0]);
    assert_eq!(session.grad_values(a).unwrap(), vec![2.0, 2.0]);
}

#[test]
fn test_mean_round_trip() {
    let mut session = Session::default();
    let x = session.tensor_from_vec(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let y = ops::mean(&mut session, x, 1).unwrap();
    assert_eq!(session.shape(y).unwrap().dims(), &[2, 1]);
    assert_eq!(session.values(y).unwrap(), vec![2.0, 5.0]);
    session.backward(y).unwrap();
    assert_all_close(&session.grad_values(x).unwrap(), &[1.0 / 3.0; 6]);
}

#[test]
fn test_chain_through_power_and_mean() {
    // loss = mean(x^2) along the only axis; d loss / dx = 2x / n.
    let mut session = Session::default();
    let x = session.tensor_from_vec(&[4], &[1.0, -2.0, 3.0, 0.5]).unwrap();
    let squared = ops::pow(&mut session, x, 2.0).unwrap();
    let loss = ops::mean(&mut session, squared, 0).unwrap();
    session.backward(loss).unwrap();
    assert_all_close(&session.grad_values(x).unwrap(), &[0.5, -1.0, 1.5, 0.25]);
}

#[test]
fn test_unary_gradients() {
    let data = [0.5, 1.0, 2.0, 4.0];
    let cases: Vec<(&str, fn(&mut Session, Tensor) -> Result<Tensor, Error>, fn(f32) -> f32)> = vec![
        ("log", ops::log, |x| 1.0 / x),
        ("log10", ops::log10, |x| 1.0 / (x * std::f32::consts::LN_10)),
        ("reciprocal", ops::reciprocal, |x| -1.0 / (x * x)),
        ("transpose", ops::transpose, |_| 1.0),
    ];
    for (name, op, derivative) in cases {
        let mut session = Session::default();
        let x = session.tensor_from_vec(&[2, 2], &data).unwrap();
        let y = op(&mut session, x).unwrap();
        session.backward(y).unwrap();
        let expected: Vec<f32> = data.iter().map(|&v| derivative(v)).collect();
        let grad = session.grad_values(x).unwrap();
        for (g, e) in grad.iter().zip(&expected) {
            assert!((g - e).abs() < 1e-5, "{name}: {g} vs {e}");
        }
    }
}

#[test]
fn test_scale_and_sub_gradients() {
    let mut session = Session::default();
    let a = session.tensor_from_vec(&[2, 3], &[1.0; 6]).unwrap();
    let b = session.tensor_from_vec(&[3], &[1.0; 3]).unwrap();
    let d = ops::sub(&mut session, a, b).unwrap();
    let y = ops::scale(&mut session, d, 3.0).unwrap();
    session.backward(y).unwrap();
    assert_eq!(session.grad_values(a).unwrap(), vec![3.0; 6]);
    // b is broadcast over two rows.
    assert_eq!(session.grad_values(b).unwrap(), vec![-6.0; 3]);
}

#[test]
fn test_product_backward_on_accelerator() {
    let mut session = Session::default();
    let a = accelerator_tensor(&mut session, &[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let b = accelerator_tensor(&mut session, &[3], &[1.0, 10.0, 100.0]);
    let y = ops::mul(&mut session, a, b).unwrap();
    let loss = ops::mean(&mut session, y, 1).unwrap();
    session.backward(loss).unwrap();

    session.to_host(a).unwrap();
    session.to_host(b).unwrap();
    let third = 1.0 / 3.0;
    assert_all_close(
        &session.grad_values(a).unwrap(),
        &[third, 10.0 * third, 100.0 * third, third, 10.0 * third, 100.0 * third],
    );
    assert_all_close(&session.grad_values(b).unwrap(), &[5.0 * third, 7.0 * third, 9.0 * third]);
}

#[test]
fn test_product_backward_unsupported_on_host() {
    let mut session = Session::default();
    let a = session.tensor_from_vec(&[2], &[1.0, 2.0]).unwrap();
    let b = session.tensor_from_vec(&[2], &[3.0, 4.0]).unwrap();
    let y = ops::mul(&mut session, a, b).unwrap();
    assert_eq!(session.values(y).unwrap(), vec![3.0, 8.0]);
    assert!(matches!(session.backward(y), Err(Error::UnsupportedOnHost(_))));
    // The failed node stays recorded and nothing was accumulated.
    assert_eq!(session.history().len(), 1);
    assert_eq!(session.grad_values(a).unwrap(), vec![0.0, 0.0]);
}

#[test]
fn test_unreached_nodes_stay_recorded() {
    let mut session = Session::default();
    let a = session.tensor_from_vec(&[2], &[1.0, 2.0]).unwrap();
    let b = session.tensor_from_vec(&[2], &[3.0, 4.0]).unwrap();
    let _unused = ops::add(&mut session, a, b).unwrap();
    let y = ops::scale(&mut session, a, 2.0).unwrap();
    session.backward(y).unwrap();
    assert_eq!(session.history().len(), 1);
    assert_eq!(session.grad_values(a).unwrap(), vec![2.0, 2.0]);
    assert_eq!(session.grad_values(b).unwrap(), vec![0.0, 0.0]);
}

#[test]
fn test_zero_grad_resets_accumulators() {
    let mut session = Session::default();
    let a = session.tensor_from_vec(&[2], &[1.0, 2.0]).unwrap();
    let y = ops::scale(&mut session, a, 2.0).unwrap();
    session.backward(y).unwrap();
    session.zero_grad().unwrap();
    assert_eq!(session.grad_values(a).unwrap(), vec![0.0, 0.0]);
    assert_eq!(session.grad_values(y).unwrap(), vec![0.0, 0.0]);
}

#[test]
fn test_release_and_unknown_descriptor() {
    let mut session = Session::default();
    let a = session.tensor_from_vec(&[2], &[1.0, 2.0]).unwrap();
    let y = ops::scale(&mut session, a, 2.0).unwrap();

    assert_eq!(session.release(a), Err(Error::DescriptorInUse(a.key().0)));
    session.backward(y).unwrap();
    session.release(a).unwrap();

    assert_eq!(session.values(a), Err(Error::UnknownDescriptor(a.key().0)));
    assert_eq!(session.release(a), Err(Error::UnknownDescriptor(a.key().0)));
    assert!(matches!(
        ops::scale(&mut session, a, 1.0),
        Err(Error::UnknownDescriptor(_))
    ));
}

#[test]
fn test_mean_axis_errors() {
    let mut session = Session::default();
    let x = session.tensor_from_vec(&[2, 3], &[1.0; 6]).unwrap();
    assert!(matches!(
        ops::mean(&mut session, x, 2),
        Err(Error::InvalidAxis { axis: 2, rank: 2 })
    ));

    let x_storage = session.storage(x).unwrap().clone();
    let mut not_reduced = x_storage.zeros_like().unwrap();
    assert!(matches!(
        compute::reduce_mean(&mut not_reduced, &x_storage, 1),
        Err(Error::DimensionNotReduced { dim: 1, .. })
    ));
}

#[test]
fn test_mode_mismatch_between_inputs() {
    let mut session = Session::default();
    let a = accelerator_tensor(&mut session, &[2], &[1.0, 2.0]);
    let b = session
        .tensor_on(&Device::accelerator(0, "acc0"), &[2], &[1.0, 2.0])
        .unwrap();
    assert!(matches!(ops::add(&mut session, a, b), Err(Error::ModeMismatch { .. })));
}

// --- Linear ---

struct LinearFixture {
    session: Session,
    layer: Linear,
    x: Tensor,
    weight: Tensor,
    bias: Tensor,
}

fn linear_fixture(device: &Device) -> LinearFixture {
    let mut session = Session::default();
    let layer = Linear::new(&mut session, 3, 2);
    let x = session
        .tensor_on(device, &[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
        .unwrap();
    let weight = session
        .tensor_on(device, &[2, 3], &[1.0, 0.0, 0.0, 0.0, 1.0, 1.0])
        .unwrap();
    let bias = session.tensor_on(device, &[2], &[0.5, -1.0]).unwrap();
    LinearFixture {
        session,
        layer,
        x,
        weight,
        bias,
    }
}

fn check_linear_results(f: &mut LinearFixture, y: Tensor) {
    for t in [y, f.x, f.weight, f.bias] {
        f.session.to_host(t).unwrap();
    }
    assert_eq!(f.session.values(y).unwrap(), vec![1.5, 4.0, 4.5, 10.0]);
    assert_eq!(f.session.grad_values(f.x).unwrap(), vec![1.0; 6]);
    assert_eq!(
        f.session.grad_values(f.weight).unwrap(),
        vec![5.0, 7.0, 9.0, 5.0, 7.0, 9.0]
    );
    assert_eq!(f.session.grad_values(f.bias).unwrap(), vec![2.0, 2.0]);
}

#[test]
fn test_linear_forward_backward_on_host() {
    let mut f = linear_fixture(&Device::host());
    let inputs = [f.x, f.weight, f.bias];
    let y = f.layer.forward(&mut f.session, &inputs).unwrap();
    f.session.backward(y).unwrap();
    assert_eq!(f.layer.cache().len(), 3);
    check_linear_results(&mut f, y);
}

#[test]
fn test_linear_forward_backward_on_accelerator() {
    let mut f = linear_fixture(&Device::accelerator(0, "acc0"));
    for t in [f.x, f.weight, f.bias] {
        f.session.to_accelerator(t).unwrap();
    }
    let inputs = [f.x, f.weight, f.bias];
    let y = f.layer.forward(&mut f.session, &inputs).unwrap();
    assert_eq!(f.session.storage(y).unwrap().mode(), Mode::Accelerator);
    f.session.backward(y).unwrap();
    check_linear_results(&mut f, y);
}

#[test]
fn test_linear_folds_leading_dimensions() {
    let mut session = Session::default();
    let mut layer = Linear::new(&mut session, 2, 1);
    let x = session
        .tensor_from_vec(&[2, 2, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0])
        .unwrap();
    let weight = session.tensor_from_vec(&[1, 2], &[1.0, -1.0]).unwrap();
    let bias = session.tensor_from_vec(&[1, 1], &[10.0]).unwrap();
    let y = layer.forward(&mut session, &[x, weight, bias]).unwrap();
    assert_eq!(session.shape(y).unwrap().dims(), &[2, 2, 1]);
    assert_eq!(session.values(y).unwrap(), vec![9.0; 4]);

    // A different row count recreates the cached ones and expanded bias.
    let x2 = session.tensor_from_vec(&[3, 2], &[0.0; 6]).unwrap();
    let y2 = layer.forward(&mut session, &[x2, weight, bias]).unwrap();
    assert_eq!(session.values(y2).unwrap(), vec![10.0; 3]);
    assert_eq!(layer.cache().get("ones").unwrap().shape().dims(), &[3, 1]);
}

#[test]
fn test_linear_rejects_bad_arguments() {
    let mut f = linear_fixture(&Device::host());
    let wrong_x = f.session.tensor_from_vec(&[2, 4], &[0.0; 8]).unwrap();
    match f.layer.forward(&mut f.session, &[wrong_x, f.weight, f.bias]) {
        Err(Error::ArgumentShapeMismatch { detail, .. }) => assert!(detail.starts_with("Shape mismatch")),
        other => panic!("expected ArgumentShapeMismatch, got {other:?}"),
    }

    let wrong_bias = f.session.tensor_from_vec(&[3], &[0.0; 3]).unwrap();
    assert!(matches!(
        f.layer.forward(&mut f.session, &[f.x, f.weight, wrong_bias]),
        Err(Error::ArgumentShapeMismatch { .. })
    ));
    assert!(matches!(
        f.layer.forward(&mut f.session, &[f.x, f.weight]),
        Err(Error::InvalidOperation(_))
    ));
    assert!(f.session.history().is_empty());
}
