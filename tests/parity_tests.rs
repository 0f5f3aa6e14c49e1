// tests/parity_tests.rs
//
// Every dispatched operation must give the same logical result on the host
// and on the accelerator.
use dual_tensor_lib::compute;
use dual_tensor_lib::test_utils::{
    check_close, check_one_argument_parity, check_two_argument_parity, on_accelerator, random_shape,
    random_storage, PARITY_TOLERANCE,
};
use dual_tensor_lib::{Device, Error, Shape, TensorStorage};
use rand::rngs::StdRng;
use rand::SeedableRng;

const ROUNDS: usize = 5;

fn acc() -> Device {
    Device::accelerator(0, "acc0")
}

fn same_shape(shape: &Shape) -> Result<Shape, Error> {
    Ok(shape.clone())
}

#[test]
fn test_binary_parity() {
    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..ROUNDS {
        check_two_argument_parity(&mut rng, &acc(), compute::add).unwrap();
        check_two_argument_parity(&mut rng, &acc(), compute::sub).unwrap();
        check_two_argument_parity(&mut rng, &acc(), compute::elementwise_product).unwrap();
    }
}

#[test]
fn test_unary_parity() {
    let mut rng = StdRng::seed_from_u64(2);
    for _ in 0..ROUNDS {
        check_one_argument_parity(&mut rng, &acc(), same_shape, |y, x| compute::scale(y, x, -2.5)).unwrap();
        check_one_argument_parity(&mut rng, &acc(), same_shape, |y, x| compute::pow(y, x, 3.0)).unwrap();
        check_one_argument_parity(&mut rng, &acc(), same_shape, |y, x| compute::pow(y, x, 0.5)).unwrap();
        check_one_argument_parity(&mut rng, &acc(), same_shape, compute::log).unwrap();
        check_one_argument_parity(&mut rng, &acc(), same_shape, compute::log10).unwrap();
        check_one_argument_parity(&mut rng, &acc(), same_shape, compute::reciprocal).unwrap();
    }
}

#[test]
fn test_transpose_parity() {
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..ROUNDS {
        check_one_argument_parity(&mut rng, &acc(), |s| Ok(s.transposed()), compute::transpose).unwrap();
    }
}

#[test]
fn test_transpose_repeats_unbatched_input() {
    let mut rng = StdRng::seed_from_u64(10);
    // (x, y) shapes; the batch of x is broadcast over the batch of y.
    let cases: &[(&[usize], &[usize])] = &[
        (&[3, 4], &[2, 4, 3]),
        (&[2, 1, 3, 5], &[2, 3, 5, 3]),
    ];
    for &(x_dims, y_dims) in cases {
        let x = random_storage(&mut rng, &Shape::new(x_dims).unwrap(), &acc()).unwrap();
        let out = Shape::new(y_dims).unwrap();

        let mut host = x.zeros_with_shape(out.clone()).unwrap();
        compute::transpose(&mut host, &x).unwrap();
        let mut device = on_accelerator(&x.zeros_with_shape(out.clone()).unwrap()).unwrap();
        compute::transpose(&mut device, &on_accelerator(&x).unwrap()).unwrap();

        let (m, n) = (x.shape().rows(), x.shape().cols());
        let x_values = x.to_vec().unwrap();
        let x_block = m * n;
        let x_batch = x_values.len() / x_block;
        let y_batch = out.size() / x_block;
        // Batch index of x that feeds each block of y.
        let y_batch_dims = &y_dims[..y_dims.len() - 2];
        let x_batch_dims: Vec<usize> = x.shape().expanded(y_dims.len()).dims()[..y_dims.len() - 2].to_vec();
        let mut expected = Vec::with_capacity(out.size());
        for block in 0..y_batch {
            let (mut rem, mut x_index, mut x_stride) = (block, 0, 1);
            for d in (0..y_batch_dims.len()).rev() {
                let i = rem % y_batch_dims[d];
                rem /= y_batch_dims[d];
                if x_batch_dims[d] != 1 {
                    x_index += i * x_stride;
                }
                x_stride *= x_batch_dims[d];
            }
            assert!(x_index < x_batch);
            let src = &x_values[x_index * x_block..(x_index + 1) * x_block];
            for i in 0..n {
                for j in 0..m {
                    expected.push(src[j * n + i]);
                }
            }
        }

        assert_eq!(host.to_vec().unwrap(), expected);
        check_close(&device.to_vec().unwrap(), &expected, PARITY_TOLERANCE).unwrap();
    }
}

#[test]
fn test_transpose_rejects_batch_that_does_not_broadcast() {
    let x = TensorStorage::from_vec(Shape::new(&[3, 2, 4]).unwrap(), &[1.0; 24], &acc()).unwrap();
    let mut y = x.zeros_with_shape(Shape::new(&[2, 4, 2]).unwrap()).unwrap();
    y.fill(9.0).unwrap();
    assert!(matches!(compute::transpose(&mut y, &x), Err(Error::ShapeMismatch { .. })));
    assert_eq!(y.to_vec().unwrap(), vec![9.0; 16]);
}

#[test]
fn test_reduce_mean_parity_along_every_axis() {
    let mut rng = StdRng::seed_from_u64(4);
    for dim in 0..5 {
        check_one_argument_parity(
            &mut rng,
            &acc(),
            |s| {
                let mut out = s.clone();
                out.set_dim(dim, 1)?;
                Ok(out)
            },
            |y, x| compute::reduce_mean(y, x, dim),
        )
        .unwrap();
    }
}

#[test]
fn test_reduce_mean_backward_parity() {
    let mut rng = StdRng::seed_from_u64(5);
    for dim in 0..4 {
        let shape = random_shape(&mut rng, 4, 5).unwrap();
        let mut reduced = shape.clone();
        reduced.set_dim(dim, 1).unwrap();
        let dy = random_storage(&mut rng, &reduced, &acc()).unwrap();
        let start = random_storage(&mut rng, &shape, &acc()).unwrap();

        let mut dx_host = start.clone();
        compute::reduce_mean_backward(&mut dx_host, &dy, dim).unwrap();

        let mut dx_acc = on_accelerator(&start).unwrap();
        compute::reduce_mean_backward(&mut dx_acc, &on_accelerator(&dy).unwrap(), dim).unwrap();

        check_close(&dx_acc.to_vec().unwrap(), &dx_host.to_vec().unwrap(), PARITY_TOLERANCE).unwrap();

        // Each element received dy / n on top of its starting value.
        let n = shape[dim] as f32;
        let (start, dx) = (start.to_vec().unwrap(), dx_host.to_vec().unwrap());
        let total_added: f32 = dx.iter().zip(&start).map(|(d, s)| d - s).sum();
        let dy_total: f32 = dy.to_vec().unwrap().iter().sum();
        assert!((total_added - dy_total).abs() < 1e-3 * n.max(1.0));
    }
}

#[test]
fn test_broadcast_operand_parity() {
    let mut rng = StdRng::seed_from_u64(6);
    for _ in 0..ROUNDS {
        let shape = random_shape(&mut rng, 4, 5).unwrap();
        let mut small = shape.clone();
        small.set_dim(0, 1).unwrap();
        small.set_dim(3, 1).unwrap();
        let a = random_storage(&mut rng, &shape, &acc()).unwrap();
        let b = random_storage(&mut rng, &small, &acc()).unwrap();

        let mut y_host = a.zeros_like().unwrap();
        compute::elementwise_product(&mut y_host, &a, &b).unwrap();
        let mut y_acc = on_accelerator(&a.zeros_like().unwrap()).unwrap();
        compute::elementwise_product(&mut y_acc, &on_accelerator(&a).unwrap(), &on_accelerator(&b).unwrap()).unwrap();
        check_close(&y_acc.to_vec().unwrap(), &y_host.to_vec().unwrap(), PARITY_TOLERANCE).unwrap();
    }
}

#[test]
fn test_accumulate_parity() {
    let mut rng = StdRng::seed_from_u64(7);
    let shape = Shape::new(&[3, 4, 5]).unwrap();
    let grad_shape = Shape::new(&[4, 1]).unwrap();
    let contribution = random_storage(&mut rng, &shape, &acc()).unwrap();
    let grad = random_storage(&mut rng, &grad_shape, &acc()).unwrap();

    let mut host = grad.clone();
    compute::accumulate(&mut host, &contribution).unwrap();
    let mut device = on_accelerator(&grad).unwrap();
    compute::accumulate(&mut device, &on_accelerator(&contribution).unwrap()).unwrap();
    check_close(&device.to_vec().unwrap(), &host.to_vec().unwrap(), PARITY_TOLERANCE).unwrap();
}

#[test]
fn test_batched_gemm_matches_generic_path() {
    let mut rng = StdRng::seed_from_u64(8);
    // (a, b, c, y) shapes; each exercises a different batch relation.
    let cases: &[(&[usize], &[usize], &[usize], &[usize])] = &[
        (&[4, 3, 5], &[4, 5, 2], &[4, 3, 2], &[4, 3, 2]),
        (&[4, 3, 5], &[5, 2], &[1, 2], &[4, 3, 2]),
        (&[3, 5], &[2, 4, 5, 6], &[3, 6], &[2, 4, 3, 6]),
        (&[2, 3, 3, 5], &[1, 1, 5, 2], &[1, 2], &[2, 3, 3, 2]),
    ];
    for &(a_dims, b_dims, c_dims, y_dims) in cases {
        let a = random_storage(&mut rng, &Shape::new(a_dims).unwrap(), &acc()).unwrap();
        let b = random_storage(&mut rng, &Shape::new(b_dims).unwrap(), &acc()).unwrap();
        let c = random_storage(&mut rng, &Shape::new(c_dims).unwrap(), &acc()).unwrap();
        let out = Shape::new(y_dims).unwrap();

        let mut host = a.zeros_with_shape(out.clone()).unwrap();
        compute::matmul_add(&mut host, &a, &b, &c).unwrap();

        let (a_acc, b_acc, c_acc) = (
            on_accelerator(&a).unwrap(),
            on_accelerator(&b).unwrap(),
            on_accelerator(&c).unwrap(),
        );
        let mut fast = on_accelerator(&a.zeros_with_shape(out.clone()).unwrap()).unwrap();
        compute::matmul_add(&mut fast, &a_acc, &b_acc, &c_acc).unwrap();
        let mut generic = on_accelerator(&a.zeros_with_shape(out).unwrap()).unwrap();
        compute::matmul_add_generic(&mut generic, &a_acc, &b_acc, &c_acc).unwrap();

        let host = host.to_vec().unwrap();
        check_close(&fast.to_vec().unwrap(), &host, 1e-4).unwrap();
        check_close(&generic.to_vec().unwrap(), &host, 1e-4).unwrap();
    }
}

#[test]
fn test_product_backward_reduces_broadcast_operand() {
    let mut rng = StdRng::seed_from_u64(9);
    let a = random_storage(&mut rng, &Shape::new(&[2, 3, 4]).unwrap(), &acc()).unwrap();
    let b = random_storage(&mut rng, &Shape::new(&[3, 1]).unwrap(), &acc()).unwrap();
    let dy = random_storage(&mut rng, a.shape(), &acc()).unwrap();

    let (a_acc, b_acc, dy_acc) = (
        on_accelerator(&a).unwrap(),
        on_accelerator(&b).unwrap(),
        on_accelerator(&dy).unwrap(),
    );
    let mut da = on_accelerator(&a.zeros_like().unwrap()).unwrap();
    let mut db = on_accelerator(&b.zeros_like().unwrap()).unwrap();
    compute::elementwise_product_backward(&mut da, &mut db, &dy_acc, &a_acc, &b_acc).unwrap();

    // Host reference through the forward kernels.
    let mut expected_da = a.zeros_like().unwrap();
    compute::elementwise_product(&mut expected_da, &dy, &b).unwrap();
    let mut dy_a = a.zeros_like().unwrap();
    compute::elementwise_product(&mut dy_a, &dy, &a).unwrap();
    let mut expected_db = b.zeros_like().unwrap();
    compute::accumulate(&mut expected_db, &dy_a).unwrap();

    check_close(&da.to_vec().unwrap(), &expected_da.to_vec().unwrap(), PARITY_TOLERANCE).unwrap();
    check_close(&db.to_vec().unwrap(), &expected_db.to_vec().unwrap(), 1e-4).unwrap();
}

#[test]
fn test_product_backward_is_unsupported_on_host() {
    let a = TensorStorage::from_vec(Shape::new(&[2]).unwrap(), &[1.0, 2.0], &Device::host()).unwrap();
    let dy = a.clone();
    let mut da = a.zeros_like().unwrap();
    let mut db = a.zeros_like().unwrap();
    assert!(matches!(
        compute::elementwise_product_backward(&mut da, &mut db, &dy, &a, &a),
        Err(Error::UnsupportedOnHost(_))
    ));
    assert_eq!(da.to_vec().unwrap(), vec![0.0, 0.0]);
}

#[test]
fn test_device_mismatch_on_accelerator() {
    let other = Device::accelerator(1, "acc1");
    let a = on_accelerator(&TensorStorage::from_vec(Shape::new(&[2]).unwrap(), &[1.0, 2.0], &acc()).unwrap()).unwrap();
    let b = on_accelerator(&TensorStorage::from_vec(Shape::new(&[2]).unwrap(), &[1.0, 2.0], &other).unwrap()).unwrap();
    let mut y = a.zeros_like().unwrap();
    assert!(matches!(compute::add(&mut y, &a, &b), Err(Error::DeviceMismatch { .. })));
}
