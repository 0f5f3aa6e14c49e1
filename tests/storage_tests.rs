// tests/storage_tests.rs
use dual_tensor_lib::{compute, Device, Error, Mode, Shape, TensorStorage};

fn acc() -> Device {
    Device::accelerator(0, "acc0")
}

fn shape(dims: &[usize]) -> Shape {
    Shape::new(dims).unwrap()
}

fn iota(n: usize) -> Vec<f32> {
    (0..n).map(|i| i as f32).collect()
}

#[test]
fn test_host_padding_and_device_size() {
    let storage = TensorStorage::new(shape(&[2, 3, 5]), &acc()).unwrap();
    assert_eq!(storage.mode(), Mode::Host);
    assert_eq!(storage.padded_cols(), 8);
    assert_eq!(storage.host_len(), 2 * 3 * 8);
    assert_eq!(storage.layout().row_stride, 8);

    let mut storage = storage;
    storage.set_mode(Mode::Accelerator).unwrap();
    assert_eq!(storage.layout().row_stride, 5);
    assert_eq!(storage.device_data().unwrap().len(), 30);
}

#[test]
fn test_custom_alignment() {
    let storage = TensorStorage::with_alignment(shape(&[3, 5]), &Device::host(), 4).unwrap();
    assert_eq!(storage.padded_cols(), 8);
    let storage = TensorStorage::with_alignment(shape(&[3, 5]), &Device::host(), 1).unwrap();
    assert_eq!(storage.padded_cols(), 5);
    assert!(TensorStorage::with_alignment(shape(&[3, 5]), &Device::host(), 0).is_err());
}

#[test]
fn test_copy_round_trip_strips_and_restores_padding() {
    let data = iota(2 * 3 * 5);
    let mut storage = TensorStorage::from_vec(shape(&[2, 3, 5]), &data, &acc()).unwrap();

    // The device buffer holds the logical values contiguously.
    storage.set_mode(Mode::Accelerator).unwrap();
    assert_eq!(storage.device_data().unwrap(), data.as_slice());

    // Change the device copy, bring it back, and check the host sees it.
    storage.device_data_mut().unwrap()[7] = -1.0;
    storage.to_host().unwrap();
    storage.set_mode(Mode::Host).unwrap();
    let mut expected = data.clone();
    expected[7] = -1.0;
    assert_eq!(storage.to_vec().unwrap(), expected);

    // Row 1, column 2 of the host buffer sits after one padded row.
    assert_eq!(storage.host().unwrap()[8 + 2], -1.0);
}

#[test]
fn test_wrong_mode_access() {
    let mut storage = TensorStorage::new(shape(&[4]), &acc()).unwrap();
    assert!(matches!(
        storage.device_data(),
        Err(Error::ModeMismatch {
            expected: Mode::Accelerator,
            actual: Mode::Host,
            ..
        })
    ));
    storage.set_mode(Mode::Accelerator).unwrap();
    assert!(matches!(storage.host_mut(), Err(Error::ModeMismatch { .. })));
}

#[test]
fn test_padding_is_never_read() {
    // Poison the padding of both inputs; every op must ignore it.
    let a_data = iota(3 * 5);
    let b_data: Vec<f32> = a_data.iter().map(|v| v * 0.5 + 1.0).collect();
    let mut a = TensorStorage::from_vec(shape(&[3, 5]), &a_data, &Device::host()).unwrap();
    let mut b = TensorStorage::from_vec(shape(&[3, 5]), &b_data, &Device::host()).unwrap();
    for storage in [&mut a, &mut b] {
        let padded = storage.padded_cols();
        for row in storage.host_mut().unwrap().chunks_exact_mut(padded) {
            row[5..].fill(f32::NAN);
        }
    }

    let mut y = a.zeros_like().unwrap();
    compute::add(&mut y, &a, &b).unwrap();
    let expected: Vec<f32> = a_data.iter().zip(&b_data).map(|(x, y)| x + y).collect();
    assert_eq!(y.to_vec().unwrap(), expected);

    let mut mean = TensorStorage::new(shape(&[3, 1]), &Device::host()).unwrap();
    compute::reduce_mean(&mut mean, &a, 1).unwrap();
    assert_eq!(mean.to_vec().unwrap(), vec![2.0, 7.0, 12.0]);

    let mut t = TensorStorage::new(shape(&[5, 3]), &Device::host()).unwrap();
    compute::transpose(&mut t, &a).unwrap();
    assert!(t.to_vec().unwrap().iter().all(|v| v.is_finite()));
}

#[test]
fn test_padding_is_never_written() {
    let a = TensorStorage::from_vec(shape(&[2, 3]), &[1.0; 6], &Device::host()).unwrap();
    let mut y = a.zeros_like().unwrap();
    let padded = y.padded_cols();
    for row in y.host_mut().unwrap().chunks_exact_mut(padded) {
        row[3..].fill(42.0);
    }
    compute::scale(&mut y, &a, 3.0).unwrap();
    for row in y.host().unwrap().chunks_exact(padded) {
        assert_eq!(&row[..3], &[3.0, 3.0, 3.0]);
        assert!(row[3..].iter().all(|&v| v == 42.0));
    }
}

#[test]
fn test_from_vec_rejects_wrong_length() {
    assert!(matches!(
        TensorStorage::from_vec(shape(&[2, 2]), &[1.0, 2.0, 3.0], &Device::host()),
        Err(Error::ShapeMismatch { .. })
    ));
}

#[test]
fn test_invalid_shapes() {
    assert!(matches!(Shape::new(&[]), Err(Error::InvalidShape(_))));
    assert!(matches!(Shape::new(&[3, 0, 2]), Err(Error::InvalidShape(_))));
}
