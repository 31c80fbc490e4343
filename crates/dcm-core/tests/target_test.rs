//! Integration tests for the target distribution store.

use dcm_core::{ActorBoxes, DcmError, SimpleRng, TargetDistribution, ValidityMask};

fn random_soft(rng: &mut SimpleRng, rows: usize, k: usize) -> Vec<f32> {
    (0..rows)
        .flat_map(|_| {
            let raw: Vec<f32> = (0..k).map(|_| rng.next_f32() + 0.01).collect();
            let sum: f32 = raw.iter().sum();
            raw.into_iter().map(move |v| v / sum).collect::<Vec<_>>()
        })
        .collect()
}

/// Every written row is a distribution, whatever the padding pattern.
#[test]
fn written_rows_sum_to_one() {
    let mut rng = SimpleRng::new(17);
    let (clips, capacity, k) = (6, 5, 4);
    let mut target = TargetDistribution::new(clips, capacity, k).unwrap();

    for round in 0..3 {
        let flags: Vec<bool> = (0..2 * capacity).map(|_| rng.next_below(3) > 0).collect();
        let mask = ValidityMask::from_flags(flags, 2, capacity).unwrap();
        let soft = random_soft(&mut rng, 2 * capacity, k);
        let offsets = [round * 2, round * 2 + 1];
        let written = target.update(&soft, &mask, &offsets).unwrap();
        assert_eq!(written, mask.total());
    }

    for r in (0..target.n_rows()).filter(|&r| target.is_written(r)) {
        let sum: f32 = target.row(r).iter().sum();
        assert!((sum - 1.0).abs() < 1e-5, "row {r}: {sum}");
    }
}

/// Rows of clips outside the batch are bit-identical after an update.
#[test]
fn update_is_local_to_batch() {
    let mut rng = SimpleRng::new(2);
    let (capacity, k) = (3, 2);
    let mut target = TargetDistribution::new(5, capacity, k).unwrap();
    let all = ValidityMask::from_flags(vec![true; 5 * capacity], 5, capacity).unwrap();
    let offsets: Vec<usize> = (0..5).collect();
    target.update(&random_soft(&mut rng, 5 * capacity, k), &all, &offsets).unwrap();
    let before = target.as_slice().to_vec();

    let mask = ValidityMask::from_flags(vec![true; capacity], 1, capacity).unwrap();
    target.update(&random_soft(&mut rng, capacity, k), &mask, &[2]).unwrap();

    let after = target.as_slice();
    let row_len = capacity * k;
    for clip in [0, 1, 3, 4] {
        let span = clip * row_len..(clip + 1) * row_len;
        assert_eq!(&after[span.clone()], &before[span], "clip {clip}");
    }
    assert_ne!(&after[2 * row_len..3 * row_len], &before[2 * row_len..3 * row_len]);
}

/// A one-hot assignment maps to itself.
#[test]
fn one_hot_is_fixed_point() {
    let mut target = TargetDistribution::new(1, 3, 3).unwrap();
    let soft = vec![
        0.0, 1.0, 0.0, //
        1.0, 0.0, 0.0, //
        0.0, 1.0, 0.0,
    ];
    let mask = ValidityMask::from_flags(vec![true; 3], 1, 3).unwrap();
    target.update(&soft, &mask, &[0]).unwrap();
    assert_eq!(target.as_slice(), soft.as_slice());
}

/// Validity derived from NaN boxes decides which rows are written.
#[test]
fn nan_boxes_mark_padding() {
    let nan = f32::NAN;
    let boxes =
        ActorBoxes::from_flat(&[1.0, 1.0, 4.0, 4.0, nan, nan, nan, nan], 1, 2).unwrap();
    let mask = boxes.validity();
    let mut target = TargetDistribution::new(1, 2, 2).unwrap();
    let written = target.update(&[0.7, 0.3, 0.5, 0.5], &mask, &[0]).unwrap();
    assert_eq!(written, 1);
    assert!(target.is_written(0));
    assert_eq!(target.row(1), &[0.0, 0.0]);
}

#[test]
fn out_of_range_writes_nothing() {
    let mut target = TargetDistribution::new(2, 2, 2).unwrap();
    let mask = ValidityMask::from_flags(vec![true; 4], 2, 2).unwrap();
    let err = target
        .update(&[0.5; 8], &mask, &[1, 2])
        .unwrap_err();
    assert!(matches!(err, DcmError::SampleOutOfRange { .. }));
    assert!(target.as_slice().iter().all(|&v| v == 0.0));
}
