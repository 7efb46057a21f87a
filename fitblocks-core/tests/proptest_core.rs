//! Property-based tests for shape helpers, checkpoint retention and the
//! update/log registries.

use proptest::prelude::*;

use fitblocks_core::layers::{flatten_leading_dims, reshape_leading_dim};
use fitblocks_core::spec::Shape;
use fitblocks_core::tensor::Tensor;
use fitblocks_core::training::{
    CheckpointManager, CheckpointStore, LogUpdater, RetentionPolicy, Snapshot, UpdateFrequency,
    ValueUpdater, Variable,
};
use std::collections::BTreeMap;
use tempfile::TempDir;

fn freq(batch: bool) -> UpdateFrequency {
    if batch {
        UpdateFrequency::Batch
    } else {
        UpdateFrequency::Epoch
    }
}

// --- Shape helper properties ---

proptest! {
    #[test]
    fn flatten_then_split_restores_dense_shape(
        a in 1usize..6,
        b in 1usize..6,
        c in 1usize..4,
    ) {
        let t = Tensor::zeros(&[a, b, c]);
        let flat = flatten_leading_dims(&t, 2, None).unwrap();
        prop_assert_eq!(flat.shape(), &[a * b, c][..]);
        let back = reshape_leading_dim(&flat, &[a as isize, -1]).unwrap();
        prop_assert_eq!(back.shape(), t.shape());
    }

    #[test]
    fn flatten_static_shape_preserves_element_count(
        dims in prop::collection::vec(1usize..5, 2..5),
        num_dims in 1usize..5,
    ) {
        prop_assume!(num_dims <= dims.len());
        let shape = Shape::known(&dims);
        let flat = flatten_leading_dims(&shape, num_dims, None).unwrap();
        prop_assert_eq!(flat.rank(), dims.len() - num_dims + 1);
        let known: usize = flat.dims().iter().map(|d| d.unwrap()).product();
        prop_assert_eq!(known, dims.iter().product::<usize>());
    }

    #[test]
    fn unknown_leading_dim_stays_unknown(inner in 1usize..8, split in 1usize..4) {
        let shape = Shape::new(vec![None, Some(inner)]);
        let out = reshape_leading_dim(&shape, &[-1, split as isize]).unwrap();
        prop_assert_eq!(out.dims(), &[None, Some(split), Some(inner)][..]);
    }
}

// --- Retention properties ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn retention_keeps_the_most_recent_epochs(
        max_to_keep in 1usize..5,
        saves in 1usize..10,
    ) {
        let dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::open(
            dir.path(),
            "ckpt",
            RetentionPolicy { max_to_keep, keep_checkpoint_every_n_hours: None },
        ).unwrap();
        for epoch in 1..=saves {
            let snapshot = Snapshot {
                epoch,
                global_step: epoch as u64,
                parameters: BTreeMap::new(),
                optimizer: Default::default(),
            };
            manager.save(epoch, &snapshot).unwrap();
        }
        let kept: Vec<usize> = manager.checkpoints().iter().map(|r| r.epoch).collect();
        let expected: Vec<usize> = (saves.saturating_sub(max_to_keep) + 1..=saves).collect();
        prop_assert_eq!(&kept, &expected);
        prop_assert_eq!(manager.latest().map(|r| r.epoch), Some(saves));
        for record in manager.checkpoints() {
            prop_assert!(record.path.exists());
        }
    }
}

// --- Registration uniqueness ---

proptest! {
    #[test]
    fn variable_registers_in_exactly_one_scope(first_batch: bool, second_batch: bool) {
        let mut updater = ValueUpdater::new();
        let v = Variable::new("v", 0.0);
        prop_assert!(updater.register(&v, || 1.0, freq(first_batch)).is_ok());
        prop_assert!(updater.register(&v, || 2.0, freq(second_batch)).is_err());
        prop_assert_eq!(
            updater.len(UpdateFrequency::Batch) + updater.len(UpdateFrequency::Epoch),
            1
        );
    }

    #[test]
    fn log_keys_are_unique_across_scopes(
        keys in prop::collection::vec("[a-d]{1,2}", 1..12),
        scopes in prop::collection::vec(any::<bool>(), 12),
    ) {
        let mut updater = LogUpdater::new();
        let v = Variable::new("v", 1.0);
        let mut accepted = std::collections::BTreeSet::new();
        for (key, batch) in keys.iter().zip(&scopes) {
            let fresh = accepted.insert(key.clone());
            prop_assert_eq!(updater.register(key.clone(), &v, freq(*batch)).is_ok(), fresh);
        }
        for key in &accepted {
            prop_assert!(updater.contains(key));
        }
    }
}
