// ============================================================
// Layer 4 — Train/Validation Splitter
// ============================================================
// Holds out a fraction of the training split for validation:
//   - Training set:   used to update model weights
//   - Validation set: used for model selection, LR plateau
//                     detection and early stopping
//
// The shuffle is driven by a seeded StdRng so the same seed
// always produces the same partition.
//
// Split sizes: val = floor(len * val_fraction), train = the rest
//
// Reference: rand crate documentation (SliceRandom, SeedableRng)

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// Shuffle `samples` with `seed` and split into (train, validation).
pub fn split_train_val<T>(mut samples: Vec<T>, val_fraction: f64, seed: u64) -> (Vec<T>, Vec<T>) {
    let mut rng = StdRng::seed_from_u64(seed);
    samples.shuffle(&mut rng);

    let total    = samples.len();
    let val_size = ((total as f64) * val_fraction).floor() as usize;
    let val_size = val_size.min(total);

    // split_off(n) moves [n..] out; the tail becomes validation
    let val = samples.split_off(total - val_size);

    tracing::debug!(
        "Dataset split: {} training, {} validation (seed {})",
        samples.len(),
        val.len(),
        seed,
    );

    (samples, val)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correct_split_sizes() {
        let items: Vec<usize> = (0..100).collect();
        let (train, val)      = split_train_val(items, 0.1, 42);
        assert_eq!(train.len(), 90);
        assert_eq!(val.len(),   10);
    }

    #[test]
    fn test_val_size_rounds_down() {
        let items: Vec<usize> = (0..19).collect();
        let (train, val)      = split_train_val(items, 0.1, 42);
        assert_eq!(val.len(),   1);
        assert_eq!(train.len(), 18);
    }

    #[test]
    fn test_all_items_preserved() {
        let items: Vec<usize> = (0..50).collect();
        let (train, val)      = split_train_val(items, 0.3, 7);
        let mut all: Vec<usize> = train.into_iter().chain(val).collect();
        all.sort();
        assert_eq!(all, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_same_seed_same_partition() {
        let (a, _) = split_train_val((0..40).collect::<Vec<usize>>(), 0.25, 42);
        let (b, _) = split_train_val((0..40).collect::<Vec<usize>>(), 0.25, 42);
        let (c, _) = split_train_val((0..40).collect::<Vec<usize>>(), 0.25, 43);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_empty_dataset() {
        let (train, val) = split_train_val(Vec::<usize>::new(), 0.1, 42);
        assert!(train.is_empty());
        assert!(val.is_empty());
    }

    #[test]
    fn test_zero_fraction_keeps_everything() {
        let (train, val) = split_train_val((0..10).collect::<Vec<usize>>(), 0.0, 42);
        assert_eq!(train.len(), 10);
        assert!(val.is_empty());
    }
}
