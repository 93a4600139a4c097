//! Uniform sampling without replacement.

use rand::{seq::index, Rng};

/// Pick `min(k, items.len())` distinct elements of `items` uniformly at random.
pub fn sample<T: Clone>(rng: &mut impl Rng, items: &[T], k: usize) -> Vec<T> {
    let k = k.min(items.len());
    index::sample(rng, items.len(), k)
        .into_iter()
        .map(|i| items[i].clone())
        .collect()
}
