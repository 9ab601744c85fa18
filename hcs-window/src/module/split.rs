use rand::seq::SliceRandom;
use rand::RngCore;

use crate::error::ConfigError;

/// `0..n` 的随机排列.
pub fn random_permutation(n: usize, rng: &mut dyn RngCore) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(rng);
    perm
}

/// 按 `permutation` 重排 `items` 后, 前 `floor(n * ratio)` 个为训练集, 其余为验证集.
///
/// `permutation` 必须是 `0..items.len()` 的一个排列, 否则返回
/// [`ConfigError::InvalidPermutation`].
pub fn split_by_permutation<T>(
    items: Vec<T>,
    permutation: &[usize],
    ratio: f64,
) -> Result<(Vec<T>, Vec<T>), ConfigError> {
    if !(ratio > 0.0 && ratio < 1.0) {
        return Err(ConfigError::InvalidSplitRatio(ratio));
    }
    let n = items.len();
    check_permutation(n, permutation)?;
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let mut train: Vec<T> = permutation
        .iter()
        .filter_map(|&i| slots[i].take())
        .collect();
    let num_train = (n as f64 * ratio) as usize;
    let val = train.split_off(num_train);
    Ok((train, val))
}

fn check_permutation(n: usize, permutation: &[usize]) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidPermutation { len: n, reason };
    if permutation.len() != n {
        return Err(invalid(format!("{} indices given", permutation.len())));
    }
    let mut seen = vec![false; n];
    for &i in permutation {
        match seen.get_mut(i) {
            None => return Err(invalid(format!("index {i} out of range"))),
            Some(true) => return Err(invalid(format!("index {i} repeated"))),
            Some(s) => *s = true,
        }
    }
    Ok(())
}

/// 随机划分训练集与验证集.
pub fn split_positions<T>(
    items: Vec<T>,
    ratio: f64,
    rng: &mut dyn RngCore,
) -> Result<(Vec<T>, Vec<T>), ConfigError> {
    let perm = random_permutation(items.len(), rng);
    split_by_permutation(items, &perm, ratio)
}
