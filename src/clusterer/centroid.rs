use super::error::SimilarityError;

/// Element-wise mean of `vectors`; all of them must share one dimension
pub fn compute_centroid<V: AsRef<[f32]>>(vectors: &[V]) -> Result<Vec<f32>, SimilarityError> {
    let first = vectors.first().ok_or(SimilarityError::EmptyInput)?;
    let dim = first.as_ref().len();
    let mut sums = vec![0.0f64; dim];

    for v in vectors {
        let v = v.as_ref();
        if v.len() != dim {
            return Err(SimilarityError::DimensionMismatch {
                left: dim,
                right: v.len(),
            });
        }
        for (acc, x) in sums.iter_mut().zip(v) {
            *acc += f64::from(*x);
        }
    }

    let n = vectors.len() as f64;
    Ok(sums.into_iter().map(|s| (s / n) as f32).collect())
}
