use super::error::SimilarityError;

/// Cosine similarity in `[-1, 1]`.
///
/// Zero-norm inputs yield `0.0`. Sums are accumulated in `f64` so the
/// result is identical for `(a, b)` and `(b, a)`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;

    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }

    if na == 0.0 || nb == 0.0 {
        return Ok(0.0);
    }

    let sim = dot / (na.sqrt() * nb.sqrt());
    Ok(sim.clamp(-1.0, 1.0) as f32)
}
