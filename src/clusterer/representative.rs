use super::centroid::compute_centroid;
use super::error::SimilarityError;
use super::similarity::cosine_similarity;
use super::types::Embedded;

/// Index of the item closest to the set's centroid.
///
/// Items are expected in submission order; on equal similarity the earlier
/// item wins. A single item is returned without computing a centroid.
pub fn most_representative<T: Embedded>(items: &[T]) -> Result<usize, SimilarityError> {
    match items.len() {
        0 => return Err(SimilarityError::EmptyInput),
        1 => return Ok(0),
        _ => {}
    }

    let vectors: Vec<&[f32]> = items.iter().map(Embedded::embedding).collect();
    let centroid = compute_centroid(&vectors)?;

    let mut best = 0;
    let mut best_sim = cosine_similarity(vectors[0], &centroid)?;
    for (idx, v) in vectors.iter().enumerate().skip(1) {
        let sim = cosine_similarity(v, &centroid)?;
        if sim > best_sim {
            best = idx;
            best_sim = sim;
        }
    }

    Ok(best)
}
