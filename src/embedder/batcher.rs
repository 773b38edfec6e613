// batcher.rs - bounded fan-out to the embedding endpoint
use futures::future::join_all;

use super::client::{EmbedError, Embedder};

pub struct Batcher {
    pub batch_size: usize,
}

impl Batcher {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn split<'a, T>(&self, items: &'a [T]) -> Vec<&'a [T]> {
        items.chunks(self.batch_size).collect()
    }

    /// Embed `texts` in waves of at most `batch_size` concurrent calls.
    ///
    /// The output lines up with the input; one failed text never affects
    /// the result of another.
    pub async fn embed_all<E>(&self, embedder: &E, texts: &[String]) -> Vec<Result<Vec<f32>, EmbedError>>
    where
        E: Embedder + ?Sized,
    {
        let mut results = Vec::with_capacity(texts.len());
        for wave in self.split(texts) {
            let calls = wave.iter().map(|text| embedder.embed(text));
            results.extend(join_all(calls).await);
        }
        results
    }
}

impl Default for Batcher {
    fn default() -> Self {
        Self::new(super::DEFAULT_WAVE_SIZE)
    }
}
