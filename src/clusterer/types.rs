/// Anything that carries an embedding can be clustered
pub trait Embedded {
    fn embedding(&self) -> &[f32];
}

impl Embedded for Vec<f32> {
    fn embedding(&self) -> &[f32] {
        self
    }
}

impl Embedded for &[f32] {
    fn embedding(&self) -> &[f32] {
        self
    }
}

/// A question whose embedding is known, ready for clustering
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedQuestion {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

impl Embedded for EmbeddedQuestion {
    fn embedding(&self) -> &[f32] {
        &self.embedding
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterParams {
    /// Pairs merge only when similarity is strictly above this value
    pub threshold: f32,
    /// Groups smaller than this are dropped after convergence
    pub min_size: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            min_size: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Indices into the clustered input, ascending
    pub members: Vec<usize>,
    pub centroid: Vec<f32>,
}

impl Cluster {
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterResult {
    pub clusters: Vec<Cluster>,
    /// Number of merge steps performed
    pub merges: usize,
    /// Groups dropped for being below the minimum size
    pub discarded: usize,
}
