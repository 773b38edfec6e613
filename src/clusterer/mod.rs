mod agglomerative;
mod centroid;
mod error;
mod representative;
mod similarity;
mod types;


pub use agglomerative::agglomerate;
pub use centroid::compute_centroid;
pub use error::SimilarityError;
pub use representative::most_representative;
pub use similarity::cosine_similarity;
pub use types::{Cluster, ClusterParams, ClusterResult, Embedded, EmbeddedQuestion};
