//! Pipeline services

pub mod batch_orchestrator;
pub mod dataset;
pub mod embedding_model;
pub mod feature_extractor;
pub mod http_fetcher;
pub mod link_cache;
pub mod log_mel;
pub mod postprocessor;
pub mod retrieval_worker;
pub mod retry_policy;
pub mod source_resolver;
pub mod track_pipeline;
pub mod ytdlp_client;

pub use batch_orchestrator::BatchOrchestrator;
pub use dataset::{add_column_if_absent, Dataset, DatasetRow};
pub use embedding_model::{EmbeddingModel, OnnxEmbeddingModel};
pub use feature_extractor::FeatureExtractor;
pub use http_fetcher::HttpFetcher;
pub use link_cache::LinkCache;
pub use postprocessor::Postprocessor;
pub use retrieval_worker::{AudioFetcher, RetrievalWorker};
pub use retry_policy::RetryPolicy;
pub use source_resolver::{MatchDecision, SearchBackend, SearchCandidate, SourceResolver};
pub use track_pipeline::TrackPipeline;
pub use ytdlp_client::YtDlpClient;
