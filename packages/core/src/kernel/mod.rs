//! Cross-cutting infrastructure shared by every domain: the rate-limited
//! HTTP client, checkpoint store, embeddings client, and geocoding client.
//! Nothing here depends on a domain module; domains depend on the kernel,
//! never the reverse.

pub mod checkpoint;
pub mod embeddings;
pub mod geocoding;
pub mod http_client;
pub mod rate_limiter;

pub use checkpoint::CheckpointStore;
pub use embeddings::{EmbeddingClient, OpenAiEmbeddingClient};
pub use geocoding::{GeocodedLocation, GeocodingClient};
pub use http_client::RateLimitedClient;
pub use rate_limiter::RateLimiter;
