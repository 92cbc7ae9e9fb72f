pub mod openai;
pub mod registry;
pub mod streaming;

pub use openai::OpenAiProvider;
pub use registry::{preset_base_url, ProviderRegistry};
