/// External services the answer pipeline can consult
pub mod web_search;

pub use web_search::{SearchResult, WebSearchConfig, WebSearchProvider};
