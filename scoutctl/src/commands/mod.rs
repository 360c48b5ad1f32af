pub mod artifacts;
pub mod checkpoint;
pub mod crawl;
pub mod score;
