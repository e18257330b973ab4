pub mod facebook;
pub mod rss;
pub mod twitter;
