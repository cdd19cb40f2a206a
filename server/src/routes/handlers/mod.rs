pub mod categorize;
pub mod feed;
pub mod search;
pub mod status;
