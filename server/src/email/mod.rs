pub mod client;
pub mod fetcher;
pub mod imap;
pub mod rules;
