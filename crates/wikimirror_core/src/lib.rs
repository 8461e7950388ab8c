pub mod api;
pub mod changefeed;
pub mod config;
pub mod execution;
pub mod expansion;
pub mod flags;
pub mod grabbers;
pub mod link_cache;
pub mod migrate;
pub mod replay;
pub mod runtime;
pub mod sync;
pub mod timestamp;
pub mod title;
pub mod wikitext;

#[cfg(test)]
mod test_support;
