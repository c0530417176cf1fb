//! Storage layer: the meta-writer backing the consensus log's local storage.

pub mod meta_writer;
