//! Pack file building blocks: the in-memory encoder used by pull and splice,
//! the indexer that unpacks client uploads into a side directory, and the
//! `.idx` parser the push pipeline vets uploads with.

pub mod encode;
pub mod entry;
pub mod index;
pub mod indexer;
