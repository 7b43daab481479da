pub mod keyword;

pub use keyword::{tokenize, Bm25Params, KeywordIndex};
