pub mod bm25;
pub mod corpus;
pub mod hybrid;
pub mod vector;
