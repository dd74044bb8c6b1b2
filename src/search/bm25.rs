use anyhow::{Context, Result};
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::*;
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy};
use uuid::Uuid;

use crate::models::Chunk;

const WRITER_MEMORY_BYTES: usize = 50_000_000;

/// BM25 lexical index built on tantivy.
pub struct Bm25Index {
    index: Index,
    reader: IndexReader,
    // Field handles
    f_document_id: Field,
    f_filename: Field,
    f_page: Field,
    f_chunk_index: Field,
    f_content: Field,
}

#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub chunk: Chunk,
    pub score: f32,
}

fn build_schema() -> (Schema, [Field; 5]) {
    let mut schema_builder = Schema::builder();
    let f_document_id = schema_builder.add_text_field("document_id", STRING | STORED);
    let f_filename = schema_builder.add_text_field("filename", STRING | STORED);
    let f_page = schema_builder.add_u64_field("page", NumericOptions::default() | STORED);
    let f_chunk_index =
        schema_builder.add_u64_field("chunk_index", NumericOptions::default() | STORED);
    let f_content = schema_builder.add_text_field("content", TEXT | STORED);
    (
        schema_builder.build(),
        [f_document_id, f_filename, f_page, f_chunk_index, f_content],
    )
}

impl Bm25Index {
    /// Create or open a BM25 index at the given directory.
    pub fn open_or_create(index_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(index_dir)?;
        let (schema, _) = build_schema();

        let index = if index_dir.join("meta.json").exists() {
            Index::open_in_dir(index_dir).context("Failed to open existing tantivy index")?
        } else {
            Index::create_in_dir(index_dir, schema).context("Failed to create tantivy index")?
        };
        Self::from_index(index)
    }

    /// Create a throwaway index held in memory.
    pub fn in_memory() -> Result<Self> {
        let (schema, _) = build_schema();
        Self::from_index(Index::create_in_ram(schema))
    }

    fn from_index(index: Index) -> Result<Self> {
        let schema = index.schema();
        let field = |name: &str| {
            schema
                .get_field(name)
                .with_context(|| format!("Index schema is missing field '{name}'"))
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .context("Failed to create reader")?;

        Ok(Self {
            f_document_id: field("document_id")?,
            f_filename: field("filename")?,
            f_page: field("page")?,
            f_chunk_index: field("chunk_index")?,
            f_content: field("content")?,
            index,
            reader,
        })
    }

    fn writer(&self) -> Result<IndexWriter> {
        self.index
            .writer_with_num_threads(1, WRITER_MEMORY_BYTES)
            .context("Failed to create index writer")
    }

    /// Index a batch of chunks in a single commit.
    pub fn index_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut writer = self.writer()?;

        for chunk in chunks {
            writer.add_document(doc!(
                self.f_document_id => chunk.document_id.to_string(),
                self.f_filename => chunk.filename.clone(),
                self.f_page => chunk.page as u64,
                self.f_chunk_index => chunk.chunk_index as u64,
                self.f_content => chunk.content.clone(),
            ))?;
        }

        writer.commit().context("Failed to commit index")?;
        self.reader.reload().context("Failed to reload reader")?;
        Ok(())
    }

    /// Delete all chunks of a document in a single commit.
    pub fn delete_document(&self, document_id: &Uuid) -> Result<()> {
        let mut writer = self.writer()?;

        let term = tantivy::Term::from_field_text(self.f_document_id, &document_id.to_string());
        writer.delete_term(term);
        writer.commit().context("Failed to commit delete")?;
        self.reader.reload().context("Failed to reload reader")?;
        Ok(())
    }

    pub fn num_chunks(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Search the index and return hits ranked by BM25 score, highest first.
    pub fn search(&self, query_str: &str, limit: usize) -> Result<Vec<LexicalHit>> {
        let cleaned = keyword_query(query_str);
        if cleaned.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();

        let query_parser = QueryParser::for_index(&self.index, vec![self.f_content]);
        let query = query_parser
            .parse_query(&cleaned)
            .context("Failed to parse search query")?;

        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(limit))
            .context("Search failed")?;

        let mut hits = Vec::with_capacity(top_docs.len());

        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(doc_address)
                .context("Failed to retrieve document")?;

            let document_id = match doc
                .get_first(self.f_document_id)
                .and_then(|v| v.as_str())
                .map(Uuid::parse_str)
            {
                Some(Ok(id)) => id,
                _ => continue,
            };

            let text = |f: Field| {
                doc.get_first(f)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            let num = |f: Field| doc.get_first(f).and_then(|v| v.as_u64()).unwrap_or(0) as usize;

            hits.push(LexicalHit {
                chunk: Chunk {
                    document_id,
                    filename: text(self.f_filename),
                    page: num(self.f_page),
                    chunk_index: num(self.f_chunk_index),
                    content: text(self.f_content),
                },
                score,
            });
        }

        Ok(hits)
    }
}

/// Reduce free text to bare keywords so query syntax characters
/// ('?', ':', quotes, ...) in natural-language questions never fail parsing.
fn keyword_query(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
