//! Word-window chunking of already-extracted page text.
//!
//! Each page is split into windows of `chunk_size` whitespace-separated words,
//! consecutive windows sharing `overlap` words. Chunks never span pages, so a
//! chunk's page marker is always exact.

use uuid::Uuid;

use crate::models::Chunk;

/// Output of the chunking process for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOutput {
    pub content: String,
    /// Index of the first word of this window within the page.
    pub start_word: usize,
}

/// Split one page of text into overlapping word windows.
pub fn chunk_words(text: &str, chunk_size: usize, overlap: usize) -> Vec<ChunkOutput> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() || chunk_size == 0 {
        return Vec::new();
    }

    // An overlap >= chunk_size would never advance
    let stride = chunk_size.saturating_sub(overlap).max(1);

    let mut out = Vec::new();
    let mut start = 0usize;
    while start < words.len() {
        let end = (start + chunk_size).min(words.len());
        out.push(ChunkOutput {
            content: words[start..end].join(" "),
            start_word: start,
        });
        if end == words.len() {
            break;
        }
        start += stride;
    }
    out
}

/// Chunk every page of a document. Blank pages produce no chunks.
pub fn chunk_document(
    document_id: Uuid,
    filename: &str,
    pages: &[String],
    chunk_size: usize,
    overlap: usize,
) -> Vec<Chunk> {
    pages
        .iter()
        .enumerate()
        .flat_map(|(page, text)| {
            chunk_words(text, chunk_size, overlap)
                .into_iter()
                .enumerate()
                .map(move |(chunk_index, c)| Chunk {
                    document_id,
                    filename: filename.to_string(),
                    page,
                    chunk_index,
                    content: c.content,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_empty_text_produces_no_chunks() {
        assert!(chunk_words("", 10, 2).is_empty());
        assert!(chunk_words("   \n\t ", 10, 2).is_empty());
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunks = chunk_words("one two three", 10, 2);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "one two three");
    }

    #[test]
    fn test_windows_overlap() {
        let chunks = chunk_words(&words(10), 4, 1);
        // stride 3: starts at 0, 3, 6 (6..10 reaches the end)
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].content, "w0 w1 w2 w3");
        assert_eq!(chunks[1].content, "w3 w4 w5 w6");
        assert_eq!(chunks[2].content, "w6 w7 w8 w9");
        assert_eq!(chunks[2].start_word, 6);
    }

    #[test]
    fn test_overlap_not_smaller_than_size_still_advances() {
        let chunks = chunk_words(&words(5), 2, 5);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks.last().unwrap().content, "w3 w4");
    }

    #[test]
    fn test_whitespace_is_normalized() {
        let chunks = chunk_words("a\n\nb\t c", 10, 0);
        assert_eq!(chunks[0].content, "a b c");
    }

    #[test]
    fn test_document_chunks_keep_page_markers() {
        let id = Uuid::new_v4();
        let pages = vec![words(6), String::new(), words(3)];
        let chunks = chunk_document(id, "doc.pdf", &pages, 4, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!((chunks[0].page, chunks[0].chunk_index), (0, 0));
        assert_eq!((chunks[1].page, chunks[1].chunk_index), (0, 1));
        assert_eq!((chunks[2].page, chunks[2].chunk_index), (2, 0));
        assert_eq!(chunks[2].id(), "doc.pdf_p2_c0");
        assert!(chunks.iter().all(|c| c.document_id == id));
    }
}
