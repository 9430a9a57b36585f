//! A replayable, index-addressed view over a token stream.
//!
//! Downstream consumers that need positional access (scoring, branching
//! interpreters) wrap a [`TokenStream`] in a [`ResponseBuffer`]: every chunk
//! pulled from the underlying stream is memoised, indices are dense and
//! monotonic, and a chunk once delivered is never mutated.

use crate::chunk::TokenChunk;
use crate::error::Result;
use crate::remote::stream::TokenStream;

/// Memoising buffer over a [`TokenStream`].
pub struct ResponseBuffer {
    source: Option<TokenStream>,
    chunks: Vec<TokenChunk>,
    ended: bool,
}

impl ResponseBuffer {
    /// Buffer a live stream.
    pub fn new(stream: TokenStream) -> ResponseBuffer {
        ResponseBuffer {
            source: Some(stream),
            chunks: Vec::new(),
            ended: false,
        }
    }

    /// Wrap already-buffered chunks, marking them as fixed data.
    pub fn fixed(mut chunks: Vec<TokenChunk>) -> ResponseBuffer {
        for chunk in &mut chunks {
            chunk.fixed = true;
        }
        ResponseBuffer {
            source: None,
            chunks,
            ended: true,
        }
    }

    /// A buffer holding exactly one chunk.
    pub fn singleton(chunk: TokenChunk) -> ResponseBuffer {
        ResponseBuffer {
            source: None,
            chunks: vec![chunk],
            ended: true,
        }
    }

    /// Number of chunks pulled so far.
    pub fn buffered_len(&self) -> usize {
        self.chunks.len()
    }

    /// The chunk at index `i`, pulling from the underlying stream as
    /// needed. `None` once the stream has ended before `i`.
    pub async fn get(&mut self, i: usize) -> Result<Option<&TokenChunk>> {
        while self.chunks.len() <= i && !self.ended {
            match self.source.as_mut() {
                Some(stream) => match stream.next().await {
                    Some(Ok(chunk)) => self.chunks.push(chunk),
                    Some(Err(error)) => {
                        self.ended = true;
                        return Err(error);
                    }
                    None => self.ended = true,
                },
                None => self.ended = true,
            }
        }
        Ok(self.chunks.get(i))
    }

    /// Whether the buffer holds no chunks at all.
    pub async fn is_empty(&mut self) -> Result<bool> {
        Ok(self.get(0).await?.is_none())
    }

    /// A tail view starting at `lower`.
    pub fn slice_from(&mut self, lower: usize) -> BufferView<'_> {
        BufferView {
            buffer: self,
            lower,
        }
    }
}

/// A tail view into a [`ResponseBuffer`], re-indexed from its lower bound.
pub struct BufferView<'a> {
    buffer: &'a mut ResponseBuffer,
    lower: usize,
}

impl<'a> BufferView<'a> {
    pub async fn get(&mut self, i: usize) -> Result<Option<&TokenChunk>> {
        self.buffer.get(self.lower + i).await
    }

    pub async fn is_empty(&mut self) -> Result<bool> {
        Ok(self.get(0).await?.is_none())
    }

    /// Narrow the view further.
    pub fn slice_from(self, lower: usize) -> BufferView<'a> {
        BufferView {
            buffer: self.buffer,
            lower: self.lower + lower,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, offset: usize) -> TokenChunk {
        let mut c = TokenChunk::echoed(text, offset);
        c.fixed = false;
        c
    }

    #[tokio::test]
    async fn test_fixed_buffer_indexing() {
        let mut buffer = ResponseBuffer::fixed(vec![chunk("a", 0), chunk("b", 1)]);
        assert_eq!(buffer.get(0).await.unwrap().unwrap().text, "a");
        assert_eq!(buffer.get(1).await.unwrap().unwrap().text, "b");
        assert!(buffer.get(2).await.unwrap().is_none());
        // fixed data is flagged as such
        assert!(buffer.get(0).await.unwrap().unwrap().fixed);
    }

    #[tokio::test]
    async fn test_singleton() {
        let mut buffer = ResponseBuffer::singleton(chunk("only", 0));
        assert!(!buffer.is_empty().await.unwrap());
        assert_eq!(buffer.get(0).await.unwrap().unwrap().text, "only");
        assert!(buffer.get(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeated_get_returns_same_chunk() {
        let mut buffer = ResponseBuffer::fixed(vec![chunk("a", 0)]);
        let first = buffer.get(0).await.unwrap().unwrap().clone();
        let second = buffer.get(0).await.unwrap().unwrap().clone();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_tail_view_reindexes() {
        let mut buffer = ResponseBuffer::fixed(vec![chunk("a", 0), chunk("b", 1), chunk("c", 2)]);
        let mut view = buffer.slice_from(1);
        assert_eq!(view.get(0).await.unwrap().unwrap().text, "b");
        assert_eq!(view.get(1).await.unwrap().unwrap().text, "c");
        assert!(view.get(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_buffer() {
        let mut buffer = ResponseBuffer::fixed(Vec::new());
        assert!(buffer.is_empty().await.unwrap());
    }
}
