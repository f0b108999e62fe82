//! Raw samples → prompt → tokens → packed chunks, one split at a time.
//!
//! Tokenisation of a batch may fan out over rayon; the results come back in
//! input order and are packed on the calling thread. [`pack_split_prefetched`]
//! additionally moves reading and tokenisation onto a producer thread.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;

use anyhow::Result;
use rolepack_common::{PromptTemplate, RawSample, SampleReader, TokenSource, TokenizedExample};

use crate::mapper::{PackedDatasetMapper, PackedSplit};

/// Packs one split. The token source and template are borrowed, so several
/// splits can share them while each keeps its own buffer.
pub struct SplitPacker<'a, S: TokenSource + ?Sized> {
    source: &'a S,
    template: &'a PromptTemplate,
    mapper: PackedDatasetMapper,
}

impl<'a, S: TokenSource + ?Sized> SplitPacker<'a, S> {
    pub fn new(
        name: impl Into<String>,
        source: &'a S,
        template: &'a PromptTemplate,
        chunk_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            source,
            template,
            mapper: PackedDatasetMapper::new(name, chunk_size)?,
        })
    }

    pub fn mapper(&self) -> &PackedDatasetMapper {
        &self.mapper
    }

    /// Render, tokenise and pack one batch. Returns chunks emitted.
    pub fn pack_batch(&mut self, samples: &[RawSample]) -> Result<usize> {
        let texts: Vec<String> = samples.iter().map(|s| self.template.render(s)).collect();
        let tokenized = self.source.encode_batch(&texts)?;
        Ok(self.mapper.map_batch(&tokenized)?)
    }

    pub fn finish(self) -> PackedSplit {
        self.mapper.finish()
    }
}

/// Pack every sample `reader` yields into a single split.
pub fn pack_split<S: TokenSource + ?Sized>(
    name: &str,
    source: &S,
    template: &PromptTemplate,
    reader: &mut SampleReader,
    chunk_size: usize,
) -> Result<PackedSplit> {
    let mut packer = SplitPacker::new(name, source, template, chunk_size)?;
    while let Some(batch) = reader.next_batch()? {
        packer.pack_batch(&batch)?;
    }
    Ok(packer.finish())
}

// ── Prefetch ────────────────────────────────────────────────────────────────

type EncodedBatch = Result<Vec<TokenizedExample>>;

/// Pack a split while a scoped producer thread reads, renders and tokenises
/// up to `prefetch` batches ahead. The calling thread stays the only packing
/// consumer, so chunks are identical to [`pack_split`]. `prefetch == 0`
/// tokenises inline.
///
/// `on_batch` runs after each batch is packed with the batch's sample count.
pub fn pack_split_prefetched<S, F>(
    name: &str,
    source: &S,
    template: &PromptTemplate,
    reader: &mut SampleReader,
    chunk_size: usize,
    prefetch: usize,
    mut on_batch: F,
) -> Result<PackedSplit>
where
    S: TokenSource + ?Sized,
    F: FnMut(usize, &PackedDatasetMapper),
{
    let mut mapper = PackedDatasetMapper::new(name, chunk_size)?;

    if prefetch == 0 {
        while let Some(batch) = reader.next_batch()? {
            let texts: Vec<String> = batch.iter().map(|s| template.render(s)).collect();
            let encoded = source.encode_batch(&texts)?;
            mapper.map_batch(&encoded)?;
            on_batch(encoded.len(), &mapper);
        }
        return Ok(mapper.finish());
    }

    thread::scope(|scope| -> Result<()> {
        let (tx, rx) = sync_channel::<EncodedBatch>(prefetch);
        let producer = scope.spawn(move || produce(source, template, reader, tx));
        // `rx` is consumed here, so a packing error unblocks the producer.
        let consumed = consume(&mut mapper, rx, &mut on_batch);
        let joined = producer.join();
        consumed?;
        joined.map_err(|_| anyhow::anyhow!("tokeniser thread panicked"))
    })?;

    Ok(mapper.finish())
}

/// Stops at end of input, after forwarding the first error, or once the
/// consumer hangs up.
fn produce<S: TokenSource + ?Sized>(
    source: &S,
    template: &PromptTemplate,
    reader: &mut SampleReader,
    tx: SyncSender<EncodedBatch>,
) {
    loop {
        let batch = match reader.next_batch() {
            Ok(Some(batch)) => batch,
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        };
        let texts: Vec<String> = batch.iter().map(|s| template.render(s)).collect();
        let encoded = source.encode_batch(&texts);
        let failed = encoded.is_err();
        if tx.send(encoded).is_err() || failed {
            return;
        }
    }
}

fn consume<F>(
    mapper: &mut PackedDatasetMapper,
    rx: Receiver<EncodedBatch>,
    on_batch: &mut F,
) -> Result<()>
where
    F: FnMut(usize, &PackedDatasetMapper),
{
    for msg in rx {
        let batch = msg?;
        mapper.map_batch(&batch)?;
        on_batch(batch.len(), mapper);
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Whitespace "tokeniser": one id per word (its byte length).
    struct WordLenSource;

    impl TokenSource for WordLenSource {
        fn encode(&self, text: &str) -> Result<TokenizedExample> {
            Ok(TokenizedExample::unmasked(
                text.split_whitespace().map(|w| w.len() as u32).collect(),
            ))
        }
    }

    struct FailingSource;

    impl TokenSource for FailingSource {
        fn encode(&self, _text: &str) -> Result<TokenizedExample> {
            anyhow::bail!("tokenize: boom")
        }
    }

    fn samples(n: usize) -> Vec<RawSample> {
        (0..n)
            .map(|i| RawSample {
                input_text: format!("<START>persona {i}"),
                output_text: format!("hello number {i}"),
            })
            .collect()
    }

    fn template() -> PromptTemplate {
        PromptTemplate::new("</s>", vec!["<START>".to_string()])
    }

    #[test]
    fn batching_does_not_change_output() {
        let t = template();
        let data = samples(7);

        let mut one = SplitPacker::new("train", &WordLenSource, &t, 5).unwrap();
        one.pack_batch(&data).unwrap();
        let one = one.finish();

        let mut many = SplitPacker::new("train", &WordLenSource, &t, 5).unwrap();
        for batch in data.chunks(3) {
            many.pack_batch(batch).unwrap();
        }
        let many = many.finish();

        assert!(!one.examples.is_empty());
        assert_eq!(one.examples, many.examples);
        assert_eq!(one.stats, many.stats);
        assert_eq!(one.stats.examples, 7);
    }

    #[test]
    fn pack_split_reads_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        for s in samples(10) {
            writeln!(f, "{}", serde_json::to_string(&s).unwrap()).unwrap();
        }
        drop(f);

        let mut reader = SampleReader::new(&path, 4).unwrap();
        let split = pack_split("train", &WordLenSource, &template(), &mut reader, 6).unwrap();

        assert_eq!(split.stats.examples, 10);
        assert_eq!(split.chunk_size, 6);
        assert_eq!(split.stats.chunks, split.stats.tokens / 6);
        assert!(split.examples.iter().all(|e| e.len() == 6));
    }

    #[test]
    fn tokenizer_errors_propagate() {
        let t = template();
        let mut packer = SplitPacker::new("train", &FailingSource, &t, 4).unwrap();
        let err = packer.pack_batch(&samples(2)).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(packer.mapper().packed().is_empty());
    }

    fn write_samples(path: &std::path::Path, data: &[RawSample]) {
        let mut f = std::fs::File::create(path).unwrap();
        for s in data {
            writeln!(f, "{}", serde_json::to_string(s).unwrap()).unwrap();
        }
    }

    #[test]
    fn prefetch_matches_inline_packing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        let data = samples(23);
        write_samples(&path, &data);
        let t = template();

        let mut inline = SplitPacker::new("train", &WordLenSource, &t, 5).unwrap();
        inline.pack_batch(&data).unwrap();
        let inline = inline.finish();
        assert!(!inline.examples.is_empty());

        for batch_size in [1, 4, 23] {
            for prefetch in [0, 1, 2, 8] {
                let mut reader = SampleReader::new(&path, batch_size).unwrap();
                let mut seen = 0;
                let split = pack_split_prefetched(
                    "train",
                    &WordLenSource,
                    &t,
                    &mut reader,
                    5,
                    prefetch,
                    |n, _| seen += n,
                )
                .unwrap();
                assert_eq!(seen, 23, "batch_size={batch_size} prefetch={prefetch}");
                assert_eq!(split.examples, inline.examples);
                assert_eq!(split.stats, inline.stats);
            }
        }
    }

    #[test]
    fn prefetch_surfaces_reader_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        write_samples(&path, &samples(6));
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{{not json").unwrap();
        drop(f);

        for prefetch in [0, 1, 3] {
            let mut reader = SampleReader::new(&path, 2).unwrap();
            let err = pack_split_prefetched(
                "train",
                &WordLenSource,
                &template(),
                &mut reader,
                4,
                prefetch,
                |_, _| {},
            )
            .unwrap_err();
            assert!(
                format!("{err:#}").contains("parse sample"),
                "prefetch={prefetch}: {err:#}"
            );
        }
    }

    #[test]
    fn prefetch_surfaces_tokenizer_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        write_samples(&path, &samples(50));

        let mut reader = SampleReader::new(&path, 1).unwrap();
        let mut batches = 0;
        let err = pack_split_prefetched(
            "train",
            &FailingSource,
            &template(),
            &mut reader,
            4,
            2,
            |_, _| batches += 1,
        )
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(batches, 0);
    }

    #[test]
    fn dyn_source_is_accepted() {
        let t = template();
        let source: &dyn TokenSource = &WordLenSource;
        let mut packer = SplitPacker::new("train", source, &t, 3).unwrap();
        assert!(packer.pack_batch(&samples(3)).unwrap() > 0);
    }
}
