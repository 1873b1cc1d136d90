//! Parsed corpus view: lazy, span-logged access to canonical document text.
//!
//! Sandbox code sees the corpus as an indexable, sliceable structure; every
//! byte that reaches it goes through a range read here and leaves a span log
//! entry behind. Nothing prefetches whole documents.

use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::debug;

use rlm_protocol::DocumentRef;
use rlm_protocol::Session;
use rlm_protocol::SpanLogEntry;
use rlm_steplang::CorpusHost;
use rlm_steplang::HostError;
use rlm_steplang::HostErrorKind;
use rlm_steplang::SectionSpan;

use crate::storage::ObjectStore;
use crate::storage::parsed_meta_key;
use crate::storage::parsed_offsets_key;
use crate::storage::parsed_text_key;

/// Char→byte checkpoint table, produced by the parser service alongside the
/// canonical text. `checkpoints[i]` is the byte offset of char `i * interval`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetTable {
    pub interval: usize,
    pub checkpoints: Vec<u64>,
    pub total_chars: usize,
    pub total_bytes: u64,
}

impl OffsetTable {
    pub fn build(text: &str, interval: usize) -> Self {
        let interval = interval.max(1);
        let mut checkpoints = vec![0u64];
        let mut chars = 0usize;
        for (byte_offset, _) in text.char_indices() {
            if chars > 0 && chars % interval == 0 {
                checkpoints.push(byte_offset as u64);
            }
            chars += 1;
        }
        // char_indices yields offsets *before* each char, so the loop above
        // records a checkpoint when it reaches the first char of an interval.
        // A trailing exact-boundary checkpoint is covered by total_bytes.
        Self {
            interval,
            checkpoints,
            total_chars: chars,
            total_bytes: text.len() as u64,
        }
    }

    fn is_ascii(&self) -> bool {
        self.total_bytes as usize == self.total_chars
    }

    /// Closest checkpoint at or before `char_pos`, as `(char, byte)`.
    fn checkpoint_for(&self, char_pos: usize) -> (usize, u64) {
        let interval = self.interval.max(1);
        let index = (char_pos / interval).min(self.checkpoints.len().saturating_sub(1));
        (index * interval, self.checkpoints[index])
    }
}

/// Structural metadata sidecar: page spans plus an optional flat section list
/// with char ranges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocMeta {
    #[serde(default)]
    pub pages: Vec<(usize, usize)>,
    #[serde(default)]
    pub sections: Vec<MetaSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaSection {
    pub title: String,
    pub start_char: usize,
    pub end_char: usize,
}

struct DocEntry {
    doc: DocumentRef,
    text_key: String,
    meta_key: String,
    offsets_key: String,
    offsets: OnceCell<OffsetTable>,
    meta: OnceCell<DocMeta>,
}

struct SpanState {
    entries: Vec<SpanLogEntry>,
    max_per_step: usize,
    remaining_total: usize,
}

/// Per-execution corpus accessor. One instance lives for the whole execution;
/// the span log is drained after each step and accumulated by the caller.
pub struct CorpusView {
    store: Arc<dyn ObjectStore>,
    docs: Vec<DocEntry>,
    spans: Mutex<SpanState>,
}

impl CorpusView {
    pub fn new(store: Arc<dyn ObjectStore>, session: &Session) -> Self {
        let docs = session
            .documents
            .iter()
            .map(|doc| DocEntry {
                text_key: parsed_text_key(&session.tenant, session.session_id, &doc.doc_id),
                meta_key: parsed_meta_key(&session.tenant, session.session_id, &doc.doc_id),
                offsets_key: parsed_offsets_key(&session.tenant, session.session_id, &doc.doc_id),
                doc: doc.clone(),
                offsets: OnceCell::new(),
                meta: OnceCell::new(),
            })
            .collect();
        Self {
            store,
            docs,
            spans: Mutex::new(SpanState {
                entries: Vec::new(),
                max_per_step: usize::MAX,
                remaining_total: usize::MAX,
            }),
        }
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    pub fn doc_len(&self, doc_index: usize) -> usize {
        self.docs.get(doc_index).map(|d| d.doc.char_len).unwrap_or(0)
    }

    pub fn doc_lens(&self) -> Vec<usize> {
        self.docs.iter().map(|d| d.doc.char_len).collect()
    }

    pub fn doc_ref(&self, doc_index: usize) -> Option<&DocumentRef> {
        self.docs.get(doc_index).map(|d| &d.doc)
    }

    /// Arm the span caps for the next step and clear any stale entries.
    pub fn begin_step(&self, max_per_step: usize, remaining_total: usize) {
        let mut spans = self.spans.lock().unwrap_or_else(|e| e.into_inner());
        spans.entries.clear();
        spans.max_per_step = max_per_step;
        spans.remaining_total = remaining_total;
    }

    /// Take the spans recorded since [`Self::begin_step`], in program order.
    pub fn drain_step_spans(&self) -> Vec<SpanLogEntry> {
        let mut spans = self.spans.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut spans.entries)
    }

    fn record_span(
        &self,
        doc_index: usize,
        start: usize,
        end: usize,
        tag: Option<&str>,
    ) -> Result<(), HostError> {
        let mut spans = self.spans.lock().unwrap_or_else(|e| e.into_inner());
        if spans.entries.len() >= spans.max_per_step {
            return Err(HostError::new(
                HostErrorKind::SpanBudget,
                "per-step span budget exhausted",
            ));
        }
        if spans.remaining_total == 0 {
            return Err(HostError::new(
                HostErrorKind::SpanBudget,
                "execution span budget exhausted",
            ));
        }
        spans.remaining_total -= 1;
        spans.entries.push(SpanLogEntry {
            doc_index,
            start_char: start,
            end_char: end,
            tag: tag.map(str::to_string),
        });
        Ok(())
    }

    fn entry(&self, doc_index: usize) -> Result<&DocEntry, HostError> {
        self.docs.get(doc_index).ok_or_else(|| {
            HostError::new(
                HostErrorKind::Read,
                format!("document index {doc_index} out of range"),
            )
        })
    }

    async fn offsets(&self, doc_index: usize) -> Result<&OffsetTable, HostError> {
        let entry = self.entry(doc_index)?;
        entry
            .offsets
            .get_or_try_init(|| async {
                let bytes = self
                    .store
                    .get(&entry.offsets_key, None)
                    .await
                    .map_err(|e| HostError::new(HostErrorKind::Read, e.to_string()))?;
                serde_json::from_slice::<OffsetTable>(&bytes)
                    .map_err(|e| HostError::new(HostErrorKind::Integrity, e.to_string()))
            })
            .await
    }

    async fn meta(&self, doc_index: usize) -> Result<&DocMeta, HostError> {
        let entry = self.entry(doc_index)?;
        entry
            .meta
            .get_or_try_init(|| async {
                let bytes = self
                    .store
                    .get(&entry.meta_key, None)
                    .await
                    .map_err(|e| HostError::new(HostErrorKind::Read, e.to_string()))?;
                serde_json::from_slice::<DocMeta>(&bytes)
                    .map_err(|e| HostError::new(HostErrorKind::Integrity, e.to_string()))
            })
            .await
    }

    /// Byte offset of `char_pos`: checkpoint lookup plus a bounded linear
    /// scan of the raw bytes inside one checkpoint interval. UTF-8 lead
    /// bytes are counted directly so the scan never needs a full decode.
    async fn char_to_byte(&self, doc_index: usize, char_pos: usize) -> Result<u64, HostError> {
        let table = self.offsets(doc_index).await?;
        let char_pos = char_pos.min(table.total_chars);
        if table.is_ascii() {
            return Ok(char_pos as u64);
        }
        if char_pos == table.total_chars {
            return Ok(table.total_bytes);
        }
        let (ckpt_char, ckpt_byte) = table.checkpoint_for(char_pos);
        let need = char_pos - ckpt_char;
        if need == 0 {
            return Ok(ckpt_byte);
        }
        let entry = self.entry(doc_index)?;
        let window_end = (ckpt_byte + (need as u64) * 4 + 4).min(table.total_bytes);
        let bytes = self
            .store
            .get(&entry.text_key, Some(ckpt_byte..window_end))
            .await
            .map_err(|e| HostError::new(HostErrorKind::Read, e.to_string()))?;
        let mut chars_seen = 0usize;
        for (offset, byte) in bytes.iter().enumerate() {
            if byte & 0xC0 != 0x80 {
                if chars_seen == need {
                    return Ok(ckpt_byte + offset as u64);
                }
                chars_seen += 1;
            }
        }
        if chars_seen == need {
            return Ok(ckpt_byte + bytes.len() as u64);
        }
        Err(HostError::new(
            HostErrorKind::Integrity,
            "offset table does not match canonical text",
        ))
    }

    /// Range-read canonical text without logging. Used internally and by the
    /// citation engine; sandbox-visible paths log through the wrappers below.
    pub(crate) async fn read_raw(
        &self,
        doc_index: usize,
        start: usize,
        end: usize,
    ) -> Result<String, HostError> {
        let len = self.doc_len(doc_index);
        let start = start.min(len);
        let end = end.min(len);
        if start >= end {
            return Ok(String::new());
        }
        let byte_start = self.char_to_byte(doc_index, start).await?;
        let byte_end = self.char_to_byte(doc_index, end).await?;
        let entry = self.entry(doc_index)?;
        let bytes = self
            .store
            .get(&entry.text_key, Some(byte_start..byte_end))
            .await
            .map_err(|e| HostError::new(HostErrorKind::Read, e.to_string()))?;
        String::from_utf8(bytes).map_err(|_| {
            HostError::new(
                HostErrorKind::Integrity,
                "canonical text is not valid UTF-8 at range boundary",
            )
        })
    }

    /// `doc[a:b]` / `doc.slice(a, b, tag)`. Returns text and logs the span
    /// atomically; empty ranges return `""` and log nothing.
    pub async fn slice(
        &self,
        doc_index: usize,
        start: usize,
        end: usize,
        tag: Option<&str>,
    ) -> Result<String, HostError> {
        let len = self.doc_len(doc_index);
        let start = start.min(len);
        let end = end.min(len);
        if start >= end {
            return Ok(String::new());
        }
        let text = self.read_raw(doc_index, start, end).await?;
        self.record_span(doc_index, start, end, tag)?;
        Ok(text)
    }

    /// Literal search over `[start, end)`. Hit ranges are returned without
    /// exposing the window text; each hit is logged under `scan`.
    pub async fn find(
        &self,
        doc_index: usize,
        needle: &str,
        start: usize,
        end: usize,
        max_hits: usize,
        tag: Option<&str>,
    ) -> Result<Vec<(usize, usize)>, HostError> {
        if needle.is_empty() || max_hits == 0 {
            return Ok(Vec::new());
        }
        let window = self.read_raw(doc_index, start, end).await?;
        let needle_chars = needle.chars().count();
        let mut hits = Vec::new();
        let mut char_offset = 0usize;
        let mut rest = window.as_str();
        while let Some(byte_pos) = rest.find(needle) {
            let chars_before = rest[..byte_pos].chars().count();
            let hit_start = start + char_offset + chars_before;
            hits.push((hit_start, hit_start + needle_chars));
            if hits.len() >= max_hits {
                break;
            }
            let advance = byte_pos + needle.len();
            char_offset += rest[..advance].chars().count();
            rest = &rest[advance..];
        }
        self.log_scan_hits(doc_index, &hits, tag)?;
        Ok(hits)
    }

    /// Regex search over `[start, end)`; the engine stays host-side. Invalid
    /// patterns fail without reading anything.
    pub async fn regex(
        &self,
        doc_index: usize,
        pattern: &str,
        start: usize,
        end: usize,
        max_hits: usize,
        tag: Option<&str>,
    ) -> Result<Vec<(usize, usize)>, HostError> {
        let re = regex_lite::Regex::new(pattern)
            .map_err(|e| HostError::new(HostErrorKind::BadPattern, e.to_string()))?;
        if max_hits == 0 {
            return Ok(Vec::new());
        }
        let window = self.read_raw(doc_index, start, end).await?;
        let mut hits = Vec::new();
        for m in re.find_iter(&window) {
            let hit_start = start + window[..m.start()].chars().count();
            let hit_len = m.as_str().chars().count();
            if hit_len == 0 {
                continue;
            }
            hits.push((hit_start, hit_start + hit_len));
            if hits.len() >= max_hits {
                break;
            }
        }
        self.log_scan_hits(doc_index, &hits, tag)?;
        Ok(hits)
    }

    fn log_scan_hits(
        &self,
        doc_index: usize,
        hits: &[(usize, usize)],
        tag: Option<&str>,
    ) -> Result<(), HostError> {
        let scan_tag = match tag {
            Some(t) => format!("scan:{t}"),
            None => "scan".to_string(),
        };
        for (a, b) in hits {
            self.record_span(doc_index, *a, *b, Some(&scan_tag))?;
        }
        Ok(())
    }

    pub async fn sections(&self, doc_index: usize) -> Result<Vec<SectionSpan>, HostError> {
        let len = self.doc_len(doc_index);
        let sections: Vec<SectionSpan> = self
            .meta(doc_index)
            .await?
            .sections
            .iter()
            .map(|s| SectionSpan {
                title: s.title.clone(),
                start_char: s.start_char.min(len),
                end_char: s.end_char.min(len),
            })
            .collect();
        for section in &sections {
            if section.start_char < section.end_char {
                self.record_span(
                    doc_index,
                    section.start_char,
                    section.end_char,
                    Some("structure"),
                )?;
            }
        }
        Ok(sections)
    }

    pub async fn page_spans(&self, doc_index: usize) -> Result<Vec<(usize, usize)>, HostError> {
        let len = self.doc_len(doc_index);
        let pages: Vec<(usize, usize)> = self
            .meta(doc_index)
            .await?
            .pages
            .iter()
            .map(|(a, b)| ((*a).min(len), (*b).min(len)))
            .collect();
        for (a, b) in &pages {
            if a < b {
                self.record_span(doc_index, *a, *b, Some("structure"))?;
            }
        }
        Ok(pages)
    }
}

/// Synchronous bridge handed to the evaluator. Sandbox steps run on a
/// blocking thread, so re-entering the async object store via the runtime
/// handle is safe here.
pub struct BlockingCorpusHost {
    view: Arc<CorpusView>,
    handle: tokio::runtime::Handle,
}

impl BlockingCorpusHost {
    pub fn new(view: Arc<CorpusView>, handle: tokio::runtime::Handle) -> Self {
        Self { view, handle }
    }
}

impl CorpusHost for BlockingCorpusHost {
    fn doc_count(&self) -> usize {
        self.view.doc_count()
    }

    fn doc_len(&self, doc_index: usize) -> usize {
        self.view.doc_len(doc_index)
    }

    fn read_slice(
        &self,
        doc_index: usize,
        start: usize,
        end: usize,
        tag: Option<&str>,
    ) -> Result<String, HostError> {
        debug!(doc_index, start, end, tag, "sandbox slice");
        self.handle
            .block_on(self.view.slice(doc_index, start, end, tag))
    }

    fn find(
        &self,
        doc_index: usize,
        needle: &str,
        start: usize,
        end: usize,
        max_hits: usize,
        tag: Option<&str>,
    ) -> Result<Vec<(usize, usize)>, HostError> {
        self.handle
            .block_on(self.view.find(doc_index, needle, start, end, max_hits, tag))
    }

    fn regex(
        &self,
        doc_index: usize,
        pattern: &str,
        start: usize,
        end: usize,
        max_hits: usize,
        tag: Option<&str>,
    ) -> Result<Vec<(usize, usize)>, HostError> {
        self.handle
            .block_on(self.view.regex(doc_index, pattern, start, end, max_hits, tag))
    }

    fn sections(&self, doc_index: usize) -> Result<Vec<SectionSpan>, HostError> {
        self.handle.block_on(self.view.sections(doc_index))
    }

    fn page_spans(&self, doc_index: usize) -> Result<Vec<(usize, usize)>, HostError> {
        self.handle.block_on(self.view.page_spans(doc_index))
    }
}
