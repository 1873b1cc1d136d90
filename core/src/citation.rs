//! Citation engine: span accumulation, merge, checksummed `SpanRef`s and
//! verification.

use std::collections::BTreeMap;

use unicode_normalization::UnicodeNormalization;

use rlm_protocol::ErrorCode;
use rlm_protocol::Session;
use rlm_protocol::SpanLogEntry;
use rlm_protocol::SpanRef;

use crate::corpus::CorpusView;
use crate::error::Result;
use crate::error::RlmErr;
use crate::util::sha256_prefixed;

/// One logged span plus where it was discovered, kept across turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulatedSpan {
    pub turn_index: u32,
    pub in_turn_index: usize,
    pub entry: SpanLogEntry,
}

/// Execution-level span accumulator. Entries keep global discovery order;
/// `(turn_index, in_turn_index)` is the deterministic tiebreaker.
#[derive(Debug, Default)]
pub struct SpanAccumulator {
    spans: Vec<AccumulatedSpan>,
}

impl SpanAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_turn(&mut self, turn_index: u32, entries: &[SpanLogEntry]) {
        for (in_turn_index, entry) in entries.iter().enumerate() {
            self.spans.push(AccumulatedSpan {
                turn_index,
                in_turn_index,
                entry: entry.clone(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &SpanLogEntry> {
        self.spans.iter().map(|s| &s.entry)
    }

    /// Spans returned to the caller in `CONTEXTS` mode: tag exactly
    /// `context` or prefixed `context:`, in global discovery order.
    pub fn context_spans(&self) -> Vec<SpanLogEntry> {
        let mut tagged: Vec<&AccumulatedSpan> = self
            .spans
            .iter()
            .filter(|s| {
                s.entry
                    .tag
                    .as_deref()
                    .is_some_and(|t| t == "context" || t.starts_with("context:"))
            })
            .collect();
        tagged.sort_by_key(|s| (s.turn_index, s.in_turn_index));
        tagged.into_iter().map(|s| s.entry.clone()).collect()
    }
}

/// Merge logged ranges per document: sort by start, coalesce overlaps and
/// gaps up to `merge_gap_chars`. Merging applies across turns.
pub fn merge_spans<'a>(
    entries: impl Iterator<Item = &'a SpanLogEntry>,
    merge_gap_chars: usize,
) -> Vec<(usize, usize, usize)> {
    let mut by_doc: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
    for entry in entries {
        if entry.start_char < entry.end_char {
            by_doc
                .entry(entry.doc_index)
                .or_default()
                .push((entry.start_char, entry.end_char));
        }
    }

    let mut merged = Vec::new();
    for (doc_index, mut ranges) in by_doc {
        ranges.sort_unstable();
        let mut iter = ranges.into_iter();
        let Some((mut start, mut end)) = iter.next() else {
            continue;
        };
        for (next_start, next_end) in iter {
            if next_start <= end.saturating_add(merge_gap_chars) {
                end = end.max(next_end);
            } else {
                merged.push((doc_index, start, end));
                start = next_start;
                end = next_end;
            }
        }
        merged.push((doc_index, start, end));
    }
    merged
}

/// Checksum contract: SHA-256 over the NFC-normalized UTF-8 encoding of the
/// exact canonical slice, `sha256:`-prefixed.
pub fn span_checksum(text: &str) -> String {
    let normalized: String = text.nfc().collect();
    sha256_prefixed(normalized.as_bytes())
}

/// Emit one verifiable `SpanRef` per merged range.
pub async fn build_span_refs(
    corpus: &CorpusView,
    session: &Session,
    merged: &[(usize, usize, usize)],
) -> Result<Vec<SpanRef>> {
    let mut refs = Vec::with_capacity(merged.len());
    for (doc_index, start, end) in merged {
        let doc = corpus
            .doc_ref(*doc_index)
            .ok_or_else(|| RlmErr::internal(format!("span references unknown doc {doc_index}")))?;
        let text = corpus
            .read_raw(*doc_index, *start, *end)
            .await
            .map_err(|e| RlmErr::Validation(e.to_string()))?;
        refs.push(SpanRef {
            tenant: session.tenant.clone(),
            session_id: session.session_id,
            doc_id: doc.doc_id.clone(),
            doc_index: *doc_index,
            start_char: *start,
            end_char: *end,
            checksum: span_checksum(&text),
        });
    }
    Ok(refs)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub valid: bool,
    pub cause: Option<ErrorCode>,
}

/// Re-read the exact range and re-hash. Mismatch means the canonical text no
/// longer matches what was cited.
pub async fn verify_span_ref(corpus: &CorpusView, span_ref: &SpanRef) -> Result<VerifyOutcome> {
    let text = match corpus
        .read_raw(span_ref.doc_index, span_ref.start_char, span_ref.end_char)
        .await
    {
        Ok(text) => text,
        Err(e) => {
            return Ok(VerifyOutcome {
                valid: false,
                cause: Some(match e.kind {
                    rlm_steplang::HostErrorKind::Integrity => ErrorCode::ChecksumMismatch,
                    _ => ErrorCode::S3ReadError,
                }),
            });
        }
    };
    if span_checksum(&text) == span_ref.checksum {
        Ok(VerifyOutcome {
            valid: true,
            cause: None,
        })
    } else {
        Ok(VerifyOutcome {
            valid: false,
            cause: Some(ErrorCode::ChecksumMismatch),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(doc: usize, start: usize, end: usize, tag: Option<&str>) -> SpanLogEntry {
        SpanLogEntry {
            doc_index: doc,
            start_char: start,
            end_char: end,
            tag: tag.map(str::to_string),
        }
    }

    #[test]
    fn merges_overlaps_and_sorts_within_document() {
        let entries = [
            entry(0, 10, 20, None),
            entry(0, 5, 12, None),
            entry(0, 30, 40, None),
            entry(1, 0, 3, None),
        ];
        let merged = merge_spans(entries.iter(), 0);
        assert_eq!(merged, vec![(0, 5, 20), (0, 30, 40), (1, 0, 3)]);
    }

    #[test]
    fn gap_merge_coalesces_near_ranges() {
        let entries = [entry(0, 0, 10, None), entry(0, 12, 20, None)];
        let strict = merge_spans(entries.iter(), 0);
        assert_eq!(strict.len(), 2);
        let relaxed = merge_spans(entries.iter(), 2);
        assert_eq!(relaxed, vec![(0, 0, 20)]);
    }

    #[test]
    fn empty_ranges_never_survive_merge() {
        let entries = [entry(0, 5, 5, None)];
        assert!(merge_spans(entries.iter(), 10).is_empty());
    }

    #[test]
    fn checksum_normalizes_to_nfc() {
        // "é" precomposed vs decomposed must hash identically.
        let precomposed = "caf\u{00e9}";
        let decomposed = "cafe\u{0301}";
        assert_eq!(span_checksum(precomposed), span_checksum(decomposed));
        assert!(span_checksum("Hello").starts_with("sha256:"));
    }

    #[test]
    fn context_filter_keeps_discovery_order_and_exact_tags() {
        let mut accumulator = SpanAccumulator::new();
        accumulator.record_turn(
            0,
            &[
                entry(0, 0, 5, Some("context")),
                entry(0, 5, 9, Some("scan")),
                entry(1, 2, 8, Some("context:quote")),
            ],
        );
        accumulator.record_turn(1, &[entry(0, 9, 12, Some("contextual"))]);
        accumulator.record_turn(2, &[entry(2, 0, 4, Some("context"))]);

        let contexts = accumulator.context_spans();
        assert_eq!(
            contexts,
            vec![
                entry(0, 0, 5, Some("context")),
                entry(1, 2, 8, Some("context:quote")),
                entry(2, 0, 4, Some("context")),
            ]
        );
    }
}
