// Event-log compaction
//
// Raw events are never rewritten. A compaction is an ordinary appended
// event whose actions carry an `EventCompaction` marker: a closed
// timestamp range plus summary text standing in for the raw events
// inside it. Readers resolve overlap at view time: a compaction fully
// contained in another (later one wins on identical ranges) is
// subsumed and ignored.
//
// Two mutually exclusive triggers decide when to compact. The
// token-threshold trigger fires when the estimated prompt size crosses
// a limit and keeps the newest raw events un-compacted; the
// sliding-window trigger fires every N completed invocations and
// overlaps the previous range by a configured number of invocations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::Result;
use crate::event::{Event, Part};
use crate::session::Session;

/// Produces the compaction event for a slice of raw events, or `None`
/// to skip compaction this round (e.g. nothing worth summarizing).
///
/// The returned event must carry `actions.compaction` with
/// `start_ts`/`end_ts` spanning the summarized slice.
#[async_trait]
pub trait EventSummarizer: Send + Sync {
    async fn maybe_summarize_events(&self, events: &[Event]) -> Result<Option<Event>>;
}

/// When and how much to compact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionTrigger {
    /// Compact once the estimated prompt token count reaches
    /// `token_threshold`, keeping the newest `event_retention_size` raw
    /// events un-compacted.
    TokenThreshold {
        token_threshold: u64,
        event_retention_size: usize,
    },
    /// Compact every `compaction_interval` completed invocations,
    /// starting the new range `overlap_size` invocations before the
    /// first new one.
    SlidingWindow {
        compaction_interval: usize,
        overlap_size: usize,
    },
}

pub struct CompactionEngine {
    trigger: CompactionTrigger,
    summarizer: Arc<dyn EventSummarizer>,
}

impl CompactionEngine {
    pub fn new(trigger: CompactionTrigger, summarizer: Arc<dyn EventSummarizer>) -> Self {
        Self {
            trigger,
            summarizer,
        }
    }

    /// Checks the trigger against the session's event log and returns
    /// the compaction event to append, or `None` when the trigger did
    /// not fire. Run after an invocation's events have all been
    /// appended.
    pub async fn maybe_compact(&self, session: &Session) -> Result<Option<Event>> {
        if session.events.is_empty() {
            return Ok(None);
        }
        match self.trigger {
            CompactionTrigger::TokenThreshold {
                token_threshold,
                event_retention_size,
            } => {
                self.compact_by_token_threshold(session, token_threshold, event_retention_size)
                    .await
            }
            CompactionTrigger::SlidingWindow {
                compaction_interval,
                overlap_size,
            } => {
                self.compact_by_sliding_window(session, compaction_interval, overlap_size)
                    .await
            }
        }
    }

    async fn compact_by_token_threshold(
        &self,
        session: &Session,
        token_threshold: u64,
        event_retention_size: usize,
    ) -> Result<Option<Event>> {
        let events = &session.events;
        let Some(prompt_tokens) = latest_prompt_token_count(events) else {
            return Ok(None);
        };
        if prompt_tokens < token_threshold {
            return Ok(None);
        }

        let latest = latest_compaction_event(events);
        let last_compacted_end = latest.and_then(|e| e.actions.compaction.as_ref().map(|c| c.end_ts));

        let candidates: Vec<&Event> = events
            .iter()
            .filter(|e| !e.is_compaction())
            .filter(|e| last_compacted_end.map(|end| e.timestamp > end).unwrap_or(true))
            .collect();
        if candidates.len() <= event_retention_size {
            return Ok(None);
        }

        let keep = candidates.len() - event_retention_size;
        let mut to_compact: Vec<Event> =
            candidates[..keep].iter().map(|e| (*e).clone()).collect();
        if to_compact.is_empty() {
            return Ok(None);
        }

        // Rolling summary: seed with the previous summary text, placed
        // at the previous range's start so the new range subsumes it
        // while the retained raw events stay visible.
        if let Some(prior) = latest.and_then(|e| e.actions.compaction.as_ref().map(|c| (c, e))) {
            let (compaction, carrier) = prior;
            let mut seed = Event::new(Event::new_id(), "model");
            seed.timestamp = compaction.start_ts;
            seed.branch = carrier.branch.clone();
            seed.content.push(Part::Text {
                text: compaction.compacted_content.clone(),
            });
            to_compact.insert(0, seed);
        }

        let compacted = self.summarizer.maybe_summarize_events(&to_compact).await?;
        if compacted.is_some() {
            debug!(prompt_tokens, "token-threshold compaction produced a summary");
        }
        Ok(compacted)
    }

    async fn compact_by_sliding_window(
        &self,
        session: &Session,
        compaction_interval: usize,
        overlap_size: usize,
    ) -> Result<Option<Event>> {
        let events = &session.events;
        let last_compacted_end = events
            .iter()
            .rev()
            .find_map(|e| e.actions.compaction.as_ref().map(|c| c.end_ts));

        // Unique invocation ids in first-seen order, each with the
        // latest timestamp among its events. Compaction markers do not
        // count as invocations.
        let mut order: Vec<&str> = Vec::new();
        let mut latest_ts: HashMap<&str, DateTime<Utc>> = HashMap::new();
        for event in events {
            if event.is_compaction() || event.invocation_id.is_empty() {
                continue;
            }
            match latest_ts.get_mut(event.invocation_id.as_str()) {
                Some(ts) => {
                    if event.timestamp > *ts {
                        *ts = event.timestamp;
                    }
                }
                None => {
                    order.push(&event.invocation_id);
                    latest_ts.insert(&event.invocation_id, event.timestamp);
                }
            }
        }

        let new_invocations: Vec<&str> = order
            .iter()
            .copied()
            .filter(|id| {
                last_compacted_end
                    .map(|end| latest_ts[id] > end)
                    .unwrap_or(true)
            })
            .collect();
        if new_invocations.len() < compaction_interval {
            return Ok(None);
        }

        let end_inv = *new_invocations.last().expect("non-empty");
        let first_new_idx = order
            .iter()
            .position(|id| *id == new_invocations[0])
            .expect("present");
        let start_inv = order[first_new_idx.saturating_sub(overlap_size)];

        let Some(last_idx) = events.iter().rposition(|e| e.invocation_id == end_inv) else {
            return Ok(None);
        };
        let Some(first_idx) = events.iter().position(|e| e.invocation_id == start_inv) else {
            return Ok(None);
        };

        let to_compact: Vec<Event> = events[first_idx..=last_idx]
            .iter()
            .filter(|e| !e.is_compaction())
            .cloned()
            .collect();
        if to_compact.is_empty() {
            return Ok(None);
        }

        let compacted = self.summarizer.maybe_summarize_events(&to_compact).await?;
        if compacted.is_some() {
            debug!(
                start_invocation = start_inv,
                end_invocation = end_inv,
                "sliding-window compaction produced a summary"
            );
        }
        Ok(compacted)
    }
}

/// The compaction events not fully contained in another compaction's
/// range. On identical ranges, the later appended event wins.
fn effective_compactions(events: &[Event]) -> Vec<(usize, &Event)> {
    let all: Vec<(usize, &Event)> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.actions.compaction.is_some())
        .collect();

    all.iter()
        .copied()
        .filter(|(index, event)| {
            let compaction = event.actions.compaction.as_ref().expect("filtered");
            !all.iter().any(|(other_index, other)| {
                if other_index == index {
                    return false;
                }
                let other = other.actions.compaction.as_ref().expect("filtered");
                other.start_ts <= compaction.start_ts
                    && other.end_ts >= compaction.end_ts
                    && (other.start_ts < compaction.start_ts
                        || other.end_ts > compaction.end_ts
                        || *other_index > *index)
            })
        })
        .collect()
}

/// Synthetic event standing in for a compacted range, placed at the
/// range's end.
fn summary_event(carrier: &Event) -> Event {
    let compaction = carrier.actions.compaction.as_ref().expect("compaction marker");
    let mut event = Event::new(carrier.invocation_id.clone(), "model");
    event.timestamp = compaction.end_ts;
    event.branch = carrier.branch.clone();
    event.content.push(Part::Text {
        text: compaction.compacted_content.clone(),
    });
    event
}

/// Builds the model-visible view of an event log: every effective
/// compaction contributes its summary once at the end of its range, raw
/// events inside an effective range are dropped, everything else passes
/// through in timestamp order.
pub fn build_context(events: &[Event]) -> Vec<Event> {
    let effective = effective_compactions(events);
    let ranges: Vec<(DateTime<Utc>, DateTime<Utc>)> = effective
        .iter()
        .map(|(_, e)| {
            let c = e.actions.compaction.as_ref().expect("filtered");
            (c.start_ts, c.end_ts)
        })
        .collect();
    let covered =
        |ts: DateTime<Utc>| ranges.iter().any(|(start, end)| *start <= ts && ts <= *end);

    let mut view: Vec<Event> = effective.iter().map(|(_, e)| summary_event(e)).collect();
    view.extend(
        events
            .iter()
            .filter(|e| !e.is_compaction() && !covered(e.timestamp))
            .cloned(),
    );
    view.sort_by_key(|e| e.timestamp);
    view
}

/// The most recently observed prompt token count, falling back to a
/// compaction-aware size estimate when no event carries usage metadata.
fn latest_prompt_token_count(events: &[Event]) -> Option<u64> {
    for event in events.iter().rev() {
        if let Some(tokens) = event.usage.as_ref().and_then(|u| u.prompt_tokens) {
            return Some(tokens);
        }
    }
    estimate_prompt_token_count(events)
}

/// Approximates the prompt token count from text size, counting summary
/// text for effective compactions and only the raw events still visible
/// after applying their ranges. Roughly 4 characters per token.
fn estimate_prompt_token_count(events: &[Event]) -> Option<u64> {
    let total_chars: usize = build_context(events).iter().map(|e| e.text_len()).sum();
    if total_chars == 0 {
        return None;
    }
    Some((total_chars / 4) as u64)
}

/// The compaction event with the greatest covered end timestamp.
fn latest_compaction_event(events: &[Event]) -> Option<&Event> {
    events
        .iter()
        .filter(|e| e.actions.compaction.is_some())
        .max_by_key(|e| e.actions.compaction.as_ref().expect("filtered").end_ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::EventCompaction;
    use crate::event::UsageMetadata;
    use chrono::TimeZone;
    use tokio::sync::Mutex;

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn raw_event(seconds: i64, invocation_id: &str, text: &str) -> Event {
        let mut event = Event::new(invocation_id, "model");
        event.timestamp = ts(seconds);
        event.content.push(Part::Text {
            text: text.to_string(),
        });
        event
    }

    fn compaction_event(start: i64, end: i64, summary: &str) -> Event {
        let mut event = Event::new(Event::new_id(), "model");
        event.timestamp = ts(end);
        event.actions.compaction = Some(EventCompaction {
            start_ts: ts(start),
            end_ts: ts(end),
            compacted_content: summary.to_string(),
        });
        event
    }

    fn session_with(events: Vec<Event>) -> Session {
        let mut session = Session::new("app", "user1", "s1");
        session.events = events;
        session
    }

    /// Records the slice it was asked to summarize and emits a marker
    /// spanning it.
    #[derive(Default)]
    struct RecordingSummarizer {
        seen: Mutex<Vec<Vec<Event>>>,
    }

    #[async_trait]
    impl EventSummarizer for RecordingSummarizer {
        async fn maybe_summarize_events(&self, events: &[Event]) -> Result<Option<Event>> {
            self.seen.lock().await.push(events.to_vec());
            let summary = events
                .iter()
                .flat_map(|e| {
                    e.content.iter().filter_map(|p| match p {
                        Part::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                })
                .collect::<Vec<_>>()
                .join(" | ");
            let mut event = Event::new(Event::new_id(), "model");
            event.actions.compaction = Some(EventCompaction {
                start_ts: events.first().expect("non-empty").timestamp,
                end_ts: events.last().expect("non-empty").timestamp,
                compacted_content: summary,
            });
            Ok(Some(event))
        }
    }

    #[tokio::test]
    async fn test_sliding_window_not_enough_new_invocations() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let engine = CompactionEngine::new(
            CompactionTrigger::SlidingWindow {
                compaction_interval: 2,
                overlap_size: 1,
            },
            summarizer.clone(),
        );
        let session = session_with(vec![raw_event(1, "inv1", "Event 1")]);

        assert!(engine.maybe_compact(&session).await.unwrap().is_none());
        assert!(summarizer.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_sliding_window_first_compaction_starts_at_beginning() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let engine = CompactionEngine::new(
            CompactionTrigger::SlidingWindow {
                compaction_interval: 2,
                overlap_size: 1,
            },
            summarizer.clone(),
        );
        let session = session_with(vec![
            raw_event(1, "inv1", "E1"),
            raw_event(2, "inv1", "E1b"),
            raw_event(3, "inv2", "E2"),
            raw_event(4, "inv2", "E2b"),
        ]);

        let compacted = engine.maybe_compact(&session).await.unwrap().unwrap();
        let marker = compacted.actions.compaction.unwrap();
        assert_eq!(marker.start_ts, ts(1));
        assert_eq!(marker.end_ts, ts(4));

        let seen = summarizer.seen.lock().await;
        assert_eq!(seen[0].len(), 4);
    }

    #[tokio::test]
    async fn test_sliding_window_overlaps_previous_range() {
        // Interval 2, overlap 1: after [1,2] is compacted, invocations
        // 3 and 4 trigger the next round covering [2,4].
        let summarizer = Arc::new(RecordingSummarizer::default());
        let engine = CompactionEngine::new(
            CompactionTrigger::SlidingWindow {
                compaction_interval: 2,
                overlap_size: 1,
            },
            summarizer.clone(),
        );
        let session = session_with(vec![
            raw_event(1, "inv1", "E1"),
            raw_event(2, "inv2", "E2"),
            compaction_event(1, 2, "Summary 1-2"),
            raw_event(3, "inv3", "E3"),
            raw_event(4, "inv4", "E4"),
        ]);

        let compacted = engine.maybe_compact(&session).await.unwrap().unwrap();
        let marker = compacted.actions.compaction.unwrap();
        assert_eq!(marker.start_ts, ts(2));
        assert_eq!(marker.end_ts, ts(4));

        // The prior compaction marker itself is excluded from the slice.
        let seen = summarizer.seen.lock().await;
        let texts: Vec<String> = seen[0].iter().map(|e| {
            match &e.content[0] {
                Part::Text { text } => text.clone(),
                _ => panic!("expected text"),
            }
        }).collect();
        assert_eq!(texts, vec!["E2", "E3", "E4"]);
    }

    #[tokio::test]
    async fn test_token_threshold_keeps_retention_events() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let engine = CompactionEngine::new(
            CompactionTrigger::TokenThreshold {
                token_threshold: 10,
                event_retention_size: 2,
            },
            summarizer.clone(),
        );
        let mut events: Vec<Event> = (1..=5)
            .map(|i| raw_event(i, &format!("inv{i}"), &format!("Event {i}")))
            .collect();
        events[4].usage = Some(UsageMetadata {
            prompt_tokens: Some(100),
            completion_tokens: None,
            total_tokens: None,
        });
        let session = session_with(events);

        let compacted = engine.maybe_compact(&session).await.unwrap().unwrap();
        let marker = compacted.actions.compaction.unwrap();
        assert_eq!(marker.start_ts, ts(1));
        assert_eq!(marker.end_ts, ts(3));

        // The newest two raw events stay un-compacted.
        let seen = summarizer.seen.lock().await;
        assert_eq!(seen[0].len(), 3);
    }

    #[tokio::test]
    async fn test_token_threshold_below_threshold_is_a_no_op() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let engine = CompactionEngine::new(
            CompactionTrigger::TokenThreshold {
                token_threshold: 1000,
                event_retention_size: 2,
            },
            summarizer.clone(),
        );
        let mut event = raw_event(1, "inv1", "short");
        event.usage = Some(UsageMetadata {
            prompt_tokens: Some(5),
            completion_tokens: None,
            total_tokens: None,
        });
        let session = session_with(vec![event]);

        assert!(engine.maybe_compact(&session).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_token_threshold_seeds_previous_summary() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let engine = CompactionEngine::new(
            CompactionTrigger::TokenThreshold {
                token_threshold: 10,
                event_retention_size: 1,
            },
            summarizer.clone(),
        );
        let mut newer: Vec<Event> = (4..=6)
            .map(|i| raw_event(i, &format!("inv{i}"), &format!("Event {i}")))
            .collect();
        newer[2].usage = Some(UsageMetadata {
            prompt_tokens: Some(50),
            completion_tokens: None,
            total_tokens: None,
        });
        let mut events = vec![
            raw_event(1, "inv1", "Event 1"),
            raw_event(2, "inv2", "Event 2"),
            compaction_event(1, 2, "Old summary"),
        ];
        events.extend(newer);
        let session = session_with(events);

        let compacted = engine.maybe_compact(&session).await.unwrap().unwrap();
        let marker = compacted.actions.compaction.unwrap();
        // The seed sits at the previous range's start, so the new range
        // subsumes the old one.
        assert_eq!(marker.start_ts, ts(1));
        assert_eq!(marker.end_ts, ts(5));

        let seen = summarizer.seen.lock().await;
        let Part::Text { text } = &seen[0][0].content[0] else {
            panic!("expected text seed");
        };
        assert_eq!(text, "Old summary");
        assert_eq!(seen[0][0].timestamp, ts(1));
    }

    #[tokio::test]
    async fn test_token_threshold_zero_retention_compacts_everything() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let engine = CompactionEngine::new(
            CompactionTrigger::TokenThreshold {
                token_threshold: 1,
                event_retention_size: 0,
            },
            summarizer.clone(),
        );
        let session = session_with(vec![
            raw_event(1, "inv1", "Event one"),
            raw_event(2, "inv2", "Event two"),
        ]);

        let compacted = engine.maybe_compact(&session).await.unwrap().unwrap();
        let marker = compacted.actions.compaction.unwrap();
        assert_eq!(marker.start_ts, ts(1));
        assert_eq!(marker.end_ts, ts(2));
        assert_eq!(summarizer.seen.lock().await[0].len(), 2);
    }

    #[test]
    fn test_estimate_applies_compaction_before_counting() {
        // Without a compaction the estimate counts all raw text; with
        // one, only the summary plus uncovered events.
        let raw = vec![
            raw_event(1, "inv1", "aaaaaaaa"),
            raw_event(2, "inv2", "bbbbbbbb"),
            raw_event(3, "inv3", "cccc"),
        ];
        assert_eq!(latest_prompt_token_count(&raw), Some(5));

        let mut with_compaction = raw.clone();
        with_compaction.push(compaction_event(1, 2, "S"));
        // "S" (1 char) + "cccc" (4 chars) = 5 chars -> 1 token.
        assert_eq!(latest_prompt_token_count(&with_compaction), Some(1));
    }

    #[test]
    fn test_build_context_with_multiple_compactions() {
        let events = vec![
            raw_event(1, "inv1", "Event 1"),
            raw_event(2, "inv2", "Event 2"),
            raw_event(3, "inv3", "Event 3"),
            raw_event(4, "inv4", "Event 4"),
            compaction_event(1, 4, "Summary 1-4"),
            raw_event(5, "inv5", "Event 5"),
            raw_event(6, "inv6", "Event 6"),
            raw_event(7, "inv7", "Event 7"),
            raw_event(8, "inv8", "Event 8"),
            raw_event(9, "inv9", "Event 9"),
            compaction_event(6, 9, "Summary 6-9"),
            raw_event(10, "inv10", "Event 10"),
        ];

        let texts = context_texts(&events);
        assert_eq!(texts, vec!["Summary 1-4", "Event 5", "Summary 6-9", "Event 10"]);
    }

    #[test]
    fn test_build_context_hides_subsumed_compaction() {
        let events = vec![
            raw_event(1, "inv1", "Event 1"),
            raw_event(2, "inv2", "Event 2"),
            raw_event(3, "inv3", "Event 3"),
            raw_event(4, "inv4", "Event 4"),
            compaction_event(1, 1, "Summary 1"),
            raw_event(6, "inv6", "Event 6"),
            raw_event(7, "inv7", "Event 7"),
            compaction_event(1, 3, "Summary 1-3"),
            raw_event(9, "inv9", "Event 9"),
        ];

        let texts = context_texts(&events);
        assert_eq!(
            texts,
            vec!["Summary 1-3", "Event 4", "Event 6", "Event 7", "Event 9"]
        );
    }

    #[test]
    fn test_build_context_late_compaction_keeps_newer_events() {
        let events = vec![
            raw_event(1, "inv1", "Event 1"),
            raw_event(2, "inv2", "Event 2"),
            raw_event(3, "inv3", "Event 3"),
            raw_event(4, "inv4", "Event 4"),
            raw_event(5, "inv5", "Event 5"),
            compaction_event(1, 3, "Summary 1-3"),
        ];

        let texts = context_texts(&events);
        assert_eq!(texts, vec!["Summary 1-3", "Event 4", "Event 5"]);
    }

    #[test]
    fn test_build_context_without_compaction_passes_through() {
        let events = vec![
            raw_event(1, "inv1", "Event 1"),
            raw_event(2, "inv2", "Event 2"),
        ];
        assert_eq!(context_texts(&events), vec!["Event 1", "Event 2"]);
    }

    #[test]
    fn test_build_context_identical_ranges_later_wins() {
        let events = vec![
            raw_event(1, "inv1", "Event 1"),
            raw_event(2, "inv2", "Event 2"),
            compaction_event(1, 2, "First summary"),
            compaction_event(1, 2, "Second summary"),
            raw_event(3, "inv3", "Event 3"),
        ];
        assert_eq!(context_texts(&events), vec!["Second summary", "Event 3"]);
    }

    fn context_texts(events: &[Event]) -> Vec<String> {
        build_context(events)
            .iter()
            .map(|e| match &e.content[0] {
                Part::Text { text } => text.clone(),
                _ => panic!("expected text part"),
            })
            .collect()
    }
}
