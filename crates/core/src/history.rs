use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::capability::{HistorySource, PageRequest};
use crate::error::SyncError;
use crate::ids::{ConversationId, PageTicket};
use crate::message::{HistoryPage, HistoryResponse, Message};

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Requested(PageTicket),
    /// One page is already in flight; pages are never fetched in parallel.
    InFlight,
    AlreadyLoaded,
    NothingMore,
    NoConversation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Result for a superseded request or a conversation no longer being viewed.
    Stale,
    Applied { page: HistoryPage, inserted: usize },
    Failed(SyncError),
}

/// Paginated history for the conversation being viewed, kept strictly chronological.
pub struct HistorySynchronizer {
    source: Arc<dyn HistorySource>,
    limit: usize,
    conversation: Option<ConversationId>,
    history: Vec<Message>,
    next_offset: usize,
    has_more: bool,
    loaded: bool,
    in_flight: Option<PageRequest>,
    loaded_offsets: BTreeSet<usize>,
    next_ticket: u64,
}

impl HistorySynchronizer {
    pub fn new(limit: usize, source: Arc<dyn HistorySource>) -> Self {
        Self {
            source,
            limit: limit.max(1),
            conversation: None,
            history: Vec::new(),
            next_offset: 0,
            has_more: false,
            loaded: false,
            in_flight: None,
            loaded_offsets: BTreeSet::new(),
            next_ticket: 1,
        }
    }

    pub fn conversation(&self) -> Option<ConversationId> {
        self.conversation
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn next_offset(&self) -> usize {
        self.next_offset
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    /// True once page 0 has been applied for the current conversation.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Resets to an empty history for `conversation` and requests page 0.
    ///
    /// Any in-flight request is superseded; its result will be discarded when it lands.
    pub fn switch_conversation(&mut self, conversation: ConversationId) -> LoadOutcome {
        if let Some(superseded) = self.in_flight.take() {
            tracing::debug!(
                ticket = %superseded.ticket,
                conversation = %superseded.conversation,
                "superseding in-flight history request"
            );
        }

        self.conversation = Some(conversation);
        self.history.clear();
        self.next_offset = 0;
        self.has_more = false;
        self.loaded = false;
        self.loaded_offsets.clear();
        self.load_page(0)
    }

    /// Requests `limit` messages at `offset`. Offset 0 may be re-fetched and replaces.
    pub fn load_page(&mut self, offset: usize) -> LoadOutcome {
        let Some(conversation) = self.conversation else {
            return LoadOutcome::NoConversation;
        };

        if self.in_flight.is_some() {
            tracing::debug!(conversation = %conversation, offset, "history page already in flight");
            return LoadOutcome::InFlight;
        }

        if offset != 0 && self.loaded_offsets.contains(&offset) {
            return LoadOutcome::AlreadyLoaded;
        }

        let ticket = PageTicket::new(self.next_ticket);
        self.next_ticket = self.next_ticket.saturating_add(1);

        let request = PageRequest {
            ticket,
            conversation,
            offset,
            limit: self.limit,
        };
        self.in_flight = Some(request);
        tracing::debug!(conversation = %conversation, offset, ticket = %ticket, "requesting history page");
        self.source.fetch(request);
        LoadOutcome::Requested(ticket)
    }

    /// Requests the next older page when the server said there is one.
    pub fn load_older(&mut self) -> LoadOutcome {
        if self.conversation.is_none() {
            return LoadOutcome::NoConversation;
        }

        if !self.has_more {
            return LoadOutcome::NothingMore;
        }

        self.load_page(self.next_offset)
    }

    pub fn reload(&mut self) -> LoadOutcome {
        self.load_page(0)
    }

    /// Forgets the conversation entirely; a late result for it is discarded.
    pub fn clear(&mut self) {
        self.conversation = None;
        self.history.clear();
        self.next_offset = 0;
        self.has_more = false;
        self.loaded = false;
        self.in_flight = None;
        self.loaded_offsets.clear();
    }

    /// Applies a page result if it still belongs to the current request and conversation.
    pub fn apply(
        &mut self,
        ticket: PageTicket,
        result: Result<HistoryResponse, String>,
    ) -> ApplyOutcome {
        let Some(request) = self.in_flight.filter(|request| request.ticket == ticket) else {
            tracing::debug!(ticket = %ticket, "discarding history result for a superseded request");
            return ApplyOutcome::Stale;
        };

        if self.conversation != Some(request.conversation) {
            self.in_flight = None;
            tracing::debug!(
                ticket = %ticket,
                conversation = %request.conversation,
                "discarding history result for another conversation"
            );
            return ApplyOutcome::Stale;
        }

        self.in_flight = None;

        let response = match result {
            Ok(response) => response,
            Err(details) => {
                tracing::warn!(
                    conversation = %request.conversation,
                    offset = request.offset,
                    error = %details,
                    "history page failed"
                );
                return ApplyOutcome::Failed(SyncError::HistoryFetchFailed {
                    stage: "apply-history-page",
                    conversation: request.conversation,
                    offset: request.offset,
                    details,
                });
            }
        };

        let received = response.messages.len();
        let mut incoming = response.messages;
        // The endpoint's ordering is not guaranteed; stable sort keeps same-instant rows in order.
        incoming.sort_by_key(|message| message.timestamp);

        let inserted = if request.offset == 0 {
            self.history = incoming;
            self.loaded_offsets.clear();
            self.loaded = true;
            self.history.len()
        } else {
            let existing = self.history.iter().collect::<HashSet<_>>();
            incoming.retain(|message| !existing.contains(message));
            drop(existing);

            let inserted = incoming.len();
            incoming.append(&mut self.history);
            self.history = incoming;
            inserted
        };

        self.loaded_offsets.insert(request.offset);
        self.next_offset = request.offset + received;
        self.has_more = response.has_more;

        tracing::debug!(
            conversation = %request.conversation,
            offset = request.offset,
            received,
            inserted,
            has_more = self.has_more,
            "history page applied"
        );

        ApplyOutcome::Applied {
            page: HistoryPage {
                offset: request.offset,
                limit: request.limit,
                has_more: self.has_more,
            },
            inserted,
        }
    }
}
