//! Cursor pagination state shared by the conversation and message lists.
//!
//! Replies on one connection arrive in the order their requests were sent,
//! so each reply answers the oldest request still in flight. A newer
//! initial request supersedes every request sent before it; replies to
//! superseded requests are dropped without touching the list.

use std::collections::VecDeque;

use deskline_proto::event::Cursor;

/// What a page request asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    /// First page; its reply replaces the list.
    Initial,
    /// Follow-up page from `cursor`; its reply is merged.
    Next(Cursor),
}

#[derive(Debug, Clone)]
struct InFlight {
    request: PageRequest,
    superseded: bool,
}

/// Cursor, has-more flag and in-flight requests of one paged list.
#[derive(Debug, Clone, Default)]
pub struct Pager {
    in_flight: VecDeque<InFlight>,
    next_cursor: Option<Cursor>,
    has_more: bool,
}

impl Pager {
    /// Start a fresh first-page request, discarding any cursor.
    ///
    /// Always succeeds. Requests already in flight are superseded.
    pub fn begin_initial(&mut self) {
        self.supersede();
        self.in_flight.push_back(InFlight {
            request: PageRequest::Initial,
            superseded: false,
        });
    }

    /// Start a follow-up request, returning the cursor to send.
    ///
    /// Returns `None` (and changes nothing) while a live request is in
    /// flight or when there is nothing more to load.
    pub fn begin_next(&mut self) -> Option<Cursor> {
        if self.is_loading() || !self.has_more {
            return None;
        }
        let cursor = self.next_cursor.clone()?;
        self.in_flight.push_back(InFlight {
            request: PageRequest::Next(cursor.clone()),
            superseded: false,
        });
        Some(cursor)
    }

    /// Record a reply and return the request it answers.
    ///
    /// Returns `None` when the reply answers a superseded request; the
    /// caller must drop it. A reply that arrives with nothing in flight is
    /// treated as an initial page.
    pub fn finish(&mut self, next_cursor: Option<Cursor>, has_more: bool) -> Option<PageRequest> {
        let request = match self.in_flight.pop_front() {
            Some(InFlight {
                superseded: true,
                request,
            }) => {
                tracing::debug!(?request, "dropping reply to superseded page request");
                return None;
            }
            Some(InFlight { request, .. }) => request,
            None => PageRequest::Initial,
        };
        self.next_cursor = next_cursor;
        self.has_more = has_more;
        Some(request)
    }

    /// Consume a reply that belongs to another list, if the oldest request
    /// in flight was superseded. Returns whether one was consumed.
    pub fn skip_superseded(&mut self) -> bool {
        if self.in_flight.front().is_some_and(|f| f.superseded) {
            self.in_flight.pop_front();
            return true;
        }
        false
    }

    /// Supersede every request in flight and forget the cursor.
    pub fn reset(&mut self) {
        self.supersede();
    }

    /// Forget every request in flight. Used after a reconnect, when replies
    /// to requests sent on the old transport will never arrive.
    pub fn forget_in_flight(&mut self) {
        self.in_flight.clear();
    }

    fn supersede(&mut self) {
        for flight in &mut self.in_flight {
            flight.superseded = true;
        }
        self.next_cursor = None;
        self.has_more = false;
    }

    /// Whether a request that still matters is in flight.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.in_flight.iter().any(|f| !f.superseded)
    }

    /// Whether the server reported more pages.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.has_more
    }
}
