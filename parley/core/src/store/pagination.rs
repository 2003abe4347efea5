//! Pagination
//!
//! Per-conversation page cursors and fetch spacing.
//!
//! Older pages are requested with a geometrically growing limit so long
//! histories need fewer round-trips. Because the limit changes from one
//! request to the next, the next page number is derived from how many
//! messages are already held rather than from the previous page number:
//! `page = loaded / next_limit + 1`. Pages may overlap; the store's id-unique
//! merge absorbs the overlap and no message can be skipped.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::conversation::ConversationId;
use crate::transport::{PageRequest, Pagination};

/// Pagination settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaginationConfig {
    /// Page size of the first page
    pub initial_limit: u32,
    /// Page size multiplier per older page
    pub growth_factor: u32,
    /// Largest page size requested
    pub max_limit: u32,
    /// Minimum spacing between two fetches of one conversation
    pub min_fetch_spacing: Duration,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            initial_limit: 20,
            growth_factor: 2,
            max_limit: 100,
            min_fetch_spacing: Duration::from_millis(500),
        }
    }
}

/// Where a conversation's history loading stands
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageCursor {
    /// Conversation this cursor tracks
    pub conversation_id: ConversationId,
    /// Last page loaded (0 = nothing loaded yet)
    pub page: u32,
    /// Limit used for the last load
    pub limit: u32,
    /// Whether older messages remain on the server
    pub has_more: bool,
    /// When the last page arrived
    pub last_load_time: Option<Instant>,
}

impl PageCursor {
    fn new(conversation_id: ConversationId, initial_limit: u32) -> Self {
        Self {
            conversation_id,
            page: 0,
            limit: initial_limit,
            has_more: true,
            last_load_time: None,
        }
    }
}

/// Cursor bookkeeping for every conversation
#[derive(Debug)]
pub struct PaginationManager {
    config: PaginationConfig,
    cursors: DashMap<ConversationId, PageCursor>,
    /// Earliest start time of the next fetch, per conversation
    next_fetch_slot: DashMap<ConversationId, Instant>,
}

impl PaginationManager {
    /// Create a manager
    #[must_use]
    pub fn new(config: PaginationConfig) -> Self {
        Self {
            config,
            cursors: DashMap::new(),
            next_fetch_slot: DashMap::new(),
        }
    }

    /// Settings in use
    #[must_use]
    pub fn config(&self) -> &PaginationConfig {
        &self.config
    }

    /// Current cursor (a fresh one if nothing was loaded yet)
    #[must_use]
    pub fn cursor(&self, id: &ConversationId) -> PageCursor {
        self.cursors
            .get(id)
            .map(|c| c.value().clone())
            .unwrap_or_else(|| PageCursor::new(id.clone(), self.config.initial_limit))
    }

    /// Whether older pages remain
    #[must_use]
    pub fn has_more(&self, id: &ConversationId) -> bool {
        self.cursors.get(id).map_or(true, |c| c.has_more)
    }

    /// Limit for the page after one loaded with `limit`
    #[must_use]
    pub fn grow_limit(&self, limit: u32) -> u32 {
        limit
            .saturating_mul(self.config.growth_factor)
            .clamp(1, self.config.max_limit.max(1))
    }

    /// Request for the next older page, or `None` once history is exhausted
    #[must_use]
    pub fn next_request(&self, id: &ConversationId, loaded: usize) -> Option<PageRequest> {
        let cursor = self.cursor(id);
        if !cursor.has_more {
            return None;
        }
        if cursor.page == 0 || loaded == 0 {
            return Some(PageRequest::new(1, self.config.initial_limit.max(1)));
        }

        let limit = self.grow_limit(cursor.limit);
        let loaded = u32::try_from(loaded).unwrap_or(u32::MAX);
        Some(PageRequest::new(loaded / limit + 1, limit))
    }

    /// Record a loaded page and derive `has_more`
    ///
    /// Server pagination wins when present; otherwise a full page means
    /// there may be more. Once `has_more` is false it stays false until
    /// [`reset`](Self::reset), whatever later pages report.
    pub fn record_page(
        &self,
        id: &ConversationId,
        request: PageRequest,
        returned: usize,
        pagination: Option<Pagination>,
    ) -> PageCursor {
        let has_more = match pagination {
            Some(Pagination {
                pages: Some(pages), ..
            }) => request.page < pages,
            Some(Pagination {
                total: Some(total), ..
            }) => u64::from(request.page) * u64::from(request.limit) < u64::from(total),
            _ => returned >= request.limit as usize,
        };

        let mut cursor = self
            .cursors
            .entry(id.clone())
            .or_insert_with(|| PageCursor::new(id.clone(), self.config.initial_limit));
        cursor.page = request.page;
        cursor.limit = request.limit;
        cursor.has_more = cursor.has_more && has_more;
        cursor.last_load_time = Some(Instant::now());

        if !has_more {
            tracing::debug!(conversation_id = %id, page = request.page, "Reached start of history");
        }
        cursor.value().clone()
    }

    /// Re-enable pagination for a conversation
    pub fn reset(&self, id: &ConversationId) {
        self.cursors.remove(id);
    }

    /// Forget everything about a conversation
    pub fn remove(&self, id: &ConversationId) {
        self.cursors.remove(id);
        self.next_fetch_slot.remove(id);
    }

    /// Claim the next fetch slot for `id`, returning how long to wait
    ///
    /// Slots are spaced by `min_fetch_spacing`; concurrent callers each get
    /// their own slot.
    pub fn reserve_fetch_slot(&self, id: &ConversationId) -> Duration {
        let now = Instant::now();
        let mut slot = self.next_fetch_slot.entry(id.clone()).or_insert(now);
        let start = (*slot).max(now);
        *slot = start + self.config.min_fetch_spacing;
        start - now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id() -> ConversationId {
        ConversationId::new("c1")
    }

    #[test]
    fn test_first_request_uses_initial_limit() {
        let pager = PaginationManager::new(PaginationConfig::default());
        assert_eq!(pager.next_request(&id(), 0), Some(PageRequest::new(1, 20)));
    }

    #[test]
    fn test_limit_grows_and_caps() {
        let pager = PaginationManager::new(PaginationConfig::default());
        assert_eq!(pager.grow_limit(20), 40);
        assert_eq!(pager.grow_limit(40), 80);
        assert_eq!(pager.grow_limit(80), 100);
        assert_eq!(pager.grow_limit(100), 100);
    }

    #[test]
    fn test_next_page_derived_from_loaded_count() {
        let pager = PaginationManager::new(PaginationConfig::default());
        pager.record_page(&id(), PageRequest::new(1, 20), 20, None);
        assert_eq!(pager.next_request(&id(), 20), Some(PageRequest::new(1, 40)));

        pager.record_page(&id(), PageRequest::new(1, 40), 40, None);
        assert_eq!(pager.next_request(&id(), 40), Some(PageRequest::new(1, 80)));

        pager.record_page(&id(), PageRequest::new(1, 80), 80, None);
        assert_eq!(pager.next_request(&id(), 80), Some(PageRequest::new(1, 100)));

        pager.record_page(&id(), PageRequest::new(1, 100), 100, None);
        assert_eq!(pager.next_request(&id(), 100), Some(PageRequest::new(2, 100)));
    }

    #[test]
    fn test_has_more_from_server_pages() {
        let pager = PaginationManager::new(PaginationConfig::default());
        let pagination = |page, pages| {
            Some(Pagination {
                page: Some(page),
                pages: Some(pages),
                total: Some(6),
            })
        };

        let cursor = pager.record_page(&id(), PageRequest::new(1, 3), 3, pagination(1, 2));
        assert!(cursor.has_more);

        let cursor = pager.record_page(&id(), PageRequest::new(2, 3), 3, pagination(2, 2));
        assert!(!cursor.has_more);
        assert_eq!(pager.next_request(&id(), 6), None);
    }

    #[test]
    fn test_has_more_inferred_from_short_page() {
        let pager = PaginationManager::new(PaginationConfig::default());
        assert!(pager.record_page(&id(), PageRequest::new(1, 20), 20, None).has_more);
        assert!(!pager.record_page(&id(), PageRequest::new(1, 40), 25, None).has_more);
    }

    #[test]
    fn test_exhausted_cursor_survives_first_page_reload() {
        let pager = PaginationManager::new(PaginationConfig::default());
        let pagination = |page| {
            Some(Pagination {
                page: Some(page),
                pages: Some(2),
                total: Some(6),
            })
        };
        pager.record_page(&id(), PageRequest::new(1, 3), 3, pagination(1));
        pager.record_page(&id(), PageRequest::new(2, 3), 3, pagination(2));

        let cursor = pager.record_page(&id(), PageRequest::new(1, 3), 3, pagination(1));
        assert!(!cursor.has_more);
        assert_eq!(pager.next_request(&id(), 6), None);

        pager.reset(&id());
        assert!(pager.record_page(&id(), PageRequest::new(1, 3), 3, pagination(1)).has_more);
    }

    #[test]
    fn test_reset_reenables() {
        let pager = PaginationManager::new(PaginationConfig::default());
        pager.record_page(&id(), PageRequest::new(1, 20), 5, None);
        assert!(!pager.has_more(&id()));

        pager.reset(&id());
        assert!(pager.has_more(&id()));
        assert_eq!(pager.cursor(&id()).page, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_slots_are_spaced() {
        let pager = PaginationManager::new(PaginationConfig::default());
        assert_eq!(pager.reserve_fetch_slot(&id()), Duration::ZERO);
        assert_eq!(pager.reserve_fetch_slot(&id()), Duration::from_millis(500));
        assert_eq!(pager.reserve_fetch_slot(&id()), Duration::from_millis(1000));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(pager.reserve_fetch_slot(&id()), Duration::ZERO);
        assert_eq!(
            pager.reserve_fetch_slot(&ConversationId::new("other")),
            Duration::ZERO
        );
    }
}
