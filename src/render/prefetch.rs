//! When to render the next batch, given how far the reader has scrolled

use super::DEFAULT_PREFETCH_MARGIN;
use super::types::{SessionSnapshot, SessionState};

/// Fires an extension once the reader is within `margin` pages of the end
/// of what has been rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrefetchPolicy {
    pub margin: usize,
}

impl Default for PrefetchPolicy {
    fn default() -> Self {
        Self {
            margin: DEFAULT_PREFETCH_MARGIN,
        }
    }
}

impl PrefetchPolicy {
    #[must_use]
    pub const fn new(margin: usize) -> Self {
        Self { margin }
    }

    /// `last_visible >= rendered - margin`, nothing in flight, pages left.
    #[must_use]
    pub fn should_extend(
        &self,
        last_visible: usize,
        rendered: usize,
        total: usize,
        in_flight: bool,
    ) -> bool {
        !in_flight && rendered < total && last_visible.saturating_add(self.margin) >= rendered
    }

    /// Same as [`should_extend`](Self::should_extend), reading counts from a
    /// snapshot. Sessions that are not `Partial` never extend.
    #[must_use]
    pub fn should_extend_session(
        &self,
        last_visible: usize,
        snapshot: &SessionSnapshot,
        in_flight: bool,
    ) -> bool {
        snapshot.state == SessionState::Partial
            && self.should_extend(
                last_visible,
                snapshot.rendered_count(),
                snapshot.total_pages,
                in_flight,
            )
    }
}
