//! Common interface of the ticket-weighted run queue backends.

use crate::types::Pid;
use crate::types::Tickets;

/// A weighted population of runnable tasks supporting a biased draw.
///
/// Every queued task owns `tickets` consecutive points of the range
/// `[0, total_tickets())`. `draw(point)` returns the task owning `point`, so
/// drawing a uniformly random point selects each task with probability
/// `tickets / total_tickets()`.
pub trait TicketQueue: Default {
    /// Short name used in logs and CLI output.
    const NAME: &'static str;

    /// Queue `pid` with `tickets` (> 0). Returns false and changes nothing if
    /// `pid` is already queued, `tickets` is zero, or the total would no
    /// longer fit in [`Tickets`].
    fn insert(&mut self, pid: Pid, tickets: Tickets) -> bool;

    /// Remove `pid`, returning the tickets it held.
    fn remove(&mut self, pid: Pid) -> Option<Tickets>;

    /// Task owning `point`, or `None` if `point >= total_tickets()`.
    fn draw(&self, point: u64) -> Option<Pid>;

    /// Sum of the tickets of all queued tasks.
    fn total_tickets(&self) -> Tickets;

    /// Number of queued tasks.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tickets held by `pid` if it is queued.
    fn tickets(&self, pid: Pid) -> Option<Tickets>;

    fn contains(&self, pid: Pid) -> bool {
        self.tickets(pid).is_some()
    }

    /// Move `pid` behind every other task in iteration order. Returns false
    /// if the queue has no notion of order (the draw doesn't depend on it)
    /// or `pid` isn't queued.
    fn requeue_tail(&mut self, _pid: Pid) -> bool {
        false
    }

    /// Queued `(pid, tickets)` pairs in iteration order.
    fn entries(&self) -> Vec<(Pid, Tickets)>;
}
