//! Circular diagnostic event log.
//!
//! A pre-allocated ring of timestamped, categorized text events with one
//! writer and one reader cursor. When the ring is full the oldest entry is
//! overwritten; a reader that falls behind is pushed forward to the oldest
//! surviving entry instead of reading overwritten data.
//!
//! Reading is a lap-based protocol: once the ring is full and the reader has
//! caught up with the writer, the reader gets one more pass over the full
//! ring (`flag` clear) and then nothing (`flag` set) until the writer evicts
//! an entry under the cursor again.

use std::fmt;
use std::fmt::Write as _;

use serde::Deserialize;
use serde::Serialize;

use crate::types::TimeNs;

/// Default number of retained events.
pub const DEFAULT_CAPACITY: usize = 10000;

/// Default message buffer size. Stored messages hold at most
/// `msg_size - 1` bytes.
pub const DEFAULT_MSG_SIZE: usize = 400;

/// Category of a logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Action {
    Enqueue = 0,
    Dequeue = 1,
    ContextSwitch = 2,
    PickNext = 3,
    Preempt = 4,
    Tick = 5,
    Msg = 6,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Enqueue,
        Action::Dequeue,
        Action::ContextSwitch,
        Action::PickNext,
        Action::Preempt,
        Action::Tick,
        Action::Msg,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Action::Enqueue => "ENQUEUE",
            Action::Dequeue => "DEQUEUE",
            Action::ContextSwitch => "CONTEXT_SWITCH",
            Action::PickNext => "PICK_NEXT",
            Action::Preempt => "PREEMPT",
            Action::Tick => "TICK",
            Action::Msg => "MSG",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub action: Action,
    pub timestamp: TimeNs,
    pub msg: String,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {{{}}}", self.timestamp, self.action, self.msg)
    }
}

/// Truncate `s` to at most `max` bytes without splitting a character.
fn truncate_to_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

#[derive(Debug)]
pub struct EventLog {
    events: Vec<Event>,
    msg_size: usize,
    /// Oldest live slot.
    head: usize,
    /// Next slot to write.
    tail: usize,
    /// Reader's next slot.
    cursor: usize,
    size: usize,
    /// Reader finished its lap over a full ring.
    flag: bool,
    enabled: bool,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MSG_SIZE)
    }
}

impl EventLog {
    /// Allocate a ring of `capacity` events (at least one).
    pub fn new(capacity: usize, msg_size: usize) -> Self {
        let capacity = capacity.max(1);
        let blank = Event {
            action: Action::Msg,
            timestamp: 0,
            msg: String::new(),
        };
        Self {
            events: vec![blank; capacity],
            msg_size,
            head: 0,
            tail: 0,
            cursor: 0,
            size: 0,
            flag: false,
            enabled: true,
        }
    }

    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turn recording on or off. Reads are unaffected.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn write(&mut self, timestamp: TimeNs, action: Action, msg: &str) {
        self.record(timestamp, action, format_args!("{}", msg));
    }

    /// Format `args` straight into the next slot, reusing its buffer.
    pub fn record(&mut self, timestamp: TimeNs, action: Action, args: fmt::Arguments<'_>) {
        if !self.enabled {
            return;
        }

        let cap = self.capacity();
        let limit = self.msg_size.saturating_sub(1);
        let slot = &mut self.events[self.tail];
        slot.action = action;
        slot.timestamp = timestamp;
        slot.msg.clear();
        // Writing into a String only fails if a Display impl does.
        let _ = slot.msg.write_fmt(args);
        truncate_to_boundary(&mut slot.msg, limit);

        self.tail = (self.tail + 1) % cap;
        if self.size == cap {
            if self.cursor == self.head {
                self.cursor = (self.cursor + 1) % cap;
                self.flag = false;
            }
            self.head = (self.head + 1) % cap;
        } else {
            self.size += 1;
        }
    }

    /// Next unread event, if any.
    pub fn read(&mut self) -> Option<Event> {
        let cap = self.capacity();
        if self.cursor == self.tail {
            if self.size < cap || self.flag {
                return None;
            }
            self.flag = true;
        }
        let event = self.events[self.cursor].clone();
        self.cursor = (self.cursor + 1) % cap;
        Some(event)
    }

    /// Forget every entry. Storage is kept.
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.cursor = 0;
        self.size = 0;
        self.flag = false;
    }

    /// Reset on any write to the control surface; the whole input counts as
    /// consumed.
    pub fn reset_from_write(&mut self, buf: &[u8]) -> usize {
        self.reset();
        buf.len()
    }

    /// Live entries from oldest to newest, independent of the reader cursor.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        let cap = self.capacity();
        (0..self.size).map(move |i| &self.events[(self.head + i) % cap])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(log: &mut EventLog) -> Vec<String> {
        let mut msgs = Vec::new();
        while let Some(ev) = log.read() {
            msgs.push(ev.msg);
        }
        msgs
    }

    fn fill(log: &mut EventLog, range: std::ops::Range<u64>) {
        for i in range {
            log.record(i, Action::Msg, format_args!("{}", i));
        }
    }

    #[test]
    fn empty_log_reads_nothing() {
        let mut log = EventLog::new(4, 16);
        assert_eq!(log.read(), None);
        assert!(log.is_empty());
    }

    #[test]
    fn reads_in_write_order() {
        let mut log = EventLog::new(4, 16);
        fill(&mut log, 0..3);
        assert_eq!(drain(&mut log), vec!["0", "1", "2"]);
        assert_eq!(log.read(), None);

        fill(&mut log, 3..4);
        assert_eq!(drain(&mut log), vec!["3"]);
    }

    #[test]
    fn overflow_keeps_newest_lap() {
        let mut log = EventLog::new(3, 16);
        fill(&mut log, 0..4);
        assert_eq!(log.len(), 3);
        assert_eq!(drain(&mut log), vec!["1", "2", "3"]);
        assert_eq!(log.read(), None);
        assert_eq!(log.read(), None);

        fill(&mut log, 4..5);
        assert_eq!(drain(&mut log), vec!["2", "3", "4"]);
    }

    #[test]
    fn lagging_reader_skips_evicted_entries() {
        let mut log = EventLog::new(3, 16);
        fill(&mut log, 0..2);
        assert_eq!(log.read().map(|e| e.msg), Some("0".to_string()));

        fill(&mut log, 2..5);
        assert_eq!(drain(&mut log), vec!["2", "3", "4"]);
    }

    #[test]
    fn single_slot_ring() {
        let mut log = EventLog::new(1, 16);
        fill(&mut log, 0..1);
        assert_eq!(drain(&mut log), vec!["0"]);
        fill(&mut log, 1..3);
        assert_eq!(drain(&mut log), vec!["2"]);
        assert_eq!(log.read(), None);
    }

    #[test]
    fn reset_empties_the_ring() {
        let mut log = EventLog::new(3, 16);
        fill(&mut log, 0..5);
        log.reset();
        assert_eq!(log.read(), None);
        assert_eq!(log.iter().count(), 0);

        log.write(9, Action::Tick, "after");
        let ev = log.read().unwrap();
        assert_eq!(ev.action, Action::Tick);
        assert_eq!(ev.timestamp, 9);
        assert_eq!(ev.msg, "after");
        assert_eq!(log.read(), None);
    }

    #[test]
    fn reset_from_write_consumes_input() {
        let mut log = EventLog::new(3, 16);
        fill(&mut log, 0..2);
        assert_eq!(log.reset_from_write(b"1\n"), 2);
        assert!(log.is_empty());
    }

    #[test]
    fn messages_are_truncated_on_char_boundary() {
        let mut log = EventLog::new(2, 6);
        log.write(0, Action::Msg, "abcdefgh");
        log.write(0, Action::Msg, "abcé");
        assert_eq!(log.read().unwrap().msg, "abcde");
        // "abcé" is 5 bytes and fits.
        assert_eq!(log.read().unwrap().msg, "abcé");

        let mut log = EventLog::new(1, 5);
        log.write(0, Action::Msg, "abcé");
        assert_eq!(log.read().unwrap().msg, "abc");
    }

    #[test]
    fn disabled_log_drops_writes() {
        let mut log = EventLog::new(3, 16);
        log.set_enabled(false);
        fill(&mut log, 0..2);
        assert!(log.is_empty());
        log.set_enabled(true);
        fill(&mut log, 2..3);
        assert_eq!(drain(&mut log), vec!["2"]);
    }

    #[test]
    fn iter_is_chronological_after_wrap() {
        let mut log = EventLog::new(3, 16);
        fill(&mut log, 0..5);
        let ts: Vec<u64> = log.iter().map(|e| e.timestamp).collect();
        assert_eq!(ts, vec![2, 3, 4]);
    }

    #[test]
    fn renders_event_line() {
        let ev = Event {
            action: Action::PickNext,
            timestamp: 1234,
            msg: "PID:7 with 3 tickets".to_string(),
        };
        assert_eq!(ev.to_string(), "[1234] PICK_NEXT {PID:7 with 3 tickets}");
        assert_eq!(Action::ContextSwitch as u8, 2);
        assert_eq!(Action::Msg as u8, 6);
    }
}
