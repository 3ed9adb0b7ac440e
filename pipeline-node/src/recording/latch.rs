/// Which input of a latch a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Monitored objects inside a region of interest.
    Roi,
    /// An operator asked for it.
    Manual,
}

/// Two-input OR latch: recording is desired while either source asks for it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordingLatch {
    roi: bool,
    manual: bool,
}

impl RecordingLatch {
    pub fn output(&self) -> bool {
        self.roi || self.manual
    }

    /// Sets one input and returns the new output if it changed.
    pub fn set(&mut self, source: TriggerSource, value: bool) -> Option<bool> {
        let before = self.output();
        match source {
            TriggerSource::Roi => self.roi = value,
            TriggerSource::Manual => self.manual = value,
        }
        let after = self.output();
        (before != after).then_some(after)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    Stop,
}

/// Turns a per-batch hit count into edges.
#[derive(Debug, Default, Clone, Copy)]
pub struct Debouncer {
    previous: usize,
}

impl Debouncer {
    pub fn observe(&mut self, count: usize) -> Option<Trigger> {
        let trigger = match (self.previous, count) {
            (0, c) if c > 0 => Some(Trigger::Start),
            (p, 0) if p > 0 => Some(Trigger::Stop),
            _ => None,
        };
        self.previous = count;
        trigger
    }

    pub fn reset(&mut self) {
        self.previous = 0;
    }
}
