//! GATT request queue: one read and one write in flight, the rest wait in FIFOs

use std::collections::VecDeque;

use crate::event::Action;
use crate::gatt::{Characteristic, WriteMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOp {
    Read(Characteristic),
    Write {
        characteristic: Characteristic,
        value: Vec<u8>,
        mode: WriteMode,
    },
    Subscribe(Characteristic),
}

impl GattOp {
    pub fn write(characteristic: Characteristic, value: Vec<u8>) -> Self {
        GattOp::Write { characteristic, value, mode: WriteMode::WithResponse }
    }

    pub fn characteristic(&self) -> Characteristic {
        match self {
            GattOp::Read(c) | GattOp::Subscribe(c) => *c,
            GattOp::Write { characteristic, .. } => *characteristic,
        }
    }

    pub fn lane(&self) -> Lane {
        match self {
            GattOp::Read(_) => Lane::Read,
            GattOp::Write { .. } | GattOp::Subscribe(_) => Lane::Write,
        }
    }

    fn to_action(&self) -> Action {
        match self {
            GattOp::Read(c) => Action::Read(*c),
            GattOp::Subscribe(c) => Action::Subscribe(*c),
            GattOp::Write { characteristic, value, mode } => Action::Write {
                characteristic: *characteristic,
                value: value.clone(),
                mode: *mode,
            },
        }
    }
}

/// Subscriptions travel on the write lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct LaneQueue {
    outstanding: Option<GattOp>,
    pending: VecDeque<GattOp>,
}

impl LaneQueue {
    fn issue(&mut self) -> Option<Action> {
        if self.outstanding.is_some() {
            return None;
        }
        let op = self.pending.pop_front()?;
        let action = op.to_action();
        self.outstanding = Some(op);
        Some(action)
    }
}

#[derive(Debug, Default)]
pub struct GattQueue {
    read: LaneQueue,
    write: LaneQueue,
}

impl GattQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut LaneQueue {
        match lane {
            Lane::Read => &mut self.read,
            Lane::Write => &mut self.write,
        }
    }

    /// Queue behind anything already waiting on the same lane
    pub fn submit(&mut self, op: GattOp) {
        self.lane_mut(op.lane()).pending.push_back(op);
    }

    /// Queue ahead of everything else on the lane
    pub fn resubmit(&mut self, op: GattOp) {
        self.lane_mut(op.lane()).pending.push_front(op);
    }

    /// Take the outstanding operation if `characteristic` matches it
    pub fn complete(&mut self, lane: Lane, characteristic: Characteristic) -> Option<GattOp> {
        let slot = &mut self.lane_mut(lane).outstanding;
        if slot.as_ref().map(GattOp::characteristic) != Some(characteristic) {
            return None;
        }
        slot.take()
    }

    /// Start the head of every idle lane
    pub fn issue_next(&mut self) -> Vec<Action> {
        self.read
            .issue()
            .into_iter()
            .chain(self.write.issue())
            .collect()
    }

    pub fn outstanding(&self, lane: Lane) -> Option<&GattOp> {
        match lane {
            Lane::Read => self.read.outstanding.as_ref(),
            Lane::Write => self.write.outstanding.as_ref(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.read.outstanding.is_none()
            && self.write.outstanding.is_none()
            && self.read.pending.is_empty()
            && self.write.pending.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
