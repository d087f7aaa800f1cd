//! Register-file model of a DWC OTG core
//!
//! Stores every register sparsely and applies the write semantics the core
//! documents for each offset, so status registers clear on write-1 and
//! GRSTCTL's reset and flush bits finish immediately.

use dwc_otg_core::dwc::offsets::{self, WriteSemantics};
use dwc_otg_core::RegisterAccess;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

/// GSNPSID of an OTG 3.10a core
pub const SNPSID: u32 = 0x4F54_310A;

/// Sparse register file with a write log and queued read values
#[derive(Default)]
pub struct MockRegisters {
    values: RefCell<HashMap<usize, u32>>,
    pops: RefCell<HashMap<usize, VecDeque<u32>>>,
    log: RefCell<Vec<(usize, u32)>>,
}

impl MockRegisters {
    pub fn new() -> Self {
        let mock = Self::default();
        mock.set(offsets::GSNPSID, SNPSID);
        mock
    }

    /// Backdoor write: no register semantics, not logged
    pub fn set(&self, offset: usize, value: u32) {
        self.values.borrow_mut().insert(offset, value);
    }

    pub fn get(&self, offset: usize) -> u32 {
        self.values.borrow().get(&offset).copied().unwrap_or(0)
    }

    /// Queue a value for the next read of `offset`
    pub fn push_read(&self, offset: usize, value: u32) {
        self.pops.borrow_mut().entry(offset).or_default().push_back(value);
    }

    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.log
            .borrow()
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn clear_log(&self) {
        self.log.borrow_mut().clear();
    }

    /// Bytes pushed into data FIFO `n` since the log was cleared
    pub fn fifo_bytes(&self, n: usize) -> Vec<u8> {
        self.writes_to(offsets::fifo(n))
            .into_iter()
            .flat_map(u32::to_le_bytes)
            .collect()
    }

    /// Queue `data` to be popped from the Rx FIFO
    pub fn queue_rx_data(&self, data: &[u8]) {
        for word in data.chunks(4) {
            let mut bytes = [0u8; 4];
            bytes[..word.len()].copy_from_slice(word);
            self.push_read(offsets::fifo(0), u32::from_le_bytes(bytes));
        }
    }
}

impl RegisterAccess for MockRegisters {
    fn read(&self, offset: usize) -> u32 {
        if let Some(queue) = self.pops.borrow_mut().get_mut(&offset) {
            if let Some(value) = queue.pop_front() {
                return value;
            }
        }
        self.get(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        self.log.borrow_mut().push((offset, value));
        let current = self.get(offset);
        let stored = match offsets::write_semantics(offset) {
            WriteSemantics::Plain => value,
            WriteSemantics::WriteOneToClear(mask) => current & !(value & mask),
            WriteSemantics::SelfClearing(mask, sticky) => (value & !mask) | sticky,
            WriteSemantics::FifoPush => current,
        };
        self.set(offset, stored);
    }
}
