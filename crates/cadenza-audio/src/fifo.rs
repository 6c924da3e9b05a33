//! Block FIFO and the presentation-date engine.
//!
//! The [`Date`] generator turns sample counts into exact tick durations
//! (carrying the division remainder) so that long streams never accumulate
//! rounding drift. The [`Fifo`] re-stamps pushed blocks to enforce stream
//! continuity.

use std::collections::VecDeque;

use crate::block::Block;
use crate::time::{Tick, CLOCK_FREQ};

/// Monotonic date generator at a fixed sample rate.
#[derive(Debug, Clone)]
pub struct Date {
    date: Option<Tick>,
    /// Samples per second.
    num: u32,
    /// Seconds per `num` samples (1 for plain rates).
    den: u32,
    /// Remainder of the last increment, in `num` units.
    rem: i64,
}

impl Date {
    pub fn new(rate: u32) -> Date {
        debug_assert!(rate > 0, "initialising date with zero divider");
        Date {
            date: None,
            num: rate.max(1),
            den: 1,
            rem: 0,
        }
    }

    pub fn set(&mut self, date: Tick) {
        self.date = Some(date);
        self.rem = 0;
    }

    /// Forgets the current date; the next push seeds it again.
    pub fn reset(&mut self) {
        self.date = None;
        self.rem = 0;
    }

    pub fn get(&self) -> Option<Tick> {
        self.date
    }

    pub fn rate(&self) -> u32 {
        self.num
    }

    /// Advances the date by `samples` samples and returns the new date.
    /// Exact: the sub-tick remainder carries over to the next increment.
    pub fn increment(&mut self, samples: u32) -> Tick {
        let date = self.date.unwrap_or(0);
        let total = self.rem + samples as i64 * CLOCK_FREQ * self.den as i64;
        let advance = total / self.num as i64;
        self.rem = total % self.num as i64;
        let new_date = date + advance;
        self.date = Some(new_date);
        new_date
    }

    /// Shifts the date without touching the remainder.
    pub fn move_by(&mut self, delta: Tick) {
        if let Some(date) = self.date.as_mut() {
            *date += delta;
        }
    }
}

/// Queue of dated blocks with O(1) push and pop.
#[derive(Debug)]
pub struct Fifo {
    blocks: VecDeque<Block>,
    end_date: Date,
}

impl Fifo {
    pub fn new(rate: u32) -> Fifo {
        Fifo {
            blocks: VecDeque::new(),
            end_date: Date::new(rate),
        }
    }

    /// Pushes a block, enforcing the continuity of the stream: when the date
    /// is initialised the block is re-stamped to follow the previous one
    /// exactly; otherwise the date is seeded from the block.
    pub fn push(&mut self, mut block: Block) {
        match self.end_date.get() {
            Some(date) => {
                block.pts = date;
                block.length = self.end_date.increment(block.nb_samples) - block.pts;
            }
            None => {
                self.end_date.set(block.pts + block.length);
            }
        }
        self.blocks.push_back(block);
    }

    /// Resets the date and discards every queued block; their timestamps are
    /// no longer trustworthy.
    pub fn set(&mut self, date: Option<Tick>) {
        match date {
            Some(date) => self.end_date.set(date),
            None => self.end_date.reset(),
        }
        self.blocks.clear();
    }

    /// Shifts the date and every queued block's pts by `delta`.
    pub fn move_dates(&mut self, delta: Tick) {
        self.end_date.move_by(delta);
        for block in &mut self.blocks {
            block.pts += delta;
        }
    }

    pub fn pop(&mut self) -> Option<Block> {
        self.blocks.pop_front()
    }

    /// Presentation date of the first queued block.
    pub fn first_date(&self) -> Option<Tick> {
        self.blocks.front().map(|b| b.pts)
    }

    /// Date at which the next pushed block will start.
    pub fn next_start(&self) -> Option<Tick> {
        self.end_date.get()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total queued samples.
    pub fn queued_samples(&self) -> u64 {
        self.blocks.iter().map(|b| b.nb_samples as u64).sum()
    }

    /// Frees all queued blocks, keeping the date.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}
