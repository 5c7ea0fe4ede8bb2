//! Streaming callback engine.
//!
//! Runs on the driver's real-time thread once per ready buffer half:
//! - resolve the input and output pointers for that half
//! - decode each packed input word to a normalized sample
//! - apply the sample transform per output channel
//! - encode and write the result into every output buffer
//!
//! ## Real-time constraints
//! No locks, no allocation, no logging, no panics. A missing pointer turns the
//! whole half into a no-op; nothing is written and the skip is counted.
//!
//! The engine is an immutable snapshot. [`CallbackHub`] publishes it exactly
//! once, before the session starts the stream, so the driver thread only ever
//! observes a fully built engine or none at all.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::buffers::{ChannelBufferSet, MAX_OUTPUTS};
use crate::driver::{DriverCallbacks, TimeInfo};
use crate::message;
use crate::sample;
use crate::transform::SampleTransform;

/// Counters updated from the callback with relaxed atomics.
#[derive(Debug, Default)]
pub struct EngineStats {
    callbacks: AtomicU64,
    processed_halves: AtomicU64,
    skipped_halves: AtomicU64,
    frames: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub callbacks: u64,
    pub processed_halves: u64,
    pub skipped_halves: u64,
    pub frames: u64,
}

impl EngineStats {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            callbacks: self.callbacks.load(Ordering::Relaxed),
            processed_halves: self.processed_halves.load(Ordering::Relaxed),
            skipped_halves: self.skipped_halves.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
        }
    }
}

/// Everything the callback needs, fixed at buffer creation.
pub struct StreamEngine {
    input: ChannelBufferSet,
    outputs: Vec<ChannelBufferSet>,
    frame_count: usize,
    transform: Box<dyn SampleTransform>,
    stats: Arc<EngineStats>,
}

impl StreamEngine {
    /// Outputs past [`MAX_OUTPUTS`] are dropped.
    pub fn new(
        input: ChannelBufferSet,
        mut outputs: Vec<ChannelBufferSet>,
        frame_count: usize,
        transform: Box<dyn SampleTransform>,
        stats: Arc<EngineStats>,
    ) -> Self {
        outputs.truncate(MAX_OUTPUTS);
        Self {
            input,
            outputs,
            frame_count,
            transform,
            stats,
        }
    }

    /// Process buffer half `half`. Returns `false` when the half was skipped.
    pub fn process(&self, half: usize) -> bool {
        self.stats.callbacks.fetch_add(1, Ordering::Relaxed);

        let Some(input) = self.input.half(half) else {
            self.stats.skipped_halves.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let mut dsts = [NonNull::<i32>::dangling(); MAX_OUTPUTS];
        for (dst, out) in dsts.iter_mut().zip(&self.outputs) {
            match out.half(half) {
                Some(ptr) => *dst = ptr,
                None => {
                    self.stats.skipped_halves.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
        }
        let dsts = &dsts[..self.outputs.len()];

        let input = input.as_ptr();
        for i in 0..self.frame_count {
            // SAFETY: the driver guarantees `frame_count` valid words per half
            // for the duration of this callback.
            let x = sample::decode(unsafe { input.add(i).read() });
            for (slot, dst) in dsts.iter().enumerate() {
                let word = sample::encode(self.transform.apply(slot, x));
                unsafe { dst.as_ptr().add(i).write(word) };
            }
        }

        self.stats.processed_halves.fetch_add(1, Ordering::Relaxed);
        self.stats
            .frames
            .fetch_add(self.frame_count as u64, Ordering::Relaxed);
        true
    }
}

/// The callback table handed to the driver.
pub struct CallbackHub {
    engine: OnceLock<StreamEngine>,
    stats: Arc<EngineStats>,
}

impl CallbackHub {
    pub fn new(stats: Arc<EngineStats>) -> Arc<Self> {
        Arc::new(Self {
            engine: OnceLock::new(),
            stats,
        })
    }

    /// Install the engine. Fails if one was already published.
    pub fn publish(&self, engine: StreamEngine) -> Result<(), StreamEngine> {
        self.engine.set(engine)
    }

    pub fn is_published(&self) -> bool {
        self.engine.get().is_some()
    }
}

impl DriverCallbacks for CallbackHub {
    fn buffer_switch(&self, half: usize, _time: Option<&TimeInfo>) {
        match self.engine.get() {
            Some(engine) => {
                engine.process(half);
            }
            None => {
                self.stats.callbacks.fetch_add(1, Ordering::Relaxed);
                self.stats.skipped_halves.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn message(&self, selector: i64, value: i64) -> i64 {
        message::respond(selector, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ChannelRole, ChannelSpec, DoubleBuffer};
    use crate::transform::Identity;

    struct Rig {
        input: DoubleBuffer,
        outputs: Vec<DoubleBuffer>,
    }

    impl Rig {
        fn new(outputs: usize, frames: usize) -> Self {
            Self {
                input: DoubleBuffer::zeroed(ChannelSpec::input(0), frames),
                outputs: (0..outputs)
                    .map(|ch| DoubleBuffer::zeroed(ChannelSpec::output(ch), frames))
                    .collect(),
            }
        }

        fn engine(&self, transform: Box<dyn SampleTransform>) -> StreamEngine {
            StreamEngine::new(
                self.input.info().into(),
                self.outputs.iter().map(|o| o.info().into()).collect(),
                self.input.halves[0].len(),
                transform,
                EngineStats::shared(),
            )
        }
    }

    #[test]
    fn identity_copies_input_to_every_output() {
        let mut rig = Rig::new(2, 4);
        let words = [0x4000_0000, -0x4000_0000, 0x0000_0100, 0x7FFF_FF00];
        rig.input.halves[1].fill_from(&words);

        let engine = rig.engine(Box::new(Identity));
        assert!(engine.process(1));

        for out in &rig.outputs {
            assert_eq!(out.halves[1].to_vec(), words.to_vec());
            assert_eq!(out.halves[0].to_vec(), vec![0; 4]);
        }
    }

    #[test]
    fn padding_is_cleared_on_output() {
        let mut rig = Rig::new(1, 2);
        rig.input.halves[0].fill_from(&[0x4000_00FF, 0x0000_01AB]);
        let engine = rig.engine(Box::new(Identity));
        engine.process(0);
        assert_eq!(rig.outputs[0].halves[0].to_vec(), vec![0x4000_0000, 0x0000_0100]);
    }

    #[test]
    fn transform_sees_output_slot() {
        let mut rig = Rig::new(2, 1);
        rig.input.halves[0].fill_from(&[sample::encode(0.5)]);
        let engine = rig.engine(Box::new(|slot: usize, s: f32| if slot == 1 { -s } else { s }));
        engine.process(0);
        assert_eq!(sample::decode(rig.outputs[0].halves[0].read(0)), 0.5);
        assert_eq!(sample::decode(rig.outputs[1].halves[0].read(0)), -0.5);
    }

    #[test]
    fn null_output_pointer_leaves_everything_untouched() {
        let mut rig = Rig::new(2, 3);
        rig.input.halves[0].fill_from(&[0x1000_0000; 3]);
        rig.outputs[0].halves[0].fill_from(&[7, 7, 7]);
        rig.outputs[1].halves[0].fill_from(&[9, 9, 9]);

        let mut right: ChannelBufferSet = rig.outputs[1].info().into();
        right = ChannelBufferSet::new(ChannelRole::Output, right.channel(), [None, right.half(1)]);
        let stats = EngineStats::shared();
        let engine = StreamEngine::new(
            rig.input.info().into(),
            vec![rig.outputs[0].info().into(), right],
            3,
            Box::new(Identity),
            stats.clone(),
        );

        assert!(!engine.process(0));
        assert_eq!(rig.outputs[0].halves[0].to_vec(), vec![7, 7, 7]);
        assert_eq!(rig.outputs[1].halves[0].to_vec(), vec![9, 9, 9]);
        assert_eq!(rig.input.halves[0].to_vec(), vec![0x1000_0000; 3]);

        // The other half is intact and still processes.
        assert!(engine.process(1));
        let snap = stats.snapshot();
        assert_eq!(snap.skipped_halves, 1);
        assert_eq!(snap.processed_halves, 1);
        assert_eq!(snap.frames, 3);
    }

    #[test]
    fn null_input_pointer_is_a_no_op() {
        let mut rig = Rig::new(1, 2);
        rig.outputs[0].halves[1].fill_from(&[5, 5]);
        let input = ChannelBufferSet::new(ChannelRole::Input, 0, [None, None]);
        let engine = StreamEngine::new(
            input,
            vec![rig.outputs[0].info().into()],
            2,
            Box::new(Identity),
            EngineStats::shared(),
        );
        assert!(!engine.process(1));
        assert_eq!(rig.outputs[0].halves[1].to_vec(), vec![5, 5]);
    }

    #[test]
    fn invalid_half_index_is_a_no_op() {
        let rig = Rig::new(1, 2);
        let stats = EngineStats::shared();
        let engine = StreamEngine::new(
            rig.input.info().into(),
            vec![rig.outputs[0].info().into()],
            2,
            Box::new(Identity),
            stats.clone(),
        );
        assert!(!engine.process(2));
        assert_eq!(stats.snapshot().skipped_halves, 1);
    }

    #[test]
    fn outputs_past_the_limit_are_not_driven() {
        let mut rig = Rig::new(3, 2);
        rig.input.halves[0].fill_from(&[0x1000_0000, 0x1000_0000]);
        rig.outputs[2].halves[0].fill_from(&[3, 3]);

        let engine = rig.engine(Box::new(Identity));
        assert!(engine.process(0));
        assert_eq!(rig.outputs[0].halves[0].to_vec(), vec![0x1000_0000; 2]);
        assert_eq!(rig.outputs[1].halves[0].to_vec(), vec![0x1000_0000; 2]);
        assert_eq!(rig.outputs[2].halves[0].to_vec(), vec![3, 3]);
    }

    #[test]
    fn hub_ignores_switches_until_published() {
        let mut rig = Rig::new(1, 2);
        rig.input.halves[0].fill_from(&[0x2000_0000, 0x2000_0000]);
        let stats = EngineStats::shared();
        let hub = CallbackHub::new(stats.clone());

        hub.buffer_switch(0, None);
        assert_eq!(rig.outputs[0].halves[0].to_vec(), vec![0, 0]);
        assert!(!hub.is_published());

        let engine = StreamEngine::new(
            rig.input.info().into(),
            vec![rig.outputs[0].info().into()],
            2,
            Box::new(Identity),
            stats.clone(),
        );
        assert!(hub.publish(engine).is_ok());
        hub.buffer_switch(0, Some(&TimeInfo::default()));
        assert_eq!(rig.outputs[0].halves[0].to_vec(), vec![0x2000_0000, 0x2000_0000]);

        let snap = stats.snapshot();
        assert_eq!(snap.callbacks, 2);
        assert_eq!(snap.skipped_halves, 1);
        assert_eq!(snap.processed_halves, 1);
    }

    #[test]
    fn hub_publishes_once() {
        let rig = Rig::new(1, 1);
        let hub = CallbackHub::new(EngineStats::shared());
        assert!(hub.publish(rig.engine(Box::new(Identity))).is_ok());
        assert!(hub.publish(rig.engine(Box::new(Identity))).is_err());
    }

    #[test]
    fn hub_answers_messages_from_table() {
        let hub = CallbackHub::new(EngineStats::shared());
        assert_eq!(hub.message(message::Selector::EngineVersion as i64, 0), 2);
        assert_eq!(hub.message(1234, 0), 0);
    }
}
