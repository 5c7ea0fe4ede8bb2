//! Channel topology and non-owning views of driver buffers.

use std::ptr::NonNull;

use crate::driver::{BufferInfo, ChannelRole, ChannelSpec};
use crate::error::TopologyError;

/// Most output channels a topology may fan out to.
pub const MAX_OUTPUTS: usize = 2;

/// One input channel routed to one or two output channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTopology {
    input: usize,
    outputs: Vec<usize>,
}

impl ChannelTopology {
    pub fn new(input: usize, outputs: &[usize]) -> Result<Self, TopologyError> {
        if outputs.is_empty() {
            return Err(TopologyError::NoOutputs);
        }
        if outputs.len() > MAX_OUTPUTS {
            return Err(TopologyError::TooManyOutputs {
                max: MAX_OUTPUTS,
                got: outputs.len(),
            });
        }
        for (i, ch) in outputs.iter().enumerate() {
            if outputs[..i].contains(ch) {
                return Err(TopologyError::DuplicateOutput(*ch));
            }
        }
        Ok(Self {
            input,
            outputs: outputs.to_vec(),
        })
    }

    /// Input 0 to output 0.
    pub fn mono() -> Self {
        Self {
            input: 0,
            outputs: vec![0],
        }
    }

    /// Input 0 to outputs 0 and 1.
    pub fn stereo() -> Self {
        Self {
            input: 0,
            outputs: vec![0, 1],
        }
    }

    pub fn input(&self) -> usize {
        self.input
    }

    pub fn outputs(&self) -> &[usize] {
        &self.outputs
    }

    /// Input first, then outputs in order.
    pub fn specs(&self) -> Vec<ChannelSpec> {
        std::iter::once(ChannelSpec::input(self.input))
            .chain(self.outputs.iter().map(|&ch| ChannelSpec::output(ch)))
            .collect()
    }

    pub fn channel_count(&self) -> usize {
        1 + self.outputs.len()
    }
}

impl Default for ChannelTopology {
    fn default() -> Self {
        Self::stereo()
    }
}

/// The driver's double buffer for one logical channel.
///
/// This is a borrowed view: the memory belongs to the driver and the pointers
/// are valid only between buffer creation and buffer disposal, and may only
/// be dereferenced inside the callback for the matching half.
#[derive(Debug, Clone, Copy)]
pub struct ChannelBufferSet {
    role: ChannelRole,
    channel: usize,
    halves: [Option<NonNull<i32>>; 2],
}

// Published once before streaming starts and never mutated afterwards.
unsafe impl Send for ChannelBufferSet {}
unsafe impl Sync for ChannelBufferSet {}

impl ChannelBufferSet {
    pub fn new(role: ChannelRole, channel: usize, halves: [Option<NonNull<i32>>; 2]) -> Self {
        Self {
            role,
            channel,
            halves,
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Pointer for `half`, or `None` when the index is not 0/1 or the driver
    /// handed out null.
    #[inline]
    pub fn half(&self, half: usize) -> Option<NonNull<i32>> {
        self.halves.get(half).copied().flatten()
    }
}

impl From<BufferInfo> for ChannelBufferSet {
    fn from(info: BufferInfo) -> Self {
        Self::new(info.spec.role, info.spec.channel, info.halves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_specs_put_input_first() {
        let specs = ChannelTopology::stereo().specs();
        assert_eq!(
            specs,
            vec![
                ChannelSpec::input(0),
                ChannelSpec::output(0),
                ChannelSpec::output(1)
            ]
        );
    }

    #[test]
    fn mono_has_two_channels() {
        let topo = ChannelTopology::mono();
        assert_eq!(topo.channel_count(), 2);
        assert_eq!(topo.outputs(), &[0]);
    }

    #[test]
    fn new_rejects_bad_output_lists() {
        assert_eq!(ChannelTopology::new(0, &[]), Err(TopologyError::NoOutputs));
        assert_eq!(
            ChannelTopology::new(0, &[0, 1, 2]),
            Err(TopologyError::TooManyOutputs { max: 2, got: 3 })
        );
        assert_eq!(
            ChannelTopology::new(0, &[3, 3]),
            Err(TopologyError::DuplicateOutput(3))
        );
        assert!(ChannelTopology::new(2, &[4, 5]).is_ok());
    }

    #[test]
    fn half_out_of_range_is_none() {
        let mut word = 0i32;
        let ptr = NonNull::from(&mut word);
        let set = ChannelBufferSet::new(ChannelRole::Input, 0, [Some(ptr), None]);
        assert_eq!(set.half(0), Some(ptr));
        assert_eq!(set.half(1), None);
        assert_eq!(set.half(2), None);
    }
}
