//! Per-sample processing hook applied between decode and encode.

/// A pure function from one normalized input sample to one output sample.
///
/// `output` is the position of the destination channel in the topology's
/// output list, so a transform can treat outputs differently. Runs on the
/// real-time thread: no blocking, no allocation.
pub trait SampleTransform: Send + Sync {
    fn apply(&self, output: usize, sample: f32) -> f32;
}

/// Plain passthrough.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl SampleTransform for Identity {
    #[inline]
    fn apply(&self, _output: usize, sample: f32) -> f32 {
        sample
    }
}

impl<F> SampleTransform for F
where
    F: Fn(usize, f32) -> f32 + Send + Sync,
{
    #[inline]
    fn apply(&self, output: usize, sample: f32) -> f32 {
        self(output, sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_returns_input() {
        assert_eq!(Identity.apply(0, 0.25), 0.25);
        assert_eq!(Identity.apply(1, -1.0), -1.0);
    }

    #[test]
    fn closures_are_transforms() {
        let invert_right = |output: usize, s: f32| if output == 1 { -s } else { s };
        let t: &dyn SampleTransform = &invert_right;
        assert_eq!(t.apply(0, 0.5), 0.5);
        assert_eq!(t.apply(1, 0.5), -0.5);
    }
}
