use crate::control::inputs::{ControllerInputs, Decision};

/// Seam between the thread pool and whatever tunes it.
///
/// Called from the pool's controller thread once per interval; never from a
/// worker. Implementations may keep hysteresis state but must not block.
pub trait Policy: Send + 'static {
    fn decide(&mut self, inputs: &ControllerInputs) -> Decision;
}

impl<F> Policy for F
where
    F: FnMut(&ControllerInputs) -> Decision + Send + 'static,
{
    #[inline]
    fn decide(&mut self, inputs: &ControllerInputs) -> Decision {
        self(inputs)
    }
}
