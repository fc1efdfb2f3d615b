//! Capturing an exception's trace and rethrowing it later, possibly on
//! another thread, without losing where it was first thrown.
use super::{oom, EhFrameFlags, Exception, StackIp, StackTrace};
use parking_lot::{const_mutex, Mutex};
use std::sync::Arc;
use tracing::debug;

/// Serializes every dispatch-state restore in the process. Restores are rare,
/// so unrelated exceptions briefly contending here is acceptable.
static DISPATCH_STATE_LOCK: Mutex<()> = const_mutex(());

/// An immutable copy of an exception's frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdiCaptureState {
    frames: Arc<[StackIp]>,
}

impl Default for EdiCaptureState {
    fn default() -> Self {
        Self {
            frames: Vec::<StackIp>::new().into(),
        }
    }
}

impl EdiCaptureState {
    pub fn frames(&self) -> &[StackIp] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Exception {
    pub fn capture_dispatch_state(&self) -> EdiCaptureState {
        EdiCaptureState {
            frames: self.trace_snapshot().into(),
        }
    }

    /// Replaces the trace with `state` followed by a separator. Appends that
    /// follow land after the separator. The preallocated out-of-memory
    /// exception keeps its empty trace.
    pub fn restore_dispatch_state(&self, state: &EdiCaptureState) {
        if oom::is_preallocated(self) {
            return;
        }
        let restored = StackTrace::restored(state.frames());
        let previous = {
            let _guard = DISPATCH_STATE_LOCK.lock();
            self.swap_trace(restored)
        };
        debug!(
            type_name = self.type_name(),
            restored = state.len(),
            replaced = previous.len(),
            "restored dispatch state"
        );
    }
}

/// `ExceptionDispatchInfo`: holds an exception together with the frames it
/// had when captured.
#[derive(Clone, Debug)]
pub struct ExceptionDispatchInfo {
    exception: Arc<Exception>,
    state: EdiCaptureState,
}

impl ExceptionDispatchInfo {
    pub fn capture(exception: Arc<Exception>) -> Self {
        let state = exception.capture_dispatch_state();
        Self { exception, state }
    }

    pub fn source_exception(&self) -> &Arc<Exception> {
        &self.exception
    }

    pub fn state(&self) -> &EdiCaptureState {
        &self.state
    }

    /// Restores the captured frames and hands the exception back as an error
    /// for the caller to propagate.
    pub fn throw<T>(&self) -> Result<T, Arc<Exception>> {
        self.exception.restore_dispatch_state(&self.state);
        Err(self.exception.clone())
    }
}

/// Feeds unwound frames into an exception, flagging the first one as the
/// start of a throw or a rethrow.
#[derive(Debug)]
pub struct Unwinder {
    exception: Arc<Exception>,
    next_flags: EhFrameFlags,
}

impl Unwinder {
    pub fn throw(exception: Arc<Exception>) -> Self {
        Self {
            exception,
            next_flags: EhFrameFlags::FIRST_FRAME,
        }
    }

    /// Bare `throw;` from a catch block.
    pub fn rethrow(exception: Arc<Exception>) -> Self {
        Self {
            exception,
            next_flags: EhFrameFlags::FIRST_FRAME | EhFrameFlags::FIRST_RETHROW_FRAME,
        }
    }

    pub fn unwind_frame(&mut self, ip: impl Into<StackIp>) {
        let flags = std::mem::take(&mut self.next_flags);
        self.exception.append_stack_frame(ip.into(), flags);
    }

    pub fn unwind_frames(&mut self, ips: impl IntoIterator<Item = usize>) {
        for ip in ips {
            self.unwind_frame(ip);
        }
    }

    pub fn exception(&self) -> &Arc<Exception> {
        &self.exception
    }

    pub fn into_exception(self) -> Arc<Exception> {
        self.exception
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::core_types;

    fn ips(raw: &[usize]) -> Vec<StackIp> {
        raw.iter().copied().map(StackIp).collect()
    }

    #[test]
    fn test_capture_is_independent_of_later_appends() {
        let e = Arc::new(Exception::from_message("boom"));
        Unwinder::throw(e.clone()).unwind_frames([0x1000, 0x2000]);
        let info = ExceptionDispatchInfo::capture(e.clone());
        e.append_stack_frame(StackIp(0x3000), EhFrameFlags::empty());
        assert_eq!(info.state().frames(), ips(&[0x1000, 0x2000]).as_slice());
    }

    #[test]
    fn test_throw_restores_and_returns_err() {
        let e = Arc::new(Exception::with_message(core_types().invalid_operation, "bad state"));
        Unwinder::throw(e.clone()).unwind_frames([0x1000, 0x2000]);
        let info = ExceptionDispatchInfo::capture(e.clone());

        // the exception travels on and picks up unrelated frames
        Unwinder::throw(e.clone()).unwind_frames([0x9000]);

        let err = info.throw::<()>().unwrap_err();
        assert!(Arc::ptr_eq(&err, &e));
        let mut unwinder = Unwinder::throw(err);
        unwinder.unwind_frame(0x7000usize);
        assert_eq!(
            e.stack_ips(),
            vec![StackIp(0x1000), StackIp(0x2000), StackIp::EDI_SEPARATOR, StackIp(0x7000)]
        );
    }

    #[test]
    fn test_restoring_empty_state_clears_trace() {
        let e = Exception::from_message("boom");
        e.append_stack_frame(StackIp(0x1000), EhFrameFlags::FIRST_FRAME);
        e.restore_dispatch_state(&EdiCaptureState::default());
        assert!(!e.has_been_thrown());
    }

    #[test]
    fn test_rethrow_unwinder_overwrites_top() {
        let e = Arc::new(Exception::from_message("boom"));
        Unwinder::throw(e.clone()).unwind_frames([0x1000, 0x2000]);
        Unwinder::rethrow(e.clone()).unwind_frames([0x2500, 0x3000]);
        assert_eq!(e.stack_ips(), ips(&[0x1000, 0x2500, 0x3000]));
    }

    #[test]
    fn test_rethrow_after_restore_overwrites_the_separator() {
        let e = Arc::new(Exception::from_message("boom"));
        Unwinder::throw(e.clone()).unwind_frames([0x1000]);
        let info = ExceptionDispatchInfo::capture(e.clone());
        let rethrown = info.throw::<()>().unwrap_err();
        assert_eq!(e.stack_ips(), vec![StackIp(0x1000), StackIp::EDI_SEPARATOR]);

        Unwinder::rethrow(rethrown).unwind_frames([0x2000, 0x3000]);
        assert_eq!(e.stack_ips(), ips(&[0x1000, 0x2000, 0x3000]));
    }
}
