use bitflags::bitflags;
use std::fmt::{self, Debug, Display, Formatter};

/// An instruction address recorded while unwinding, or one of the reserved
/// marker values [`StackIp::NULL`] and [`StackIp::EDI_SEPARATOR`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct StackIp(pub usize);

impl StackIp {
    pub const NULL: Self = StackIp(0);
    /// Marks where a dispatch-info restore spliced an earlier trace in.
    pub const EDI_SEPARATOR: Self = StackIp(1);

    pub fn is_separator(self) -> bool {
        self == Self::EDI_SEPARATOR
    }
}

impl From<usize> for StackIp {
    fn from(ip: usize) -> Self {
        StackIp(ip)
    }
}

impl Debug for StackIp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NULL => f.write_str("StackIp(null)"),
            Self::EDI_SEPARATOR => f.write_str("StackIp(separator)"),
            StackIp(ip) => write!(f, "StackIp({ip:#x})"),
        }
    }
}

impl Display for StackIp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

bitflags! {
    /// Flags the unwinder passes along with each frame.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct EhFrameFlags: u32 {
        /// First frame of a dispatch, thrown or rethrown.
        const FIRST_FRAME = 1;
        /// First frame after a bare `throw;`.
        const FIRST_RETHROW_FRAME = 2;
    }
}

pub const INITIAL_CAPACITY: usize = 16;

/// The frames an exception has passed through. Entries past `cursor` are
/// stale and never observed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    frames: Vec<StackIp>,
    cursor: usize,
}

impl StackTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// A trace that continues after `prefix`, with a separator marking the
    /// boundary. An empty prefix restores an untouched trace.
    pub fn restored(prefix: &[StackIp]) -> Self {
        if prefix.is_empty() {
            return Self::new();
        }
        let mut frames = Vec::with_capacity((prefix.len() + 1).max(INITIAL_CAPACITY));
        frames.extend_from_slice(prefix);
        frames.push(StackIp::EDI_SEPARATOR);
        let cursor = frames.len();
        Self { frames, cursor }
    }

    /// A trace holding exactly `frames`, as read back from a dump.
    pub fn from_frames(frames: Vec<StackIp>) -> Self {
        let cursor = frames.len();
        Self { frames, cursor }
    }

    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[StackIp] {
        &self.frames[..self.cursor]
    }

    pub fn last(&self) -> Option<StackIp> {
        self.frames().last().copied()
    }

    /// Records one unwound frame.
    ///
    /// A fresh throw of an exception that already carries frames starts over,
    /// unless those frames were just restored from a dispatch-info snapshot.
    /// The first frame after a rethrow replaces the previous top frame so the
    /// trace shows where the rethrow happened.
    pub fn append(&mut self, ip: StackIp, flags: EhFrameFlags) {
        let first_rethrow = flags.contains(EhFrameFlags::FIRST_RETHROW_FRAME);
        if flags.contains(EhFrameFlags::FIRST_FRAME)
            && !first_rethrow
            && self.last().is_some_and(|last| !last.is_separator())
        {
            self.cursor = 0;
        }

        if self.cursor == 0 {
            if self.frames.is_empty() {
                self.frames = vec![StackIp::NULL; INITIAL_CAPACITY];
            }
        } else if first_rethrow {
            self.frames[self.cursor - 1] = ip;
            return;
        }

        if self.cursor >= self.frames.len() {
            self.grow();
        }
        self.frames[self.cursor] = ip;
        self.cursor += 1;
    }

    fn grow(&mut self) {
        let new_len = (self.frames.len() * 2).max(INITIAL_CAPACITY);
        self.frames.resize(new_len, StackIp::NULL);
    }
}

impl Debug for StackTrace {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.frames()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ips(raw: &[usize]) -> Vec<StackIp> {
        raw.iter().copied().map(StackIp).collect()
    }

    #[test]
    fn test_append_in_order_and_grow() {
        let mut trace = StackTrace::new();
        for i in 0..40 {
            trace.append(StackIp(0x1000 + i), EhFrameFlags::empty());
        }
        assert_eq!(trace.len(), 40);
        assert_eq!(trace.capacity(), 64);
        assert_eq!(trace.frames()[0], StackIp(0x1000));
        assert_eq!(trace.last(), Some(StackIp(0x1000 + 39)));
    }

    #[test]
    fn test_rethrow_overwrites_top_frame() {
        let mut trace = StackTrace::new();
        trace.append(StackIp(0x1000), EhFrameFlags::FIRST_FRAME);
        trace.append(StackIp(0x2000), EhFrameFlags::empty());
        trace.append(
            StackIp(0x4000),
            EhFrameFlags::FIRST_FRAME | EhFrameFlags::FIRST_RETHROW_FRAME,
        );
        assert_eq!(trace.frames(), ips(&[0x1000, 0x4000]).as_slice());
    }

    #[test]
    fn test_rethrow_of_unthrown_exception_appends() {
        let mut trace = StackTrace::new();
        trace.append(StackIp(0x4000), EhFrameFlags::FIRST_RETHROW_FRAME);
        assert_eq!(trace.frames(), ips(&[0x4000]).as_slice());
    }

    #[test]
    fn test_fresh_throw_resets() {
        let mut trace = StackTrace::new();
        trace.append(StackIp(0x1000), EhFrameFlags::FIRST_FRAME);
        trace.append(StackIp(0x2000), EhFrameFlags::empty());
        trace.append(StackIp(0x3000), EhFrameFlags::FIRST_FRAME);
        assert_eq!(trace.frames(), ips(&[0x3000]).as_slice());
    }

    #[test]
    fn test_throw_after_restore_keeps_prefix() {
        let mut trace = StackTrace::restored(&ips(&[0x1000, 0x2000]));
        assert_eq!(trace.len(), 3);
        trace.append(StackIp(0x5000), EhFrameFlags::FIRST_FRAME);
        assert_eq!(
            trace.frames(),
            &[StackIp(0x1000), StackIp(0x2000), StackIp::EDI_SEPARATOR, StackIp(0x5000)]
        );
    }

    #[test]
    fn test_restore_of_empty_snapshot() {
        let trace = StackTrace::restored(&[]);
        assert!(trace.is_empty());
        assert_eq!(trace.capacity(), 0);
    }
}
