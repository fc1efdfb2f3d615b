//! Small helpers shared by the type, value and vm layers.
use std::{
    cell::Cell,
    fmt::{self, Display, Formatter},
    sync::atomic::{AtomicU64, Ordering},
};

/// Offset in bytes from the start of an object's payload region.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteOffset(pub usize);

impl Display for ByteOffset {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for ByteOffset {
    fn from(offset: usize) -> Self {
        ByteOffset(offset)
    }
}

impl From<ByteOffset> for usize {
    fn from(offset: ByteOffset) -> Self {
        offset.0
    }
}

impl ByteOffset {
    pub const ZERO: Self = ByteOffset(0);

    pub fn as_usize(self) -> usize {
        self.0
    }
}

pub const fn align_up(value: usize, align: usize) -> usize {
    let misalignment = value % align;
    if misalignment == 0 {
        value
    } else {
        value + align - misalignment
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static MANAGED_THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Small, dense identifier for the calling thread, assigned on first use.
pub fn get_current_thread_id() -> u64 {
    MANAGED_THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}
