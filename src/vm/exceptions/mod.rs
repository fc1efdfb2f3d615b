//! Managed exception state: message, inner exception, side data and the
//! frames recorded while the exception unwinds.
use crate::{
    error::RuntimeResult,
    types::{core_types, TypeHandle},
};
use parking_lot::{Mutex, RwLock};
use std::{
    borrow::Cow,
    collections::HashMap,
    fmt::{self, Display, Formatter},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

pub mod dispatch;
pub mod dump;
pub mod format;
pub mod oom;
pub mod trace;

pub use dispatch::{EdiCaptureState, ExceptionDispatchInfo, Unwinder};
pub use format::{DefaultStackTraceFormatter, StackTraceFormatter, SymbolResolver};
pub use oom::out_of_memory;
pub use trace::{EhFrameFlags, StackIp, StackTrace};

pub const COR_E_EXCEPTION: i32 = 0x8013_1500_u32 as i32;
pub const COR_E_SYSTEM: i32 = 0x8013_1501_u32 as i32;
pub const COR_E_INVALIDOPERATION: i32 = 0x8013_1509_u32 as i32;
pub const E_OUTOFMEMORY: i32 = 0x8007_000E_u32 as i32;

const INNER_EXCEPTION_END: &str = "   --- End of inner exception stack trace ---";

/// Values stored in an exception's `Data` table.
#[derive(Clone, Debug, PartialEq)]
pub enum DataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for DataValue {
    fn from(value: &str) -> Self {
        DataValue::Str(value.to_string())
    }
}

impl From<String> for DataValue {
    fn from(value: String) -> Self {
        DataValue::Str(value)
    }
}

impl From<i64> for DataValue {
    fn from(value: i64) -> Self {
        DataValue::Int(value)
    }
}

impl From<bool> for DataValue {
    fn from(value: bool) -> Self {
        DataValue::Bool(value)
    }
}

impl From<f64> for DataValue {
    fn from(value: f64) -> Self {
        DataValue::Float(value)
    }
}

#[derive(Debug, Default)]
struct Details {
    help_link: Option<String>,
    source: Option<String>,
}

#[derive(Debug)]
pub struct Exception {
    type_handle: TypeHandle,
    message: Option<String>,
    inner: Option<Arc<Exception>>,
    hresult: AtomicI32,
    details: RwLock<Details>,
    data: RwLock<Option<HashMap<String, DataValue>>>,
    trace: Mutex<StackTrace>,
}

impl Exception {
    /// # Panics
    ///
    /// Panics if `type_handle` is null, as do the other constructors taking a
    /// handle. Use [`Exception::try_new`] when the handle is not known to be valid.
    pub fn new(type_handle: TypeHandle) -> Self {
        Self::build(type_handle, None, None)
    }

    pub fn try_new(type_handle: TypeHandle) -> RuntimeResult<Self> {
        type_handle.try_descriptor()?;
        Ok(Self::build(type_handle, None, None))
    }

    pub fn with_message(type_handle: TypeHandle, message: impl Into<String>) -> Self {
        Self::build(type_handle, Some(message.into()), None)
    }

    pub fn with_inner(
        type_handle: TypeHandle,
        message: impl Into<String>,
        inner: Arc<Exception>,
    ) -> Self {
        Self::build(type_handle, Some(message.into()), Some(inner))
    }

    /// A plain `System.Exception`.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self::with_message(core_types().exception, message)
    }

    fn build(type_handle: TypeHandle, message: Option<String>, inner: Option<Arc<Exception>>) -> Self {
        assert!(!type_handle.is_null(), "exception type handle must not be null");
        Self {
            type_handle,
            message,
            inner,
            hresult: AtomicI32::new(default_hresult(type_handle)),
            details: RwLock::new(Details::default()),
            data: RwLock::new(None),
            trace: Mutex::new(StackTrace::new()),
        }
    }

    pub fn type_handle(&self) -> TypeHandle {
        self.type_handle
    }

    pub fn type_name(&self) -> &'static str {
        self.type_handle.name()
    }

    /// The supplied message, or one synthesized from the type name.
    pub fn message(&self) -> Cow<'_, str> {
        match &self.message {
            Some(message) => Cow::Borrowed(message),
            None => Cow::Owned(format!("Exception of type '{}' was thrown.", self.type_name())),
        }
    }

    pub fn inner_exception(&self) -> Option<&Arc<Exception>> {
        self.inner.as_ref()
    }

    /// The innermost exception of the chain; `self` when there is none.
    pub fn base_exception(&self) -> &Exception {
        let mut back = self;
        while let Some(inner) = &back.inner {
            back = inner;
        }
        back
    }

    pub fn hresult(&self) -> i32 {
        self.hresult.load(Ordering::Relaxed)
    }

    pub fn set_hresult(&self, hresult: i32) {
        self.hresult.store(hresult, Ordering::Relaxed);
    }

    pub fn help_link(&self) -> Option<String> {
        self.details.read().help_link.clone()
    }

    pub fn set_help_link(&self, link: Option<String>) {
        self.details.write().help_link = link;
    }

    /// Defaults to `<unknown>` once the exception has been thrown.
    pub fn source(&self) -> Option<String> {
        if let Some(source) = &self.details.read().source {
            return Some(source.clone());
        }
        if !self.has_been_thrown() {
            return None;
        }
        let mut details = self.details.write();
        Some(
            details
                .source
                .get_or_insert_with(|| "<unknown>".to_string())
                .clone(),
        )
    }

    pub fn set_source(&self, source: Option<String>) {
        self.details.write().source = source;
    }

    pub fn data(&self, key: &str) -> Option<DataValue> {
        self.data.read().as_ref()?.get(key).cloned()
    }

    /// Returns the value previously stored under `key`.
    pub fn set_data(&self, key: impl Into<String>, value: impl Into<DataValue>) -> Option<DataValue> {
        self.data
            .write()
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into())
    }

    pub fn remove_data(&self, key: &str) -> Option<DataValue> {
        self.data.write().as_mut()?.remove(key)
    }

    pub fn data_len(&self) -> usize {
        self.data.read().as_ref().map_or(0, HashMap::len)
    }

    pub fn has_been_thrown(&self) -> bool {
        !self.trace.lock().is_empty()
    }

    /// The live frames, innermost first, including any separators.
    pub fn stack_ips(&self) -> Vec<StackIp> {
        self.trace.lock().frames().to_vec()
    }

    pub fn stack_trace(&self) -> Option<String> {
        self.stack_trace_with(&DefaultStackTraceFormatter::default())
    }

    /// `None` until the exception has been thrown.
    pub fn stack_trace_with(&self, formatter: &dyn StackTraceFormatter) -> Option<String> {
        let ips = {
            let trace = self.trace.lock();
            if trace.is_empty() {
                return None;
            }
            trace.frames().to_vec()
        };
        Some(formatter.format(&ips))
    }

    /// Called by the unwinder for every frame the exception passes. Never
    /// fails: a problem while recording is logged and otherwise ignored.
    pub fn append_stack_frame(&self, ip: StackIp, flags: EhFrameFlags) {
        // recording could allocate, which the preallocated out-of-memory exception must not do
        if oom::is_preallocated(self) {
            return;
        }
        let recorded = panic::catch_unwind(AssertUnwindSafe(|| {
            self.trace.lock().append(ip, flags);
        }));
        if recorded.is_err() {
            warn!(type_name = self.type_name(), %ip, "failed to record stack frame");
            return;
        }
        if flags.contains(EhFrameFlags::FIRST_FRAME) {
            debug!(
                type_name = self.type_name(),
                hresult = format_args!("{:#010x}", self.hresult()),
                %ip,
                rethrow = flags.contains(EhFrameFlags::FIRST_RETHROW_FRAME),
                "exception thrown"
            );
        }
    }

    /// `Name: message`, written piecewise so nothing is allocated.
    pub fn write_summary(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        out.write_str(self.type_name())?;
        match &self.message {
            Some(message) if message.is_empty() => Ok(()),
            Some(message) => {
                out.write_str(": ")?;
                out.write_str(message)
            }
            None => {
                out.write_str(": Exception of type '")?;
                out.write_str(self.type_name())?;
                out.write_str("' was thrown.")
            }
        }
    }

    pub(crate) fn swap_trace(&self, trace: StackTrace) -> StackTrace {
        std::mem::replace(&mut *self.trace.lock(), trace)
    }

    pub(crate) fn trace_snapshot(&self) -> Vec<StackIp> {
        self.stack_ips()
    }
}

fn default_hresult(type_handle: TypeHandle) -> i32 {
    let core = core_types();
    if type_handle.equals(core.out_of_memory) || type_handle.is_subclass_of(core.out_of_memory) {
        E_OUTOFMEMORY
    } else if type_handle.equals(core.invalid_operation) {
        COR_E_INVALIDOPERATION
    } else if type_handle.equals(core.system_exception) {
        COR_E_SYSTEM
    } else {
        COR_E_EXCEPTION
    }
}

impl Display for Exception {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.write_summary(f)?;
        if let Some(inner) = &self.inner {
            write!(f, " ---> {inner}")?;
            write!(f, "\n{INNER_EXCEPTION_END}")?;
        }
        if let Some(trace) = self.stack_trace() {
            if !trace.is_empty() {
                write!(f, "\n{trace}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;

    #[test]
    fn test_synthesized_message() {
        let e = Exception::new(core_types().invalid_operation);
        assert_eq!(
            e.message(),
            "Exception of type 'System.InvalidOperationException' was thrown."
        );
        assert_eq!(e.hresult(), COR_E_INVALIDOPERATION);
        assert_eq!(Exception::from_message("x").hresult(), COR_E_EXCEPTION);
    }

    #[test]
    fn test_base_exception_walks_chain() {
        let root = Arc::new(Exception::from_message("root"));
        let middle = Arc::new(Exception::with_inner(core_types().exception, "middle", root));
        let outer = Exception::with_inner(core_types().system_exception, "outer", middle);
        assert_eq!(outer.base_exception().message(), "root");
        assert_eq!(
            outer.inner_exception().map(|e| e.message().into_owned()),
            Some("middle".to_string())
        );
    }

    #[test]
    fn test_display_with_inner() {
        let inner = Arc::new(Exception::from_message("inner"));
        let outer = Exception::with_inner(core_types().exception, "outer", inner);
        assert_eq!(
            outer.to_string(),
            "System.Exception: outer ---> System.Exception: inner\n   --- End of inner exception stack trace ---"
        );
    }

    #[test]
    fn test_display_with_trace() {
        let e = Exception::from_message("boom");
        e.append_stack_frame(StackIp(0x10), EhFrameFlags::FIRST_FRAME);
        assert_eq!(e.to_string(), "System.Exception: boom\n   at <unknown> + 0x10");
    }

    #[test]
    fn test_source_defaults_once_thrown() {
        let e = Exception::from_message("boom");
        assert_eq!(e.source(), None);
        e.append_stack_frame(StackIp(0x10), EhFrameFlags::FIRST_FRAME);
        assert_eq!(e.source().as_deref(), Some("<unknown>"));
        e.set_source(Some("MyApp".to_string()));
        assert_eq!(e.source().as_deref(), Some("MyApp"));
    }

    #[test]
    fn test_data_is_created_lazily() {
        let e = Exception::from_message("boom");
        assert_eq!(e.data_len(), 0);
        assert_eq!(e.data("k"), None);
        assert_eq!(e.set_data("k", 5i64), None);
        assert_eq!(e.set_data("k", "v"), Some(DataValue::Int(5)));
        assert_eq!(e.data("k"), Some(DataValue::Str("v".to_string())));
        assert_eq!(e.remove_data("k"), Some(DataValue::Str("v".to_string())));
        assert_eq!(e.data_len(), 0);
    }

    #[test]
    fn test_help_link_round_trip() {
        let e = Exception::from_message("boom");
        assert_eq!(e.help_link(), None);
        e.set_help_link(Some("https://example.invalid/help".to_string()));
        assert_eq!(e.help_link().as_deref(), Some("https://example.invalid/help"));
    }

    #[test]
    fn test_try_new_rejects_null_handle() {
        assert!(matches!(
            Exception::try_new(TypeHandle::NULL),
            Err(RuntimeError::NullTypeHandle)
        ));
        let e = Exception::try_new(core_types().invalid_operation).unwrap();
        assert_eq!(e.type_name(), "System.InvalidOperationException");
    }

    #[test]
    fn test_user_built_out_of_memory_records_frames() {
        let e = Exception::with_message(core_types().out_of_memory, "array too large");
        e.append_stack_frame(StackIp(0x1000), EhFrameFlags::FIRST_FRAME);
        e.append_stack_frame(StackIp(0x2000), EhFrameFlags::empty());
        assert_eq!(e.stack_ips(), vec![StackIp(0x1000), StackIp(0x2000)]);
        assert_eq!(e.hresult(), E_OUTOFMEMORY);
    }

    #[test]
    fn test_unthrown_exception_has_no_trace() {
        let e = Exception::from_message("boom");
        assert!(!e.has_been_thrown());
        assert_eq!(e.stack_trace(), None);
        assert!(e.stack_ips().is_empty());
    }
}
