use super::{Exception, E_OUTOFMEMORY};
use crate::types::core_types;
use std::sync::{Arc, LazyLock};

pub const OUT_OF_MEMORY_MESSAGE: &str = "Insufficient memory to continue the execution of the program.";

/// Created ahead of need so reporting exhaustion never has to allocate.
static OUT_OF_MEMORY: LazyLock<Arc<Exception>> = LazyLock::new(|| {
    let exception = Exception::with_message(core_types().out_of_memory, OUT_OF_MEMORY_MESSAGE);
    exception.set_hresult(E_OUTOFMEMORY);
    Arc::new(exception)
});

pub fn out_of_memory() -> Arc<Exception> {
    OUT_OF_MEMORY.clone()
}

/// True only for the shared instance returned by [`out_of_memory`], not for
/// other exceptions of the same type.
pub fn is_preallocated(exception: &Exception) -> bool {
    std::ptr::eq(exception, &**OUT_OF_MEMORY)
}

/// Forces the singleton into existence; call during startup.
pub fn preallocate() {
    LazyLock::force(&OUT_OF_MEMORY);
}
