use dotnet_corelib::{
    types::core_types,
    vm::exceptions::{
        dump::{self, DUMP_SIGNATURE},
        format::{StackTraceFormatter, EDI_SEPARATOR_LINE},
        oom, out_of_memory, DefaultStackTraceFormatter, EhFrameFlags, Exception,
        ExceptionDispatchInfo, StackIp, Unwinder,
    },
};
use std::sync::Arc;

fn ips(raw: &[usize]) -> Vec<StackIp> {
    raw.iter().copied().map(StackIp).collect()
}

fn separators(e: &Exception) -> usize {
    e.stack_ips().iter().filter(|ip| ip.is_separator()).count()
}

#[test]
fn test_throw_capture_and_rethrow_elsewhere() {
    let e = Arc::new(Exception::with_message(core_types().invalid_operation, "bad state"));
    Unwinder::throw(e.clone()).unwind_frames([0x1000, 0x1100, 0x1200]);
    let info = ExceptionDispatchInfo::capture(e.clone());

    let rethrown = info.throw::<()>().unwrap_err();
    Unwinder::throw(rethrown).unwind_frames([0x2000, 0x2100]);

    assert_eq!(
        e.stack_ips(),
        vec![
            StackIp(0x1000),
            StackIp(0x1100),
            StackIp(0x1200),
            StackIp::EDI_SEPARATOR,
            StackIp(0x2000),
            StackIp(0x2100),
        ]
    );
}

#[test]
fn test_restoring_onto_a_fresh_exception() {
    let e = Arc::new(Exception::from_message("boom"));
    Unwinder::throw(e.clone()).unwind_frames([0x1000, 0x2000, 0x3000]);
    assert_eq!(e.stack_ips(), ips(&[0x1000, 0x2000, 0x3000]));

    let state = e.capture_dispatch_state();
    let e2 = Exception::from_message("second");
    e2.restore_dispatch_state(&state);
    assert_eq!(e2.stack_ips().len(), 4);
    e2.append_stack_frame(StackIp(0x5000), EhFrameFlags::FIRST_FRAME);
    assert_eq!(e2.stack_ips().len(), 5);
    assert_eq!(e2.stack_ips().last(), Some(&StackIp(0x5000)));
    assert_eq!(e.stack_ips().len(), 3);
}

#[test]
fn test_bare_rethrow_replaces_the_catching_frame() {
    let e = Arc::new(Exception::from_message("boom"));
    Unwinder::throw(e.clone()).unwind_frames([0x1000, 0x1100]);
    Unwinder::rethrow(e.clone()).unwind_frames([0x1180, 0x1200]);
    assert_eq!(e.stack_ips(), ips(&[0x1000, 0x1180, 0x1200]));
}

#[test]
fn test_throwing_the_same_object_again_starts_over() {
    let e = Arc::new(Exception::from_message("boom"));
    Unwinder::throw(e.clone()).unwind_frames([0x1000, 0x1100]);
    Unwinder::throw(e.clone()).unwind_frames([0x3000]);
    assert_eq!(e.stack_ips(), ips(&[0x3000]));
}

#[test]
fn test_captured_state_is_a_snapshot() {
    let e = Arc::new(Exception::from_message("boom"));
    Unwinder::throw(e.clone()).unwind_frames([0x1000, 0x1100]);
    let info = ExceptionDispatchInfo::capture(e.clone());

    Unwinder::throw(e.clone()).unwind_frames((0..40).map(|i| 0x5000 + i * 0x10));
    Unwinder::rethrow(e.clone()).unwind_frames([0x6000]);

    assert_eq!(info.state().frames(), ips(&[0x1000, 0x1100]).as_slice());
}

#[test]
fn test_each_restore_adds_one_separator() {
    let e = Arc::new(Exception::from_message("boom"));
    Unwinder::throw(e.clone()).unwind_frames([0x1000]);

    for hop in 1..=3 {
        let info = ExceptionDispatchInfo::capture(e.clone());
        let rethrown = info.throw::<()>().unwrap_err();
        Unwinder::throw(rethrown).unwind_frames([0x2000 + hop]);
        assert_eq!(separators(&e), hop);
    }
    assert_eq!(e.stack_ips().len(), 1 + 3 * 2);
}

#[test]
fn test_restoring_an_untouched_capture_leaves_no_separator() {
    let e = Arc::new(Exception::from_message("boom"));
    let info = ExceptionDispatchInfo::capture(e.clone());
    assert!(info.state().is_empty());

    let rethrown = info.throw::<()>().unwrap_err();
    Unwinder::throw(rethrown).unwind_frames([0x1000]);
    assert_eq!(e.stack_ips(), ips(&[0x1000]));
}

#[test]
fn test_rendered_trace_marks_the_restore_boundary() {
    let e = Arc::new(Exception::from_message("boom"));
    Unwinder::throw(e.clone()).unwind_frames([0x1000]);
    let info = ExceptionDispatchInfo::capture(e.clone());
    Unwinder::throw(info.throw::<()>().unwrap_err()).unwind_frames([0x2000]);

    let resolver = |ip: StackIp| (ip == StackIp(0x1000)).then(|| "Worker.Run()".to_string());
    let text = e
        .stack_trace_with(&DefaultStackTraceFormatter::new(resolver))
        .unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "   at Worker.Run()");
    assert_eq!(lines[1], EDI_SEPARATOR_LINE);
    assert!(lines[2].starts_with("   at <unknown>"));
    assert!(lines[2].ends_with("0x2000"));
}

#[test]
fn test_display_includes_inner_chain_and_trace() {
    let inner = Arc::new(Exception::with_message(core_types().invalid_operation, "inner"));
    let outer = Arc::new(Exception::with_inner(core_types().exception, "outer", inner.clone()));
    Unwinder::throw(outer.clone()).unwind_frames([0x1000]);

    let text = outer.to_string();
    assert!(text.starts_with("System.Exception: outer ---> System.InvalidOperationException: inner"));
    assert!(text.contains("--- End of inner exception stack trace ---"));
    assert!(text.contains("   at <unknown>"));
    assert!(std::ptr::eq(outer.base_exception(), &*inner));
}

#[test]
fn test_source_defaults_once_thrown() {
    let e = Arc::new(Exception::from_message("boom"));
    assert_eq!(e.source(), None);
    Unwinder::throw(e.clone()).unwind_frames([0x1000]);
    assert_eq!(e.source().as_deref(), Some("<unknown>"));
    e.set_source(Some("Worker".to_string()));
    assert_eq!(e.source().as_deref(), Some("Worker"));
}

#[test]
fn test_data_dictionary() {
    let e = Exception::from_message("boom");
    assert_eq!(e.data_len(), 0);
    assert!(e.set_data("attempt", 3i64).is_none());
    e.set_data("path", "/tmp/x");
    assert_eq!(e.data_len(), 2);
    assert!(e.remove_data("attempt").is_some());
    assert!(e.data("attempt").is_none());
    assert!(e.data("path").is_some());
}

#[test]
fn test_out_of_memory_never_records_frames() {
    let oom = out_of_memory();
    Unwinder::throw(oom.clone()).unwind_frames([0x1000, 0x1100]);
    oom.append_stack_frame(StackIp(0x1200), EhFrameFlags::empty());
    assert!(!oom.has_been_thrown());
    assert!(oom::is_preallocated(&oom));
    assert!(Arc::ptr_eq(&oom, &out_of_memory()));
}

#[test]
fn test_user_built_out_of_memory_keeps_its_frames() {
    let e = Arc::new(Exception::with_message(core_types().out_of_memory, "array too large"));
    Unwinder::throw(e.clone()).unwind_frames([0x1000, 0x2000]);
    assert!(!oom::is_preallocated(&e));
    assert_eq!(e.stack_ips(), ips(&[0x1000, 0x2000]));
}

#[test]
fn test_restoring_onto_the_preallocated_out_of_memory_is_ignored() {
    let e = Arc::new(Exception::from_message("boom"));
    Unwinder::throw(e.clone()).unwind_frames([0x1000, 0x1100]);
    let state = e.capture_dispatch_state();

    let oom = out_of_memory();
    oom.restore_dispatch_state(&state);
    assert!(oom.stack_ips().is_empty());
    Unwinder::throw(oom.clone()).unwind_frames([0x2000]);
    assert!(!oom.has_been_thrown());
}

#[test]
fn test_bare_rethrow_after_restore_replaces_the_separator() {
    let e = Arc::new(Exception::from_message("boom"));
    Unwinder::throw(e.clone()).unwind_frames([0x1000, 0x1100]);
    let info = ExceptionDispatchInfo::capture(e.clone());
    let rethrown = info.throw::<()>().unwrap_err();

    Unwinder::rethrow(rethrown).unwind_frames([0x2000, 0x2100]);
    assert_eq!(e.stack_ips(), ips(&[0x1000, 0x1100, 0x2000, 0x2100]));
    assert_eq!(separators(&e), 0);
}

#[test]
fn test_rendered_trace_may_start_with_a_separator() {
    let frames = [StackIp::EDI_SEPARATOR, StackIp(0x1000), StackIp(0x2000)];
    let text = DefaultStackTraceFormatter::default().format(&frames);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], EDI_SEPARATOR_LINE);
    assert_eq!(lines[1], "   at <unknown> + 0x1000");
    assert_eq!(lines[2], "   at <unknown> + 0x2000");
}

#[test]
fn test_dump_file_decodes_to_the_live_trace() {
    let e = Arc::new(Exception::from_message("boom"));
    Unwinder::throw(e.clone()).unwind_frames([0x1000, 0x1100]);
    let info = ExceptionDispatchInfo::capture(e.clone());
    Unwinder::throw(info.throw::<()>().unwrap_err()).unwind_frames([0x2000]);

    let bytes = dump::write_dump_file(&e);
    assert_eq!(&bytes[..4], &DUMP_SIGNATURE.to_ne_bytes());

    let record = dump::read_dump_file(&bytes).unwrap();
    assert_eq!(record.type_handle, core_types().exception.as_raw());
    assert_eq!(record.hresult, e.hresult());
    assert_eq!(record.frames, e.stack_ips());

    let restored = Exception::from_dump(&bytes[4..]);
    assert_eq!(restored.stack_ips(), e.stack_ips());
}
