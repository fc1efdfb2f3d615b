use dotnet_corelib::{
    vm::exceptions::{Exception, ExceptionDispatchInfo, StackIp, Unwinder},
    vm::gc::ManagedHeap,
    RuntimeConfig,
};
use std::{sync::Arc, thread};

const THREADS: usize = 8;

#[test]
fn test_independent_exceptions_on_many_threads() {
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            thread::spawn(move || {
                let e = Arc::new(Exception::from_message(format!("worker {t}")));
                let depth = t + 1;
                for round in 0..50 {
                    Unwinder::throw(e.clone())
                        .unwind_frames((0..depth).map(|i| 0x1000 * (t + 1) + i * 0x10));
                    let info = ExceptionDispatchInfo::capture(e.clone());
                    assert_eq!(info.state().len(), depth, "round {round}");

                    let rethrown = info.throw::<()>().unwrap_err();
                    Unwinder::throw(rethrown).unwind_frames([0xdead_0000 + t]);
                    assert_eq!(e.stack_ips().len(), depth + 2);
                    assert_eq!(e.stack_ips()[depth], StackIp::EDI_SEPARATOR);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_concurrent_restores_of_one_exception_stay_consistent() {
    let e = Arc::new(Exception::from_message("shared"));
    let snapshots: Vec<ExceptionDispatchInfo> = (0..THREADS)
        .map(|t| {
            Unwinder::throw(e.clone()).unwind_frames((0..=t).map(|i| 0x1000 * (t + 1) + i));
            ExceptionDispatchInfo::capture(e.clone())
        })
        .collect();

    let workers: Vec<_> = snapshots
        .iter()
        .cloned()
        .map(|info| {
            thread::spawn(move || {
                for _ in 0..100 {
                    let _ = info.throw::<()>();
                    let _ = info.source_exception().capture_dispatch_state();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let frames = e.stack_ips();
    assert_eq!(frames.last(), Some(&StackIp::EDI_SEPARATOR));
    let prefix = &frames[..frames.len() - 1];
    assert!(
        snapshots.iter().any(|s| s.state().frames() == prefix),
        "trace is not one of the captured states: {frames:?}"
    );
}

#[test]
fn test_pressure_reports_from_many_threads() {
    let config = RuntimeConfig::default().with_min_pressure_budget(u64::MAX / 2);
    let heap = ManagedHeap::new(config);
    let shared = heap.shared();

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let shared = shared.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    shared.add_memory_pressure(3).unwrap();
                    shared.remove_memory_pressure(1).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let snapshot = shared.pressure().snapshot();
    assert_eq!(snapshot.added.iter().sum::<i64>(), 3 * 1000 * THREADS as i64);
    assert_eq!(snapshot.removed.iter().sum::<i64>(), 1000 * THREADS as i64);
    assert!(!shared.has_pending_collection());
}
