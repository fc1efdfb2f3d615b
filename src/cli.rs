//! Command implementations behind `run_cli`.
use crate::{
    config::RuntimeConfig,
    error::{DumpError, RuntimeError},
    types::core_types,
    vm::{
        exceptions::{
            dump::{self, SerializedException},
            format::{DefaultStackTraceFormatter, StackTraceFormatter},
            Exception, ExceptionDispatchInfo, Unwinder,
        },
        gc::{GcStatus, ManagedHeap},
    },
};
use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
    sync::{atomic::Ordering, Arc},
};
use thiserror::Error;
use tracing::{info, Level};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid dump: {0}")]
    Dump(#[from] DumpError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();
}

fn type_name_for(raw: usize) -> &'static str {
    core_types()
        .all()
        .into_iter()
        .find(|t| t.as_raw() == raw)
        .map_or("<unknown type>", |t| t.name())
}

fn describe(record: &SerializedException) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "type:    {:#x} ({})",
        record.type_handle,
        type_name_for(record.type_handle)
    );
    let _ = writeln!(out, "hresult: {:#010x}", record.hresult);
    let _ = writeln!(out, "frames:  {}", record.frames.len());
    out.push_str(&DefaultStackTraceFormatter::default().format(&record.frames));
    out
}

pub fn decode(file: &Path) -> Result<(), CliError> {
    let bytes = fs::read(file).map_err(|source| CliError::Io {
        path: file.to_path_buf(),
        source,
    })?;
    let record = dump::read_dump_file(&bytes)?;
    println!("{}", describe(&record));
    Ok(())
}

fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", row * 16);
        for byte in chunk {
            let _ = write!(out, " {byte:02x}");
        }
        out.push('\n');
    }
    out
}

pub fn demo(dump_out: Option<&Path>) -> Result<(), CliError> {
    let core = core_types();
    let cause = Arc::new(Exception::with_message(
        core.invalid_operation,
        "Collection was modified; enumeration operation may not execute.",
    ));
    let exception = Arc::new(Exception::with_inner(
        core.exception,
        "Processing the batch failed.",
        cause,
    ));

    // thrown three frames deep, caught, then captured for a later rethrow
    Unwinder::throw(exception.clone()).unwind_frames([0x7ff6_1000, 0x7ff6_2000, 0x7ff6_3000]);
    let info = ExceptionDispatchInfo::capture(exception.clone());

    // a bare rethrow from the catch handler replaces the handler's frame
    Unwinder::rethrow(exception.clone()).unwind_frames([0x7ff6_3400]);

    // later, on the continuation, the captured state is thrown again
    if let Err(rethrown) = info.throw::<()>() {
        Unwinder::throw(rethrown).unwind_frames([0x7ff6_9000, 0x7ff6_a000]);
    }

    println!("{exception}");
    println!();
    let record = exception.serialize_for_dump();
    println!("dump record ({} bytes):", record.len());
    print!("{}", hex_dump(&record));

    if let Some(path) = dump_out {
        fs::write(path, dump::write_dump_file(&exception)).map_err(|source| CliError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "wrote dump file");
    }
    Ok(())
}

pub fn pressure(sizes: &[i64], min_budget: Option<u64>, remove: bool) -> Result<(), CliError> {
    let mut config = RuntimeConfig::default();
    if let Some(budget) = min_budget {
        config = config.with_min_pressure_budget(budget);
    }
    let mut heap = ManagedHeap::new(config);
    let shared = heap.shared();

    for &size in sizes {
        let before = heap.collection_count(2);
        heap.mutate(|ctx| {
            if remove {
                ctx.remove_memory_pressure(size)
            } else {
                ctx.add_memory_pressure(size)
            }
        })?;
        let collected = heap.collection_count(2) > before;
        println!(
            "{} {size:>12} bytes  gen2 collections: {}{}",
            if remove { "remove" } else { "add   " },
            heap.collection_count(2),
            if collected { "  (collection triggered)" } else { "" }
        );
    }

    let snapshot = shared.pressure().snapshot();
    println!("iteration:  {}", snapshot.iteration);
    println!("added:      {:?}", snapshot.added);
    println!("removed:    {:?}", snapshot.removed);
    println!(
        "requests:   {}",
        shared.metrics().pressure_collections.load(Ordering::Relaxed)
    );
    println!("heap bytes: {}", shared.current_object_size());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::exceptions::StackIp;

    #[test]
    fn test_describe_segments_on_separator() {
        let record = SerializedException {
            type_handle: core_types().exception.as_raw(),
            hresult: 0x8013_1500_u32 as i32,
            frames: vec![StackIp(0x10), StackIp::EDI_SEPARATOR, StackIp(0x20)],
        };
        let text = describe(&record);
        assert!(text.contains("(System.Exception)"));
        assert!(text.contains("hresult: 0x80131500"));
        assert!(text.contains(crate::vm::exceptions::format::EDI_SEPARATOR_LINE));
    }

    #[test]
    fn test_hex_dump_rows() {
        let text = hex_dump(&[0xab; 20]);
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with("00000000  ab ab"));
        assert!(text.lines().nth(1).unwrap().starts_with("00000010  ab"));
    }

    #[test]
    fn test_pressure_rejects_zero() {
        assert!(matches!(
            pressure(&[0], None, false),
            Err(CliError::Runtime(RuntimeError::ArgumentOutOfRange { .. }))
        ));
    }
}
