use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode};

pub mod cli;
pub mod config;
pub mod error;
pub mod types;
pub mod utils;
pub mod value;
pub mod vm;

pub use config::RuntimeConfig;
pub use error::{DumpError, RuntimeError, RuntimeResult};
pub use types::{core_types, TypeBuilder, TypeCatalog, TypeHandle, TypeRegistry};
pub use value::{ObjectHeader, ObjectRef, HEADER_SIZE, TYPE_HANDLE_OFFSET};
pub use vm::{
    exceptions::{Exception, ExceptionDispatchInfo, StackIp, Unwinder},
    gc::{CollectionMode, GcBridge, GcContext, ManagedHeap},
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Object model and exception state tooling for a .NET-style runtime"
)]
pub struct Args {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decode a serialized exception dump and print its frames
    Decode {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Throw, rethrow and restore an exception, then print it and its dump record
    Demo {
        /// Also write the dump record, with signature, to this file
        #[arg(long, value_name = "FILE")]
        dump_out: Option<PathBuf>,
    },
    /// Report unmanaged allocations to the pressure controller
    Pressure {
        #[arg(value_name = "BYTES", required = true)]
        bytes: Vec<i64>,
        /// Minimum trigger budget in bytes
        #[arg(long, value_name = "BYTES")]
        min_budget: Option<u64>,
        /// Report the sizes as frees instead of allocations
        #[arg(long)]
        remove: bool,
    },
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();
    cli::init_logging(args.verbose);

    let result = match args.command {
        Command::Decode { file } => cli::decode(&file),
        Command::Demo { dump_out } => cli::demo(dump_out.as_deref()),
        Command::Pressure {
            bytes,
            min_budget,
            remove,
        } => cli::pressure(&bytes, min_budget, remove),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}
