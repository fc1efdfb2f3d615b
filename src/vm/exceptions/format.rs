//! Rendering captured frames as text.
use super::trace::StackIp;
use std::fmt::{self, Write};

pub const EDI_SEPARATOR_LINE: &str =
    "--- End of stack trace from previous location where exception was thrown ---";

/// Maps an instruction address to a method name, when one is known.
pub trait SymbolResolver {
    fn resolve(&self, ip: StackIp) -> Option<String>;
}

/// Resolves nothing; every frame prints as a raw address.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn resolve(&self, _: StackIp) -> Option<String> {
        None
    }
}

impl<F: Fn(StackIp) -> Option<String>> SymbolResolver for F {
    fn resolve(&self, ip: StackIp) -> Option<String> {
        self(ip)
    }
}

pub trait StackTraceFormatter {
    fn write_trace(&self, ips: &[StackIp], out: &mut dyn Write) -> fmt::Result;

    fn format(&self, ips: &[StackIp]) -> String {
        let mut out = String::new();
        match self.write_trace(ips, &mut out) {
            Ok(()) => out,
            Err(_) => {
                tracing::warn!(frames = ips.len(), "stack trace formatting failed");
                String::new()
            }
        }
    }
}

/// One `   at` line per frame; dispatch-info boundaries get their own line
/// and null entries are skipped.
pub struct DefaultStackTraceFormatter<R = NoSymbols> {
    resolver: R,
}

impl Default for DefaultStackTraceFormatter {
    fn default() -> Self {
        Self { resolver: NoSymbols }
    }
}

impl<R: SymbolResolver> DefaultStackTraceFormatter<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }
}

impl<R: SymbolResolver> StackTraceFormatter for DefaultStackTraceFormatter<R> {
    fn write_trace(&self, ips: &[StackIp], out: &mut dyn Write) -> fmt::Result {
        let mut first = true;
        for &ip in ips {
            if ip == StackIp::NULL {
                continue;
            }
            if !first {
                out.write_char('\n')?;
            }
            first = false;
            if ip.is_separator() {
                out.write_str(EDI_SEPARATOR_LINE)?;
                continue;
            }
            match self.resolver.resolve(ip) {
                Some(name) => write!(out, "   at {name}")?,
                None => write!(out, "   at <unknown> + {ip}")?,
            }
        }
        Ok(())
    }
}
