//! `perf script`-compatible text output.
//!
//! Per sample:
//! ```text
//! <thread_name> <pid>/<tid> <sec>.<nsec> [001] cycles:
//! \t<hex-ip> <name>+0x<offset> (<library>)
//! ...
//! <blank line>
//! ```
//! Nanoseconds are zero-padded to 9 digits when seconds are non-zero; with
//! zero seconds the bare nanosecond value is emitted. The output round-trips
//! through FlameGraph's `stackcollapse-perf`, the Firefox Profiler, and
//! speedscope.

use std::io;

use crate::maps::Arch;
use crate::render::{Renderer, fixup_ip};
use crate::sample::Sample;
use crate::symbolize::Symbolizer;

pub struct PerfScriptRenderer {
    arch: Arch,
}

impl PerfScriptRenderer {
    pub fn new(arch: Arch) -> Self {
        Self { arch }
    }
}

fn timestamp(sec: i64, nsec: u32) -> String {
    if sec == 0 {
        format!("0.{nsec}")
    } else {
        format!("{sec}.{nsec:09}")
    }
}

impl Renderer for PerfScriptRenderer {
    fn consume_single_sample(
        &mut self,
        sample: &Sample,
        symbolizer: &Symbolizer,
    ) -> io::Result<Vec<u8>> {
        let name = if sample.thread_name.is_empty() {
            "unknown"
        } else {
            &sample.thread_name
        };
        let mut out = format!(
            "{} {}/{} {} [001] cycles:\n",
            name,
            sample.pid,
            sample.tid,
            timestamp(sample.time_sec, sample.time_nsec),
        );
        for (index, frame) in sample.frames.iter().enumerate() {
            if frame.ip == 0 || frame.is_end_marker() {
                continue;
            }
            let ip = fixup_ip(frame.ip, index, self.arch);
            let resolved = symbolizer.symbolize_ip(ip);
            for single in &resolved.frames {
                out.push_str(&format!(
                    "\t{:x} {}+0x{:x} ({})\n",
                    ip,
                    single.function_name,
                    single.function_offset,
                    single.library.as_deref().unwrap_or("unknown"),
                ));
            }
        }
        out.push('\n');
        Ok(out.into_bytes())
    }

    fn finalise(&mut self, _symbolizer: &Symbolizer) -> io::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}
