//! Renderers: raw samples + symbolized frames → one of the wire formats.
//!
//! A renderer is driven single-threaded by the post-pass: every sample goes
//! through [`Renderer::consume_single_sample`] in spool order, then
//! [`Renderer::finalise`] emits whatever the format holds back until the end
//! (everything, for pprof). Renderers may be stateful and are not required
//! to be thread-safe.

pub mod collapsed;
pub mod perf_script;
pub mod pprof;
pub mod pprof_proto;

use std::io;

use crate::maps::Arch;
use crate::sample::Sample;
use crate::symbolize::Symbolizer;

pub use collapsed::CollapsedRenderer;
pub use perf_script::PerfScriptRenderer;
pub use pprof::PprofRenderer;

pub trait Renderer {
    /// Render one sample; the returned bytes go straight to the sink (and
    /// may be empty for accumulating formats).
    fn consume_single_sample(
        &mut self,
        sample: &Sample,
        symbolizer: &Symbolizer,
    ) -> io::Result<Vec<u8>>;

    /// Emit whatever the format requires at end-of-stream. Zero consumed
    /// samples must still produce syntactically valid output.
    fn finalise(&mut self, symbolizer: &Symbolizer) -> io::Result<Vec<u8>>;
}

/// The output formats the post-pass can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    PerfScript,
    Collapsed,
    Pprof,
}

impl OutputFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "perf" | "perf-script" | "perf_script" => Some(OutputFormat::PerfScript),
            "collapsed" | "folded" => Some(OutputFormat::Collapsed),
            "pprof" => Some(OutputFormat::Pprof),
            _ => None,
        }
    }

    pub fn new_renderer(self, arch: Arch) -> Box<dyn Renderer> {
        match self {
            OutputFormat::PerfScript => Box::new(PerfScriptRenderer::new(arch)),
            OutputFormat::Collapsed => Box::new(CollapsedRenderer::new(arch)),
            OutputFormat::Pprof => Box::new(PprofRenderer::new(arch)),
        }
    }

    /// MIME type for HTTP responses.
    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::PerfScript | OutputFormat::Collapsed => "text/plain; charset=utf-8",
            OutputFormat::Pprof => "application/octet-stream",
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::PerfScript
    }
}

/// Move a captured address from the return address into the call
/// instruction. Raw samples keep return addresses verbatim; each renderer
/// applies this to every frame except the innermost one, so reanalysis with
/// a different policy stays possible.
pub(crate) fn fixup_ip(ip: u64, frame_index: usize, arch: Arch) -> u64 {
    if frame_index == 0 {
        ip
    } else {
        ip.saturating_sub(arch.call_site_adjust())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn innermost_frame_is_never_adjusted() {
        assert_eq!(fixup_ip(0x1000, 0, Arch::X86_64), 0x1000);
        assert_eq!(fixup_ip(0x1000, 0, Arch::Aarch64), 0x1000);
    }

    #[test]
    fn return_addresses_move_into_the_call() {
        assert_eq!(fixup_ip(0x1000, 1, Arch::X86_64), 0xfff);
        assert_eq!(fixup_ip(0x1000, 3, Arch::Aarch64), 0xffc);
        assert_eq!(fixup_ip(0x1000, 1, Arch::Other), 0xfff);
    }

    #[test]
    fn format_names() {
        assert_eq!(OutputFormat::from_name("perf"), Some(OutputFormat::PerfScript));
        assert_eq!(
            OutputFormat::from_name("collapsed"),
            Some(OutputFormat::Collapsed)
        );
        assert_eq!(OutputFormat::from_name("pprof"), Some(OutputFormat::Pprof));
        assert_eq!(OutputFormat::from_name("svg"), None);
    }
}
