//! Folded-stack ("collapsed") output for FlameGraph tooling.
//!
//! One line per sample: frames outermost→innermost joined with `;`, a
//! space, then the capture timestamp as a single decimal integer
//! (`sec * 1e9 + nsec`, emitted as the literal concatenation of seconds and
//! 9-digit zero-padded nanoseconds; bare nanoseconds when seconds is zero).

use std::io;

use crate::maps::Arch;
use crate::render::{Renderer, fixup_ip};
use crate::sample::Sample;
use crate::symbolize::Symbolizer;

pub struct CollapsedRenderer {
    arch: Arch,
}

impl CollapsedRenderer {
    pub fn new(arch: Arch) -> Self {
        Self { arch }
    }
}

/// The folded timestamp suffix: `(4, 5)` → `"4000000005"`, `(0, 5)` → `"5"`.
pub(crate) fn encode_time(sec: i64, nsec: u32) -> String {
    if sec == 0 {
        format!("{nsec}")
    } else {
        format!("{sec}{nsec:09}")
    }
}

impl Renderer for CollapsedRenderer {
    fn consume_single_sample(
        &mut self,
        sample: &Sample,
        symbolizer: &Symbolizer,
    ) -> io::Result<Vec<u8>> {
        // Resolve innermost-first, then reverse the whole flattened list so
        // inlined frames keep their relative order within the fold.
        let mut names: Vec<String> = Vec::with_capacity(sample.frames.len());
        for (index, frame) in sample.frames.iter().enumerate() {
            if frame.ip == 0 || frame.is_end_marker() {
                continue;
            }
            let ip = fixup_ip(frame.ip, index, self.arch);
            let resolved = symbolizer.symbolize_ip(ip);
            for single in &resolved.frames {
                names.push(single.function_name.clone());
            }
        }
        names.reverse();

        let mut line = names.join(";");
        line.push(' ');
        line.push_str(&encode_time(sample.time_sec, sample.time_nsec));
        line.push('\n');
        Ok(line.into_bytes())
    }

    fn finalise(&mut self, _symbolizer: &Symbolizer) -> io::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::{DynamicLibMapping, MappingSnapshot};
    use crate::sample::StackFrame;
    use crate::symbolize::FakeBackend;
    use std::sync::Arc;

    fn fake_symbolizer() -> Symbolizer {
        let snapshot = Arc::new(MappingSnapshot::from_mappings(vec![DynamicLibMapping {
            path: "/lib/libfoo.so".to_string(),
            arch: Arch::X86_64,
            slide: 0x1000,
            start: 0x2000,
            end: 0x3000,
        }]));
        Symbolizer::new(snapshot, Box::new(FakeBackend))
    }

    #[test]
    fn time_encoding() {
        assert_eq!(encode_time(4, 5), "4000000005");
        assert_eq!(encode_time(0, 5), "5");
        assert_eq!(encode_time(4, 987_654_321), "4987654321");
        assert_eq!(encode_time(0, 0), "0");
    }

    #[test]
    fn frames_fold_outermost_first() {
        let symbolizer = fake_symbolizer();
        let mut renderer = CollapsedRenderer::new(Arch::X86_64);
        let sample = Sample {
            pid: 1,
            tid: 2,
            thread_name: "t".to_string(),
            time_sec: 4,
            time_nsec: 5,
            // Innermost at 0x2345, caller at 0x9999 (unmapped).
            frames: vec![StackFrame::new(0x2345, 0x7000), StackFrame::new(0x9999, 0x7040)],
        };
        let line = String::from_utf8(
            renderer
                .consume_single_sample(&sample, &symbolizer)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(line, "unknown @ 0x9998;fake 4000000005\n");
    }

    #[test]
    fn empty_stack_folds_to_bare_count() {
        let symbolizer = fake_symbolizer();
        let mut renderer = CollapsedRenderer::new(Arch::X86_64);
        let sample = Sample::empty(1, 2, "t".to_string(), 0, 5);
        let line = String::from_utf8(
            renderer
                .consume_single_sample(&sample, &symbolizer)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(line, " 5\n");
    }

    #[test]
    fn finalise_is_empty() {
        let symbolizer = fake_symbolizer();
        let mut renderer = CollapsedRenderer::new(Arch::X86_64);
        assert!(renderer.finalise(&symbolizer).unwrap().is_empty());
    }
}
