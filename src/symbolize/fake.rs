//! Deterministic backend for tests: no file access, fixed answers.

use crate::error::Result;
use crate::maps::DynamicLibMapping;
use crate::symbolize::{SingleFrame, SymbolizeBackend};

/// Resolves every address to `fake+0x5` in the queried library, with
/// `address` set to the translated file-virtual address. Lets tests assert
/// the full pipeline without touching real object files.
pub struct FakeBackend;

impl SymbolizeBackend for FakeBackend {
    fn symbolize(&self, mapping: &DynamicLibMapping, file_vaddr: u64) -> Result<Vec<SingleFrame>> {
        Ok(vec![SingleFrame {
            address: file_vaddr,
            function_name: "fake".to_string(),
            function_offset: 5,
            library: Some(mapping.library_label().to_string()),
            vmap: Some(mapping.clone()),
            source_file: None,
            source_line: None,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::Arch;

    #[test]
    fn fixed_answer() {
        let mapping = DynamicLibMapping {
            path: "/lib/libfoo.so".to_string(),
            arch: Arch::X86_64,
            slide: 0x1000,
            start: 0x2000,
            end: 0x3000,
        };
        let frames = FakeBackend.symbolize(&mapping, 0x1345).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].function_name, "fake");
        assert_eq!(frames[0].function_offset, 5);
        assert_eq!(frames[0].address, 0x1345);
    }
}
