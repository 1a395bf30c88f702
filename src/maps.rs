//! Loaded-object mappings: the runtime address ranges of every executable,
//! file-backed segment in the process, snapshotted from `/proc/self/maps`.
//!
//! A mapping's `slide` is the constant added to a file-virtual address to
//! obtain its runtime address, so `file_vaddr = ip - slide`. The snapshot is
//! taken once per sampling session; captured IPs are only resolved against
//! the mappings that were live when they were captured.

use std::fs;
use std::io;
use std::path::Path;

/// Architecture of a mapped object, as far as the renderers care: it decides
/// the return-address→call-site adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
    Other,
}

impl Arch {
    /// The architecture this process was compiled for.
    pub fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Arch::X86_64
        } else if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else {
            Arch::Other
        }
    }

    /// How far to move a return address back to land inside the call
    /// instruction. Fixed-width ARM calls are 4 bytes; everything else gets
    /// the conservative 1.
    pub fn call_site_adjust(self) -> u64 {
        match self {
            Arch::Aarch64 => 4,
            Arch::X86_64 | Arch::Other => 1,
        }
    }
}

/// One executable, file-backed segment of a loaded shared object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicLibMapping {
    pub path: String,
    pub arch: Arch,
    /// `runtime_addr = file_vaddr + slide` for addresses in this segment.
    pub slide: u64,
    /// Half-open runtime range `start..end`.
    pub start: u64,
    pub end: u64,
}

impl DynamicLibMapping {
    pub fn contains(&self, ip: u64) -> bool {
        ip >= self.start && ip < self.end
    }

    /// Translate a runtime address inside this mapping back into the
    /// library's file-virtual address space. Offset 0 (IP at the very start
    /// of the mapping's file range) is legal.
    pub fn file_vaddr(&self, ip: u64) -> u64 {
        ip.wrapping_sub(self.slide)
    }

    /// Short label for output: the file name, with a trailing `.so`
    /// stripped (`/lib/libfoo.so` → `libfoo`, `libc.so.6` stays itself).
    pub fn library_label(&self) -> &str {
        let name = Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.path);
        name.strip_suffix(".so").unwrap_or(name)
    }
}

/// The set of mappings live at one instant, sorted by start address.
#[derive(Debug, Clone, Default)]
pub struct MappingSnapshot {
    mappings: Vec<DynamicLibMapping>,
}

impl MappingSnapshot {
    /// Snapshot the current process's executable mappings.
    pub fn capture() -> io::Result<Self> {
        let maps = fs::read_to_string("/proc/self/maps")?;
        let mut mappings: Vec<_> = maps.lines().filter_map(parse_maps_line).collect();
        mappings.sort_by_key(|m| m.start);
        Ok(Self { mappings })
    }

    /// Build a snapshot from explicit mappings (tests, replay).
    pub fn from_mappings(mut mappings: Vec<DynamicLibMapping>) -> Self {
        mappings.sort_by_key(|m| m.start);
        Self { mappings }
    }

    /// Find the mapping containing `ip`, by binary search on the sorted
    /// start addresses.
    pub fn lookup(&self, ip: u64) -> Option<&DynamicLibMapping> {
        let idx = self.mappings.partition_point(|m| m.start <= ip);
        let candidate = self.mappings.get(idx.checked_sub(1)?)?;
        candidate.contains(ip).then_some(candidate)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DynamicLibMapping> {
        self.mappings.iter()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// Parse one `/proc/self/maps` line into a mapping.
///
/// Only executable, file-backed segments qualify; anonymous segments and
/// pseudo-paths like `[vdso]` are skipped.
fn parse_maps_line(line: &str) -> Option<DynamicLibMapping> {
    let mut parts = line.split_whitespace();
    let addr_range = parts.next()?;
    let perms = parts.next()?;
    if !perms.contains('x') {
        return None;
    }
    let offset_str = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let path = parts.next()?;
    if !path.starts_with('/') {
        return None;
    }

    let (start_str, end_str) = addr_range.split_once('-')?;
    let start = u64::from_str_radix(start_str, 16).ok()?;
    let end = u64::from_str_radix(end_str, 16).ok()?;
    let offset = u64::from_str_radix(offset_str, 16).ok()?;

    Some(DynamicLibMapping {
        path: path.to_string(),
        arch: Arch::host(),
        slide: start.wrapping_sub(offset),
        start,
        end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(path: &str, slide: u64, start: u64, end: u64) -> DynamicLibMapping {
        DynamicLibMapping {
            path: path.to_string(),
            arch: Arch::X86_64,
            slide,
            start,
            end,
        }
    }

    #[test]
    fn parse_maps_line_executable() {
        let line = "55a4b2c00000-55a4b2c05000 r-xp 00001000 08:01 1234 /usr/bin/foo";
        let m = parse_maps_line(line).unwrap();
        assert_eq!(m.start, 0x55a4b2c00000);
        assert_eq!(m.end, 0x55a4b2c05000);
        assert_eq!(m.path, "/usr/bin/foo");
        assert_eq!(m.slide, 0x55a4b2c00000 - 0x1000);
        assert_eq!(m.file_vaddr(0x55a4b2c01000), 0x2000);
    }

    #[test]
    fn parse_maps_line_non_executable() {
        let line = "7f1234000000-7f1234001000 r--p 00000000 08:01 1234 /usr/lib/foo.so";
        assert!(parse_maps_line(line).is_none());
    }

    #[test]
    fn parse_maps_line_pseudo_path() {
        let line = "7ffd12300000-7ffd12321000 r-xp 00000000 00:00 0 [vdso]";
        assert!(parse_maps_line(line).is_none());
    }

    #[test]
    fn parse_maps_line_anon() {
        let line = "7f1234000000-7f1234001000 r-xp 00000000 00:00 0";
        assert!(parse_maps_line(line).is_none());
    }

    #[test]
    fn parse_maps_line_malformed() {
        assert!(parse_maps_line("garbage").is_none());
        assert!(parse_maps_line("").is_none());
        assert!(parse_maps_line("not-hex r-xp 00000000 08:01 1234 /foo").is_none());
    }

    #[test]
    fn lookup_hits_containing_mapping() {
        let snap = MappingSnapshot::from_mappings(vec![
            mapping("/lib/libbar.so", 0, 0x1000, 0x2000),
            mapping("/lib/libfoo.so", 0x1000, 0x2000, 0x3000),
        ]);
        let m = snap.lookup(0x2345).unwrap();
        assert_eq!(m.path, "/lib/libfoo.so");
        assert_eq!(m.file_vaddr(0x2345), 0x1345);
    }

    #[test]
    fn lookup_start_is_inclusive_end_is_exclusive() {
        let snap = MappingSnapshot::from_mappings(vec![mapping("/lib/a.so", 0, 0x2000, 0x3000)]);
        assert!(snap.lookup(0x2000).is_some());
        assert!(snap.lookup(0x2fff).is_some());
        assert!(snap.lookup(0x3000).is_none());
        assert!(snap.lookup(0x1fff).is_none());
    }

    #[test]
    fn lookup_empty_snapshot() {
        assert!(MappingSnapshot::default().lookup(0x1234).is_none());
    }

    #[test]
    fn library_label_strips_so_suffix() {
        assert_eq!(
            mapping("/lib/libfoo.so", 0, 0, 1).library_label(),
            "libfoo"
        );
        assert_eq!(
            mapping("/lib/x86_64/libc.so.6", 0, 0, 1).library_label(),
            "libc.so.6"
        );
        assert_eq!(mapping("/usr/bin/foo", 0, 0, 1).library_label(), "foo");
    }

    #[test]
    fn capture_contains_own_executable() {
        let snap = MappingSnapshot::capture().unwrap();
        assert!(!snap.is_empty());
        // This very function lives in some executable mapping.
        let here = capture_contains_own_executable as usize as u64;
        assert!(snap.lookup(here).is_some());
    }
}
