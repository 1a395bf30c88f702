//! pprof protobuf output.
//!
//! Accumulates interned string/function/location/mapping tables across all
//! consumed samples and emits one gzip-compressed `profile.proto` at
//! finalise. Each captured sample becomes a pprof sample with
//! `value = [1, time_delta_nanos]` where the delta is the wall-clock gap to
//! the previous sample (0 for the first).

use std::collections::HashMap;
use std::io::{self, Write};

use flate2::Compression;
use flate2::write::GzEncoder;
use prost::Message;

use crate::maps::{Arch, DynamicLibMapping};
use crate::render::pprof_proto as proto;
use crate::render::{Renderer, fixup_ip};
use crate::sample::Sample;
use crate::symbolize::Symbolizer;

pub struct PprofRenderer {
    arch: Arch,
    strings: Vec<String>,
    string_index: HashMap<String, i64>,
    functions: HashMap<(i64, i64), u64>,
    function_table: Vec<proto::Function>,
    locations: HashMap<u64, u64>,
    location_table: Vec<proto::Location>,
    mapping_ids: HashMap<String, u64>,
    mapping_table: Vec<proto::Mapping>,
    samples: Vec<proto::Sample>,
    first_time_nanos: Option<i64>,
    prev_time_nanos: Option<i64>,
    last_time_nanos: i64,
}

impl PprofRenderer {
    pub fn new(arch: Arch) -> Self {
        let mut renderer = Self {
            arch,
            strings: Vec::new(),
            string_index: HashMap::new(),
            functions: HashMap::new(),
            function_table: Vec::new(),
            locations: HashMap::new(),
            location_table: Vec::new(),
            mapping_ids: HashMap::new(),
            mapping_table: Vec::new(),
            samples: Vec::new(),
            first_time_nanos: None,
            prev_time_nanos: None,
            last_time_nanos: 0,
        };
        // string_table[0] must always be "".
        renderer.intern("");
        renderer
    }

    fn intern(&mut self, s: &str) -> i64 {
        if let Some(&idx) = self.string_index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as i64;
        self.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), idx);
        idx
    }

    fn mapping_id(&mut self, mapping: &DynamicLibMapping) -> u64 {
        if let Some(&id) = self.mapping_ids.get(&mapping.path) {
            return id;
        }
        let filename = self.intern(&mapping.path);
        let id = self.mapping_table.len() as u64 + 1;
        self.mapping_table.push(proto::Mapping {
            id,
            memory_start: mapping.start,
            memory_limit: mapping.end,
            file_offset: mapping.start.wrapping_sub(mapping.slide),
            filename,
            has_functions: true,
            ..Default::default()
        });
        self.mapping_ids.insert(mapping.path.clone(), id);
        id
    }

    fn function_id(&mut self, name: &str, file: Option<&str>) -> u64 {
        let name_idx = self.intern(name);
        let file_idx = file.map(|f| self.intern(f)).unwrap_or(0);
        if let Some(&id) = self.functions.get(&(name_idx, file_idx)) {
            return id;
        }
        let id = self.function_table.len() as u64 + 1;
        self.function_table.push(proto::Function {
            id,
            name: name_idx,
            system_name: name_idx,
            filename: file_idx,
            start_line: 0,
        });
        self.functions.insert((name_idx, file_idx), id);
        id
    }

    fn location_id(&mut self, ip: u64, symbolizer: &Symbolizer) -> u64 {
        if let Some(&id) = self.locations.get(&ip) {
            return id;
        }
        let resolved = symbolizer.symbolize_ip(ip);
        // The physical frame (last entry) carries the mapping.
        let mapping_id = resolved
            .frames
            .last()
            .and_then(|f| f.vmap.clone())
            .map(|m| self.mapping_id(&m))
            .unwrap_or(0);
        // pprof line[0] is the innermost inlinee, matching our frame order.
        let mut lines = Vec::with_capacity(resolved.frames.len());
        for single in &resolved.frames {
            let function_id =
                self.function_id(&single.function_name, single.source_file.as_deref());
            lines.push(proto::Line {
                function_id,
                line: single.source_line.unwrap_or(0) as i64,
            });
        }
        let id = self.location_table.len() as u64 + 1;
        self.location_table.push(proto::Location {
            id,
            mapping_id,
            address: ip,
            line: lines,
            is_folded: false,
        });
        self.locations.insert(ip, id);
        id
    }
}

impl Renderer for PprofRenderer {
    fn consume_single_sample(
        &mut self,
        sample: &Sample,
        symbolizer: &Symbolizer,
    ) -> io::Result<Vec<u8>> {
        let time_nanos = sample.time_sec * 1_000_000_000 + sample.time_nsec as i64;
        let delta = self
            .prev_time_nanos
            .map(|prev| (time_nanos - prev).max(0))
            .unwrap_or(0);
        self.prev_time_nanos = Some(time_nanos);
        if self.first_time_nanos.is_none() {
            self.first_time_nanos = Some(time_nanos);
        }
        self.last_time_nanos = time_nanos;

        let mut location_ids = Vec::with_capacity(sample.frames.len());
        for (index, frame) in sample.frames.iter().enumerate() {
            if frame.ip == 0 || frame.is_end_marker() {
                continue;
            }
            let ip = fixup_ip(frame.ip, index, self.arch);
            location_ids.push(self.location_id(ip, symbolizer));
        }
        self.samples.push(proto::Sample {
            location_id: location_ids,
            value: vec![1, delta],
            label: Vec::new(),
        });
        Ok(Vec::new())
    }

    fn finalise(&mut self, _symbolizer: &Symbolizer) -> io::Result<Vec<u8>> {
        let samples_type = self.intern("samples");
        let count_unit = self.intern("count");
        let time_type = self.intern("time");
        let nanos_unit = self.intern("nanoseconds");

        let first = self.first_time_nanos.unwrap_or(0);
        let profile = proto::Profile {
            sample_type: vec![
                proto::ValueType {
                    r#type: samples_type,
                    unit: count_unit,
                },
                proto::ValueType {
                    r#type: time_type,
                    unit: nanos_unit,
                },
            ],
            sample: std::mem::take(&mut self.samples),
            mapping: std::mem::take(&mut self.mapping_table),
            location: std::mem::take(&mut self.location_table),
            function: std::mem::take(&mut self.function_table),
            string_table: self.strings.clone(),
            time_nanos: first,
            duration_nanos: (self.last_time_nanos - first).max(0),
            ..Default::default()
        };

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&profile.encode_to_vec())?;
        encoder.finish()
    }
}
