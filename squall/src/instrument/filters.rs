// Named instrumentation filters
//
// The analyzer can scope feature activation to subsets of pipelines
// by name substring or pipeline type. Filters are identified by an
// externally supplied guid; setting an existing guid replaces the
// entry in place so the effective ordering never shifts under the
// analyzer's feet.
//
// Austin Shafer - 2025

use super::pipeline::{PipelineRecord, PipelineType};

#[derive(Debug, Clone)]
pub struct FilterEntry {
    pub guid: u64,
    pub name_substring: Option<String>,
    pub pipeline_type: Option<PipelineType>,
    /// Feature bits this filter contributes to matching pipelines
    pub features: u64,
    /// Specialization stream layered onto matching pipelines
    pub specialization: Vec<u8>,
}

impl FilterEntry {
    pub fn matches(&self, record: &PipelineRecord) -> bool {
        if let Some(ptype) = self.pipeline_type {
            if record.pipeline_type() != ptype {
                return false;
            }
        }
        if let Some(sub) = self.name_substring.as_ref() {
            if !record.name().contains(sub.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Default)]
pub struct FilterList {
    fl_entries: Vec<FilterEntry>,
}

impl FilterList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by guid, preserving position on replace
    pub fn set_or_add(&mut self, entry: FilterEntry) {
        match self.fl_entries.iter_mut().find(|e| e.guid == entry.guid) {
            Some(existing) => *existing = entry,
            None => self.fl_entries.push(entry),
        }
    }

    pub fn remove(&mut self, guid: u64) -> bool {
        let before = self.fl_entries.len();
        self.fl_entries.retain(|e| e.guid != guid);
        self.fl_entries.len() != before
    }

    /// Every filter matching this pipeline, in list order
    pub fn matching<'a>(
        &'a self,
        record: &'a PipelineRecord,
    ) -> impl Iterator<Item = &'a FilterEntry> {
        self.fl_entries.iter().filter(move |e| e.matches(record))
    }

    pub fn is_empty(&self) -> bool {
        self.fl_entries.is_empty()
    }
}
