//! Output of CLI results, as text or JSON.

use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::Serialize;

use crate::cli::args::{OutputFormat, TesseraArgs};
use crate::error::Result;
use crate::index::check_index::CheckIndexStatus;

/// Results that know how to print themselves for people.
pub trait HumanOutput {
    fn write_human(&self, out: &mut dyn Write) -> io::Result<()>;
}

#[derive(Debug, Serialize)]
pub struct IndexingResult {
    pub documents_added: u64,
    pub documents_rejected: u64,
    pub generation: u64,
    pub segments: usize,
    pub num_docs: u64,
    pub duration_ms: u128,
    pub docs_per_second: f64,
}

#[derive(Debug, Serialize)]
pub struct SegmentStats {
    pub name: String,
    pub codec: String,
    pub max_doc: u32,
    pub del_count: u32,
    pub size_bytes: u64,
    pub source: Option<String>,
    pub del_gen: i64,
    pub dv_gen: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize)]
pub struct IndexStats {
    pub generation: u64,
    pub version: u64,
    pub total_max_doc: u64,
    pub total_num_docs: u64,
    pub size_bytes: u64,
    pub user_data: BTreeMap<String, String>,
    pub segments: Vec<SegmentStats>,
}

#[derive(Debug, Serialize)]
pub struct MergeResult {
    pub segments_before: usize,
    pub segments_after: usize,
    pub num_docs: u64,
    pub generation: u64,
    pub duration_ms: u128,
}

#[derive(Debug, Serialize)]
pub struct SearchHit {
    pub doc: u32,
    pub fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct SearchResults {
    pub field: String,
    pub term: String,
    pub doc_freq: u64,
    pub total_hits: usize,
    pub hits: Vec<SearchHit>,
    pub duration_ms: u128,
}

/// Print `result` to stdout in the requested format.
pub fn output_result<T: Serialize + HumanOutput>(result: &T, args: &TesseraArgs) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_result(result, args.output_format, args.pretty, &mut out)
}

pub fn write_result<T: Serialize + HumanOutput>(
    result: &T,
    format: OutputFormat,
    pretty: bool,
    out: &mut dyn Write,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let json = if pretty {
                serde_json::to_string_pretty(result)?
            } else {
                serde_json::to_string(result)?
            };
            writeln!(out, "{json}")?;
        }
        OutputFormat::Human => result.write_human(out)?,
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

impl HumanOutput for IndexingResult {
    fn write_human(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "Indexed {} documents in {} ms ({:.0} docs/s)",
            self.documents_added, self.duration_ms, self.docs_per_second
        )?;
        if self.documents_rejected > 0 {
            writeln!(out, "Rejected {} documents", self.documents_rejected)?;
        }
        writeln!(
            out,
            "Commit generation {}: {} segments, {} live documents",
            self.generation, self.segments, self.num_docs
        )
    }
}

impl HumanOutput for IndexStats {
    fn write_human(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Generation:  {}", self.generation)?;
        writeln!(out, "Version:     {}", self.version)?;
        writeln!(
            out,
            "Documents:   {} live, {} deleted",
            self.total_num_docs,
            self.total_max_doc - self.total_num_docs
        )?;
        writeln!(out, "Size:        {}", format_bytes(self.size_bytes))?;
        for (key, value) in &self.user_data {
            writeln!(out, "User data:   {key}={value}")?;
        }
        writeln!(out)?;
        writeln!(
            out,
            "{:<10} {:>10} {:>10} {:>12} {:<8} {:<10}",
            "SEGMENT", "MAX_DOC", "DELETED", "SIZE", "SOURCE", "CODEC"
        )?;
        for segment in &self.segments {
            writeln!(
                out,
                "{:<10} {:>10} {:>10} {:>12} {:<8} {:<10}",
                segment.name,
                segment.max_doc,
                segment.del_count,
                format_bytes(segment.size_bytes),
                segment.source.as_deref().unwrap_or("-"),
                segment.codec
            )?;
            if let Some(diagnostics) = &segment.diagnostics {
                for (key, value) in diagnostics {
                    writeln!(out, "    {key}: {value}")?;
                }
            }
        }
        Ok(())
    }
}

impl HumanOutput for CheckIndexStatus {
    fn write_human(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "Checking {} ({} segments, {} docs)",
            self.segments_file,
            self.segments.len(),
            self.total_num_docs
        )?;
        for problem in &self.problems {
            writeln!(out, "  ERROR {problem}")?;
        }
        for segment in &self.segments {
            let verdict = if segment.is_clean() { "OK" } else { "BROKEN" };
            writeln!(
                out,
                "  {:<8} {:<6} docs={} deleted={} terms={} postings={} stored={} dv_fields={} vector_fields={} size={}",
                segment.name,
                verdict,
                segment.max_doc,
                segment.del_count,
                segment.terms,
                segment.postings,
                segment.stored_docs,
                segment.doc_values_fields,
                segment.vector_fields,
                format_bytes(segment.size_bytes)
            )?;
            for problem in &segment.problems {
                writeln!(out, "    ERROR {problem}")?;
            }
        }
        if self.is_clean() {
            writeln!(out, "No problems found ({} ms)", self.elapsed_ms)
        } else {
            writeln!(
                out,
                "{} broken segments; their documents would be lost by removing them",
                self.broken_segments().count()
            )
        }
    }
}

impl HumanOutput for MergeResult {
    fn write_human(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "Merged {} segments into {} in {} ms; generation {} holds {} live documents",
            self.segments_before, self.segments_after, self.duration_ms, self.generation, self.num_docs
        )
    }
}

impl HumanOutput for SearchResults {
    fn write_human(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "{}:{} matched {} live documents (doc_freq {}) in {} ms",
            self.field, self.term, self.total_hits, self.doc_freq, self.duration_ms
        )?;
        for hit in &self.hits {
            writeln!(out, "[{}]", hit.doc)?;
            for (name, value) in &hit.fields {
                writeln!(out, "  {name}: {value}")?;
            }
        }
        Ok(())
    }
}
