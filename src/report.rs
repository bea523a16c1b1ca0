//! CSV records and a human readable summary of benchmark results.
use crate::format_size_fixed_int;
use crate::harness::BenchmarkResult;
use std::io::{self, Write};

pub const CSV_HEADER: &str =
    "BufferSize,PaddedElementSize,PageSize,NumLogicalLoads,Cycles,L1DMisses,L2Misses,L3Misses,TLBMisses";

/// Writes one header line followed by one row per result
pub struct CsvWriter<W: Write> {
    out: W,
}

impl<W: Write> CsvWriter<W> {
    pub fn new(out: W) -> Self {
        CsvWriter { out }
    }

    pub fn write_header(&mut self) -> io::Result<()> {
        writeln!(self.out, "{}", CSV_HEADER)
    }

    pub fn write_row(&mut self, result: &BenchmarkResult) -> io::Result<()> {
        writeln!(
            self.out,
            "{},{},{},{},{},{},{},{},{}",
            result.buffer_size,
            result.padded_element_size,
            result.page_size,
            result.num_logical_loads,
            result.cycle_count,
            result.l1d_miss_count,
            result.l2_miss_count,
            result.l3_miss_count,
            result.tlb_miss_count
        )?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Fixed-width table of latency and miss rates, one line per result
pub fn summary_table(results: &[BenchmarkResult]) -> String {
    let mut table = format!(
        "{:>10} {:>10} {:>10} {:>8} {:>10} {:>8} {:>8} {:>8} {:>8}\n",
        "Size", "Stride", "Page", "Pages", "Cyc/Load", "L1D %", "L2 %", "L3 %", "TLB %"
    );
    table.push_str(&format!(
        "{:-<10} {:-<10} {:-<10} {:-<8} {:-<10} {:-<8} {:-<8} {:-<8} {:-<8}\n",
        "", "", "", "", "", "", "", "", ""
    ));
    for result in results.iter().filter(|r| !r.is_sentinel()) {
        let [l1d, l2, l3, tlb] = result.miss_rates();
        table.push_str(&format!(
            "{:>10} {:>10} {:>10} {:>8} {:>10.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2}\n",
            format_size_fixed_int(result.buffer_size as u64),
            format_size_fixed_int(result.padded_element_size as u64),
            format_size_fixed_int(result.page_size as u64),
            result.page_entries(),
            result.cycles_per_load(),
            l1d,
            l2,
            l3,
            tlb
        ));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::BenchmarkConfig;

    fn result() -> BenchmarkResult {
        let config = BenchmarkConfig {
            buffer_size_bytes: 16 * 1024,
            padded_bytes_per_element: 64,
            use_hugepage: true,
        };
        BenchmarkResult {
            cycle_count: 4_000_000,
            l1d_miss_count: 12,
            l2_miss_count: 3,
            l3_miss_count: 2,
            tlb_miss_count: 1,
            ..BenchmarkResult::sentinel(&config, 2 * 1024 * 1024, 1_000_000)
        }
    }

    #[test]
    fn csv_header_then_rows() {
        let mut writer = CsvWriter::new(Vec::new());
        writer.write_header().unwrap();
        writer.write_row(&result()).unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(
            text,
            format!("{CSV_HEADER}\n16384,64,2097152,1000000,4000000,12,3,2,1\n")
        );
    }

    #[test]
    fn summary_skips_sentinels() {
        let config = BenchmarkConfig {
            buffer_size_bytes: 0,
            padded_bytes_per_element: 64,
            use_hugepage: false,
        };
        let table = summary_table(&[result(), BenchmarkResult::sentinel(&config, 4096, 10)]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("16 KiB"));
        assert!(lines[2].contains("4.00"));
    }
}
