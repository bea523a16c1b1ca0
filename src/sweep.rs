//! Sweep of benchmark configurations: buffer sizes doubling from a minimum to a maximum, each
//! measured with cache-line stride on hugepages, page stride on hugepages and page stride on base
//! pages.
use crate::harness::BenchmarkConfig;

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;
pub const GIB: usize = 1024 * MIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub cache_line_bytes: usize,
    pub page_size: usize,
}

impl SweepConfig {
    /// Default 16 KiB to 1 GiB range with the given memory geometry
    pub fn new(cache_line_bytes: usize, page_size: usize) -> Self {
        SweepConfig {
            min_size: 16 * KIB,
            max_size: GIB,
            cache_line_bytes,
            page_size,
        }
    }

    /// Buffer sizes of the sweep
    pub fn sizes(&self) -> impl Iterator<Item = usize> + use<> {
        let max_size = self.max_size;
        std::iter::successors((self.min_size > 0).then_some(self.min_size), |size| size.checked_mul(2))
            .take_while(move |&size| size <= max_size)
    }

    /// Every configuration of the sweep, in run order
    pub fn configs(&self) -> impl Iterator<Item = BenchmarkConfig> + use<> {
        let SweepConfig {
            cache_line_bytes,
            page_size,
            ..
        } = *self;
        self.sizes().flat_map(move |size| {
            [
                (cache_line_bytes, true),
                (page_size, true),
                (page_size, false),
            ]
            .map(|(padded_bytes_per_element, use_hugepage)| BenchmarkConfig {
                buffer_size_bytes: size,
                padded_bytes_per_element,
                use_hugepage,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_range_doubles_from_16k_to_1g() {
        let sweep = SweepConfig::new(64, 4096);
        let sizes: Vec<usize> = sweep.sizes().collect();
        assert_eq!(sizes.len(), 17);
        assert_eq!(sizes[0], 16 * KIB);
        assert_eq!(sizes[16], GIB);
        assert!(sizes.windows(2).all(|w| w[1] == 2 * w[0]));
    }

    #[test]
    fn three_combos_per_size() {
        let sweep = SweepConfig::new(64, 4096);
        let configs: Vec<BenchmarkConfig> = sweep.configs().collect();
        assert_eq!(configs.len(), 17 * 3);
        assert_eq!(
            configs[..3],
            [
                BenchmarkConfig {
                    buffer_size_bytes: 16 * KIB,
                    padded_bytes_per_element: 64,
                    use_hugepage: true
                },
                BenchmarkConfig {
                    buffer_size_bytes: 16 * KIB,
                    padded_bytes_per_element: 4096,
                    use_hugepage: true
                },
                BenchmarkConfig {
                    buffer_size_bytes: 16 * KIB,
                    padded_bytes_per_element: 4096,
                    use_hugepage: false
                },
            ]
        );
    }

    #[test]
    fn empty_when_min_exceeds_max() {
        let sweep = SweepConfig {
            min_size: 2 * MIB,
            max_size: MIB,
            ..SweepConfig::new(64, 4096)
        };
        assert_eq!(sweep.configs().count(), 0);
    }

    #[test]
    fn zero_min_size_is_empty() {
        let sweep = SweepConfig {
            min_size: 0,
            ..SweepConfig::new(64, 4096)
        };
        assert_eq!(sweep.sizes().count(), 0);
    }
}
