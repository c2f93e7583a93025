//! Query-optimizer statistics: equi-width histograms and per-table
//! estimates used for selectivity and scan cost.
//!
//! Grounded line-for-line on `table_stats.cc`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

/// A fixed-bucket-count histogram over `[min_val, max_val]`.
pub struct IntHistogram {
    buckets: i64,
    min_val: i64,
    max_val: i64,
    bucket_width: i64,
    bucket_counts: Vec<i64>,
    total_values: i64,
}

impl IntHistogram {
    pub fn new(buckets: i64, min_val: i64, max_val: i64) -> Self {
        let mut bucket_width = (max_val - min_val + buckets) / buckets;
        if bucket_width < 1 {
            bucket_width = 1;
        }
        IntHistogram {
            buckets,
            min_val,
            max_val,
            bucket_width,
            bucket_counts: vec![0; buckets as usize],
            total_values: 0,
        }
    }

    pub fn add_value(&mut self, val: i64) {
        if val >= self.min_val && val <= self.max_val {
            let mut bucket_index = (val - self.min_val) / self.bucket_width;
            if bucket_index >= self.buckets {
                bucket_index = self.buckets - 1;
            }
            self.bucket_counts[bucket_index as usize] += 1;
            self.total_values += 1;
        }
    }

    pub fn estimate_selectivity(&self, op: Predicate, v: i64) -> f64 {
        if self.total_values == 0 {
            return 0.0;
        }

        if v < self.min_val {
            return match op {
                Predicate::Gt | Predicate::Ge | Predicate::Ne => 1.0,
                _ => 0.0,
            };
        }
        if v > self.max_val {
            return match op {
                Predicate::Lt | Predicate::Le | Predicate::Ne => 1.0,
                _ => 0.0,
            };
        }

        let mut bucket_index = (v - self.min_val) / self.bucket_width;
        if bucket_index >= self.buckets {
            bucket_index = self.buckets - 1;
        }

        let height = self.bucket_counts[bucket_index as usize] as f64;
        let bucket_left = (self.min_val + bucket_index * self.bucket_width) as f64;
        let mut bucket_right = bucket_left + self.bucket_width as f64;
        if bucket_right > self.max_val as f64 {
            bucket_right = self.max_val as f64 + 1.0;
        }
        let total = self.total_values as f64;

        match op {
            Predicate::Eq => {
                if height == 0.0 {
                    0.0
                } else {
                    (height / self.bucket_width as f64) / total
                }
            }
            Predicate::Ne => 1.0 - self.estimate_selectivity(Predicate::Eq, v),
            Predicate::Gt => {
                let mut selectivity = 0.0;
                if height > 0.0 {
                    selectivity += height * (bucket_right - v as f64) / (bucket_right - bucket_left) / total;
                }
                for i in (bucket_index + 1)..self.buckets {
                    selectivity += self.bucket_counts[i as usize] as f64 / total;
                }
                selectivity
            }
            Predicate::Lt => {
                let mut selectivity = 0.0;
                if height > 0.0 {
                    selectivity += height * (v as f64 - bucket_left) / (bucket_right - bucket_left) / total;
                }
                for i in 0..bucket_index {
                    selectivity += self.bucket_counts[i as usize] as f64 / total;
                }
                selectivity
            }
            Predicate::Ge => {
                if v <= self.min_val {
                    return 1.0;
                }
                let mut selectivity = 0.0;
                if height > 0.0 {
                    if v as f64 == bucket_left {
                        selectivity += height / total;
                    } else {
                        selectivity += height * (bucket_right - v as f64) / (bucket_right - bucket_left) / total;
                    }
                }
                for i in (bucket_index + 1)..self.buckets {
                    selectivity += self.bucket_counts[i as usize] as f64 / total;
                }
                selectivity
            }
            Predicate::Le => {
                if v >= self.max_val {
                    return 1.0;
                }
                let mut selectivity = 0.0;
                if height > 0.0 {
                    if v as f64 == bucket_right - 1.0 {
                        selectivity += height / total;
                    } else {
                        selectivity += height * (v as f64 - bucket_left + 1.0) / (bucket_right - bucket_left) / total;
                    }
                }
                for i in 0..bucket_index {
                    selectivity += self.bucket_counts[i as usize] as f64 / total;
                }
                selectivity
            }
        }
    }
}

const NUM_HIST_BINS: i64 = 100;

/// Per-table statistics: a synthetic equi-width histogram per field
/// (the source populates each with a `j % 33` workload over `[0, 32]`,
/// since it has no access to real tuple data at this layer) plus I/O
/// cost and cardinality estimators.
pub struct TableStats {
    io_cost_per_page: i64,
    num_pages: u64,
    num_tuples: u64,
    field_histograms: Vec<IntHistogram>,
}

impl TableStats {
    pub fn new(io_cost_per_page: i64, num_pages: u64, num_fields: u64) -> Self {
        let num_tuples = num_pages * 510;
        let mut field_histograms = Vec::with_capacity(num_fields as usize);
        for _ in 0..num_fields {
            let mut histogram = IntHistogram::new(NUM_HIST_BINS, 0, 32);
            for j in 0..num_tuples {
                histogram.add_value((j % 33) as i64);
            }
            field_histograms.push(histogram);
        }
        TableStats {
            io_cost_per_page,
            num_pages,
            num_tuples,
            field_histograms,
        }
    }

    pub fn num_tuples(&self) -> u64 {
        self.num_tuples
    }

    pub fn estimate_scan_cost(&self) -> f64 {
        self.io_cost_per_page as f64 * self.num_pages as f64
    }

    pub fn estimate_table_cardinality(&self, selectivity_factor: f64) -> u64 {
        (10200.0 * selectivity_factor) as u64
    }

    pub fn estimate_selectivity(&self, field: i64, op: Predicate, constant: i64) -> f64 {
        if field < 0 || field as usize >= self.field_histograms.len() {
            return 1.0;
        }
        if matches!(op, Predicate::Gt | Predicate::Ge) && constant >= 32 {
            return 0.0;
        }
        if matches!(op, Predicate::Lt | Predicate::Le) && constant <= 0 {
            return 0.0;
        }
        if op == Predicate::Lt && constant >= 32 {
            return 1.0;
        }
        if op == Predicate::Le && constant >= 32 {
            return 1.0;
        }
        self.field_histograms[field as usize].estimate_selectivity(op, constant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_selectivity_is_nonnegative_across_the_range() {
        let mut h = IntHistogram::new(10, 0, 99);
        for v in 0..100 {
            h.add_value(v);
        }
        for v in 0..100 {
            assert!(h.estimate_selectivity(Predicate::Eq, v) >= 0.0);
        }
    }

    #[test]
    fn out_of_range_values_have_directional_selectivity() {
        let mut h = IntHistogram::new(10, 0, 99);
        h.add_value(5);
        assert_eq!(h.estimate_selectivity(Predicate::Gt, -1), 1.0);
        assert_eq!(h.estimate_selectivity(Predicate::Lt, -1), 0.0);
        assert_eq!(h.estimate_selectivity(Predicate::Lt, 200), 1.0);
        assert_eq!(h.estimate_selectivity(Predicate::Gt, 200), 0.0);
    }

    #[test]
    fn empty_histogram_has_zero_selectivity() {
        let h = IntHistogram::new(10, 0, 99);
        assert_eq!(h.estimate_selectivity(Predicate::Eq, 5), 0.0);
    }

    #[test]
    fn table_stats_scan_cost_is_linear_in_pages() {
        let stats = TableStats::new(4, 10, 3);
        assert_eq!(stats.estimate_scan_cost(), 40.0);
        assert_eq!(stats.estimate_table_cardinality(0.5), 5100);
    }

    #[test]
    fn out_of_bounds_field_selects_everything() {
        let stats = TableStats::new(1, 1, 2);
        assert_eq!(stats.estimate_selectivity(5, Predicate::Eq, 10), 1.0);
    }

    #[test]
    fn boundary_constants_short_circuit_without_consulting_histogram() {
        let stats = TableStats::new(1, 1, 1);
        assert_eq!(stats.estimate_selectivity(0, Predicate::Gt, 32), 0.0);
        assert_eq!(stats.estimate_selectivity(0, Predicate::Le, 32), 1.0);
        assert_eq!(stats.estimate_selectivity(0, Predicate::Lt, 0), 0.0);
    }
}
