use opentelemetry::KeyValue;

pub enum StopWatchUnit {
    Micros,
    Millis,
    Seconds,
}

/// Records the time between construction and drop into a histogram.
pub struct Stopwatch<'a> {
    histogram: &'a opentelemetry::metrics::Histogram<u64>,
    attributes: &'a [KeyValue],
    started: std::time::Instant,
    unit: StopWatchUnit,
}

impl<'a> Stopwatch<'a> {
    pub fn new(
        histogram: &'a opentelemetry::metrics::Histogram<u64>,
        attributes: &'a [KeyValue],
        unit: StopWatchUnit,
    ) -> Self {
        Self {
            histogram,
            attributes,
            started: std::time::Instant::now(),
            unit,
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub fn elapsed_micros(&self) -> u64 {
        self.elapsed().as_micros() as u64
    }
}

impl Drop for Stopwatch<'_> {
    fn drop(&mut self) {
        let elapsed = self.elapsed();
        let value = match self.unit {
            StopWatchUnit::Micros => elapsed.as_micros() as u64,
            StopWatchUnit::Millis => elapsed.as_millis() as u64,
            StopWatchUnit::Seconds => elapsed.as_secs(),
        };
        self.histogram.record(value, self.attributes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopwatch_records_without_a_meter_provider() {
        let meter = opentelemetry::global::meter("strata_tracing_test");
        let histogram = meter.u64_histogram("test_latency").build();
        let attributes = [KeyValue::new("stage", "test")];
        let stopwatch = Stopwatch::new(&histogram, &attributes, StopWatchUnit::Micros);
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(stopwatch.elapsed_micros() >= 1000);
    }
}
