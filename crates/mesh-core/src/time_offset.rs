//! Buffers `(wall-clock - packet.rxTime)` samples between flushes,
//! averaging them into a single telemetry point every 5 minutes.

#[derive(Debug, Default)]
pub struct TimeOffsetBuffer {
    samples: Vec<i64>,
}

impl TimeOffsetBuffer {
    pub fn new() -> Self {
        TimeOffsetBuffer::default()
    }

    pub fn record(&mut self, wall_clock: u32, packet_rx_time: u32) {
        self.samples.push(wall_clock as i64 - packet_rx_time as i64);
    }

    /// Average the buffer and clear it. `None` if nothing was recorded
    /// since the last flush — no telemetry point is emitted then.
    pub fn flush_average(&mut self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: i64 = self.samples.iter().sum();
        let avg = sum as f64 / self.samples.len() as f64;
        self.samples.clear();
        Some(avg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_flushes_to_none() {
        let mut buf = TimeOffsetBuffer::new();
        assert_eq!(buf.flush_average(), None);
    }

    #[test]
    fn averages_and_clears_samples() {
        let mut buf = TimeOffsetBuffer::new();
        buf.record(1010, 1000);
        buf.record(1020, 1005);
        assert_eq!(buf.flush_average(), Some(12.5));
        assert_eq!(buf.flush_average(), None);
    }
}
