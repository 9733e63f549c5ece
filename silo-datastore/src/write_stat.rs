/// Throughput and deduplication counters of one writer run.
#[derive(Clone)]
pub struct WriteStat {
    /// Logical payload bytes handed to the writer.
    pub size: u64,
    /// Framed bytes that actually reached the backend.
    pub disk_size: u64,

    pub blob_count: usize,
    pub duplicate_blobs: usize,
    pub packfile_count: usize,

    start_time: std::time::SystemTime,
}

impl Default for WriteStat {
    fn default() -> Self {
        WriteStat {
            size: 0,
            disk_size: 0,
            blob_count: 0,
            duplicate_blobs: 0,
            packfile_count: 0,
            start_time: std::time::SystemTime::now(),
        }
    }
}

impl std::fmt::Debug for WriteStat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let elapsed = self.start_time.elapsed().unwrap_or_default();
        let elapsed = (elapsed.as_secs() as f64) + (elapsed.subsec_millis() as f64) / 1000.0;

        let rate = if self.size > 0 {
            (self.disk_size * 100) / self.size
        } else {
            100
        };
        let write_speed = if elapsed > 0.0 {
            ((self.size as f64) / (1024.0 * 1024.0)) / elapsed
        } else {
            0.0
        };

        write!(
            f,
            "size: {}, disk size: {} ({}%), blobs: {} ({} duplicates), packfiles: {}, speed: {:.2} MB/s",
            self.size,
            self.disk_size,
            rate,
            self.blob_count,
            self.duplicate_blobs,
            self.packfile_count,
            write_speed
        )
    }
}
