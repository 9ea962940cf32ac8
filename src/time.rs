// Wall-clock seconds as an f64, the timestamp unit used throughout the
// cluster/ATR/detector/anti-spam pipeline.

/// Seconds since the Unix epoch, as used for cluster ids, bar buckets, and
/// anti-spam bookkeeping.
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs_f64()
}
