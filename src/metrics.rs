//! Protocol counters, updated with relaxed atomics from every path that
//! sends, receives or drops a packet. Cheap enough to leave always on.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

#[derive(Debug, Default)]
pub struct Metrics {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub segments_out: AtomicU64,
    pub segments_in: AtomicU64,
    pub retrans_segments: AtomicU64,
    pub fast_retrans_segments: AtomicU64,
    pub lost_segments: AtomicU64,
    pub repeat_segments: AtomicU64,
    pub fec_shards_in: AtomicU64,
    pub fec_parity_out: AtomicU64,
    pub fec_recovered: AtomicU64,
    pub fec_unrecoverable: AtomicU64,
    pub checksum_failures: AtomicU64,
    pub input_discards: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub segments_out: u64,
    pub segments_in: u64,
    pub retrans_segments: u64,
    pub fast_retrans_segments: u64,
    pub lost_segments: u64,
    pub repeat_segments: u64,
    pub fec_shards_in: u64,
    pub fec_parity_out: u64,
    pub fec_recovered: u64,
    pub fec_unrecoverable: u64,
    pub checksum_failures: u64,
    pub input_discards: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Metrics {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            segments_out: AtomicU64::new(0),
            segments_in: AtomicU64::new(0),
            retrans_segments: AtomicU64::new(0),
            fast_retrans_segments: AtomicU64::new(0),
            lost_segments: AtomicU64::new(0),
            repeat_segments: AtomicU64::new(0),
            fec_shards_in: AtomicU64::new(0),
            fec_parity_out: AtomicU64::new(0),
            fec_recovered: AtomicU64::new(0),
            fec_unrecoverable: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
            input_discards: AtomicU64::new(0),
        }
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            bytes_sent: self.bytes_sent.load(Relaxed),
            bytes_received: self.bytes_received.load(Relaxed),
            packets_sent: self.packets_sent.load(Relaxed),
            packets_received: self.packets_received.load(Relaxed),
            segments_out: self.segments_out.load(Relaxed),
            segments_in: self.segments_in.load(Relaxed),
            retrans_segments: self.retrans_segments.load(Relaxed),
            fast_retrans_segments: self.fast_retrans_segments.load(Relaxed),
            lost_segments: self.lost_segments.load(Relaxed),
            repeat_segments: self.repeat_segments.load(Relaxed),
            fec_shards_in: self.fec_shards_in.load(Relaxed),
            fec_parity_out: self.fec_parity_out.load(Relaxed),
            fec_recovered: self.fec_recovered.load(Relaxed),
            fec_unrecoverable: self.fec_unrecoverable.load(Relaxed),
            checksum_failures: self.checksum_failures.load(Relaxed),
            input_discards: self.input_discards.load(Relaxed),
        }
    }
}

/// Global counters shared by every session and listener in the process.
pub static SNMP: Metrics = Metrics::new();
