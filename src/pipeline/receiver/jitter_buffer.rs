//! Fixed-capacity jitter buffer for one track
//!
//! Packets are stored in a circular slot array indexed by
//! `sequence_number mod capacity`. Memory is bounded: when the real reorder
//! depth exceeds the capacity, a newer packet silently overwrites an older
//! one that was never released, and the older sequence number is later
//! skipped as lost.
//!
//! The buffer never blocks. Callers `add` a packet and then poll
//! `get_ordered` for whatever became releasable. A missing packet is waited
//! for until the media time observed since the last released packet exceeds
//! the configured wait window; after that it is declared lost and skipped.

use log::{debug, trace};
use std::time::Duration;

use crate::pipeline::types::RtpPacket;

/// Largest usable capacity: one slot per 16-bit sequence number
const MAX_CAPACITY: usize = 1 << 16;

/// Half of the sequence space, used to tell "behind" from "ahead"
const HALF_SEQ_SPACE: u16 = 0x8000;

pub struct JitterBuffer {
    slots: Box<[Option<RtpPacket>]>,
    /// Number of occupied slots
    buffered: usize,
    /// Whether the first packet has seeded the read position
    seeded: bool,
    /// Sequence number released (or skipped) last; scans resume one past it
    last_seq: u16,
    /// Timestamp of the most recently arrived packet
    last_observed_ts: u32,
    /// Timestamp of the most recently released packet
    reference_ts: u32,
    clock_rate: u32,
    max_wait: Duration,

    packets_received: u64,
    packets_lost: u64,
    packets_late: u64,
    packets_duplicate: u64,
    packets_overwritten: u64,
}

impl JitterBuffer {
    /// Create a jitter buffer for a track clocked at `clock_rate` Hz.
    ///
    /// `capacity` is rounded up to the next power of two so slot indices stay
    /// contiguous across the sequence number wrap.
    pub fn new(capacity: usize, clock_rate: u32, max_wait: Duration) -> Self {
        let capacity = capacity.clamp(1, MAX_CAPACITY).next_power_of_two();

        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            buffered: 0,
            seeded: false,
            last_seq: 0,
            last_observed_ts: 0,
            reference_ts: 0,
            clock_rate,
            max_wait,
            packets_received: 0,
            packets_lost: 0,
            packets_late: 0,
            packets_duplicate: 0,
            packets_overwritten: 0,
        }
    }

    /// Insert a packet. Duplicates, late packets and overruns are absorbed
    /// without error.
    ///
    /// A packet is late when it sits at most `capacity` sequence numbers
    /// behind the read position. Anything further behind is a sequence
    /// discontinuity: the buffer is reset and reseeded on that packet.
    pub fn add(&mut self, packet: RtpPacket) {
        self.packets_received += 1;

        let seq = packet.sequence_number;

        if !self.seeded {
            self.seeded = true;
            self.last_seq = seq.wrapping_sub(1);
            self.reference_ts = packet.timestamp;
        }

        // latest arrival, not latest in sequence order
        self.last_observed_ts = packet.timestamp;

        let expected = self.last_seq.wrapping_add(1);
        if seq.wrapping_sub(expected) >= HALF_SEQ_SPACE {
            let behind = expected.wrapping_sub(seq) as usize;
            if behind <= self.capacity() {
                // already released or skipped
                self.packets_late += 1;
                trace!("JitterBuffer: late packet {} (next expected {})", seq, expected);
                return;
            }

            // too far off to be a reorder: the sender jumped
            debug!(
                "JitterBuffer: sequence discontinuity at {} (next expected {}), reseeding",
                seq, expected
            );
            self.reset();
            self.seeded = true;
            self.last_seq = seq.wrapping_sub(1);
            self.reference_ts = packet.timestamp;
        }

        let index = self.slot_index(seq);
        match self.slots[index].replace(packet) {
            None => self.buffered += 1,
            Some(previous) if previous.sequence_number == seq => {
                self.packets_duplicate += 1;
            }
            Some(previous) => {
                self.packets_overwritten += 1;
                debug!(
                    "JitterBuffer: overrun, packet {} evicted by {}",
                    previous.sequence_number, seq
                );
            }
        }
    }

    /// Release the longest run of packets that can be emitted in order,
    /// skipping missing sequence numbers whose wait window has elapsed.
    ///
    /// Returns an empty vector when nothing is ready.
    pub fn get_ordered(&mut self) -> Vec<RtpPacket> {
        let mut output = Vec::new();

        if !self.seeded {
            return output;
        }

        let threshold = self.wait_threshold();

        while self.buffered > 0 {
            let seq = self.last_seq.wrapping_add(1);
            let index = self.slot_index(seq);

            if let Some(packet) = self.slots[index].take_if(|p| p.sequence_number == seq) {
                self.buffered -= 1;
                self.reference_ts = packet.timestamp;
                self.last_seq = seq;
                output.push(packet);
                continue;
            }

            if self.elapsed() > threshold {
                // give up on this one
                self.packets_lost += 1;
                self.last_seq = seq;
                debug!("JitterBuffer: packet {} lost", seq);
                continue;
            }

            break;
        }

        output
    }

    /// Reconfigure the loss tolerance window. Affects future scans only.
    pub fn set_max_wait_time(&mut self, max_wait: Duration) {
        self.max_wait = max_wait;
    }

    pub fn max_wait_time(&self) -> Duration {
        self.max_wait
    }

    /// Drop every buffered packet and re-arm seeding on the next `add`.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.buffered = 0;
        self.seeded = false;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of packets currently held
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }

    pub fn packets_late(&self) -> u64 {
        self.packets_late
    }

    pub fn packets_duplicate(&self) -> u64 {
        self.packets_duplicate
    }

    pub fn packets_overwritten(&self) -> u64 {
        self.packets_overwritten
    }

    fn slot_index(&self, seq: u16) -> usize {
        seq as usize & (self.slots.len() - 1)
    }

    /// Media time elapsed since the last released packet, in clock ticks.
    fn elapsed(&self) -> u64 {
        let elapsed = self.last_observed_ts.wrapping_sub(self.reference_ts);
        // last observed behind the reference: nothing has elapsed yet
        if elapsed >= 1 << 31 { 0 } else { elapsed as u64 }
    }

    /// Wait window converted to clock ticks
    fn wait_threshold(&self) -> u64 {
        let millis = u64::try_from(self.max_wait.as_millis()).unwrap_or(u64::MAX);
        millis.saturating_mul(self.clock_rate as u64) / 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIDEO_CLOCK: u32 = 90_000;

    fn make_packet(seq: u16, timestamp: u32) -> RtpPacket {
        RtpPacket::new(seq, timestamp, true, vec![seq as u8])
    }

    fn seqs(packets: &[RtpPacket]) -> Vec<u16> {
        packets.iter().map(|p| p.sequence_number).collect()
    }

    #[test]
    fn test_in_order_packets() {
        let mut jb = JitterBuffer::new(512, VIDEO_CLOCK, Duration::from_millis(100));

        jb.add(make_packet(1, 0));
        jb.add(make_packet(2, 3000));
        jb.add(make_packet(3, 6000));

        assert_eq!(seqs(&jb.get_ordered()), vec![1, 2, 3]);
        assert_eq!(jb.buffered(), 0);
    }

    #[test]
    fn test_out_of_order_packets() {
        let mut jb = JitterBuffer::new(512, VIDEO_CLOCK, Duration::from_millis(100));

        jb.add(make_packet(1, 0));
        jb.add(make_packet(3, 0));
        jb.add(make_packet(2, 0));

        assert_eq!(seqs(&jb.get_ordered()), vec![1, 2, 3]);
    }

    #[test]
    fn test_first_packet_seeds_read_position() {
        let mut jb = JitterBuffer::new(512, VIDEO_CLOCK, Duration::from_millis(100));

        jb.add(make_packet(1000, 0));

        assert_eq!(seqs(&jb.get_ordered()), vec![1000]);
    }

    #[test]
    fn test_empty_drain_is_idempotent() {
        let mut jb = JitterBuffer::new(512, VIDEO_CLOCK, Duration::from_millis(100));

        assert!(jb.get_ordered().is_empty());

        jb.add(make_packet(7, 0));
        assert_eq!(seqs(&jb.get_ordered()), vec![7]);
        assert!(jb.get_ordered().is_empty());
        assert!(jb.get_ordered().is_empty());
    }

    #[test]
    fn test_duplicate_packets() {
        let mut jb = JitterBuffer::new(512, VIDEO_CLOCK, Duration::from_millis(100));

        jb.add(make_packet(1, 0));
        jb.add(make_packet(2, 0));
        jb.add(make_packet(2, 0)); // duplicate while buffered

        assert_eq!(seqs(&jb.get_ordered()), vec![1, 2]);

        jb.add(make_packet(2, 0)); // duplicate after release
        assert!(jb.get_ordered().is_empty());
        assert_eq!(jb.packets_duplicate(), 1);
        assert_eq!(jb.packets_late(), 1);
    }

    #[test]
    fn test_gap_is_skipped_after_wait_window() {
        // 100ms at 90kHz is 9000 ticks
        let mut jb = JitterBuffer::new(512, VIDEO_CLOCK, Duration::from_millis(100));

        jb.add(make_packet(10, 0));
        jb.add(make_packet(12, 90_000));

        assert_eq!(seqs(&jb.get_ordered()), vec![10, 12]);
        assert_eq!(jb.packets_lost(), 1);
    }

    #[test]
    fn test_gap_is_held_inside_wait_window() {
        let mut jb = JitterBuffer::new(512, VIDEO_CLOCK, Duration::from_millis(100));

        jb.add(make_packet(10, 0));
        jb.add(make_packet(12, 3000));

        assert_eq!(seqs(&jb.get_ordered()), vec![10]);
        assert!(jb.get_ordered().is_empty());

        // a later arrival pushes the observed media time past the window
        jb.add(make_packet(13, 12_000));
        assert_eq!(seqs(&jb.get_ordered()), vec![12, 13]);
        assert_eq!(jb.packets_lost(), 1);
    }

    #[test]
    fn test_gap_filled_before_window_expires() {
        let mut jb = JitterBuffer::new(512, VIDEO_CLOCK, Duration::from_millis(100));

        jb.add(make_packet(10, 0));
        jb.add(make_packet(12, 3000));
        assert_eq!(seqs(&jb.get_ordered()), vec![10]);

        jb.add(make_packet(11, 1500));
        assert_eq!(seqs(&jb.get_ordered()), vec![11, 12]);
        assert_eq!(jb.packets_lost(), 0);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut jb = JitterBuffer::new(4, VIDEO_CLOCK, Duration::from_millis(0));

        jb.add(make_packet(65534, 0));
        jb.add(make_packet(0, 0));
        jb.add(make_packet(65535, 0));
        jb.add(make_packet(1, 0));

        assert_eq!(seqs(&jb.get_ordered()), vec![65534, 65535, 0, 1]);
        assert_eq!(jb.packets_lost(), 0);
    }

    #[test]
    fn test_timestamp_wraparound_counts_as_elapsed() {
        let mut jb = JitterBuffer::new(512, VIDEO_CLOCK, Duration::from_millis(100));

        jb.add(make_packet(1, u32::MAX - 1000));
        assert_eq!(seqs(&jb.get_ordered()), vec![1]);

        // 20000 ticks later, across the 32-bit wrap
        jb.add(make_packet(3, 19_000));
        assert_eq!(seqs(&jb.get_ordered()), vec![3]);
    }

    #[test]
    fn test_stale_timestamp_does_not_force_skip() {
        let mut jb = JitterBuffer::new(512, VIDEO_CLOCK, Duration::from_millis(100));

        jb.add(make_packet(5, 50_000));
        jb.add(make_packet(7, 51_000));
        assert_eq!(seqs(&jb.get_ordered()), vec![5]);

        // a retransmission of an old packet carries an older timestamp
        jb.add(make_packet(4, 10_000));
        assert!(jb.get_ordered().is_empty());
        assert_eq!(jb.packets_lost(), 0);
    }

    #[test]
    fn test_end_to_end_immediate_skip() {
        let mut jb = JitterBuffer::new(4, VIDEO_CLOCK, Duration::from_millis(0));
        let mut output = Vec::new();

        for seq in [1, 3, 2] {
            jb.add(make_packet(seq, 9000));
            output.extend(seqs(&jb.get_ordered()));
        }

        assert_eq!(output, vec![1, 2, 3]);
    }

    #[test]
    fn test_overrun_overwrites_slot() {
        let mut jb = JitterBuffer::new(4, VIDEO_CLOCK, Duration::from_millis(0));

        jb.add(make_packet(1, 0));
        assert_eq!(seqs(&jb.get_ordered()), vec![1]);

        // 3 maps to the same slot as 7 with capacity 4
        jb.add(make_packet(3, 0));
        jb.add(make_packet(7, 0));
        assert_eq!(jb.packets_overwritten(), 1);
        assert_eq!(jb.buffered(), 1);

        jb.add(make_packet(8, 9000));
        assert_eq!(seqs(&jb.get_ordered()), vec![7, 8]);
        assert_eq!(jb.packets_lost(), 5);
    }

    #[test]
    fn test_set_max_wait_time_affects_next_scan() {
        let mut jb = JitterBuffer::new(512, VIDEO_CLOCK, Duration::from_secs(10));

        jb.add(make_packet(1, 0));
        jb.add(make_packet(3, 9000));
        assert_eq!(seqs(&jb.get_ordered()), vec![1]);

        jb.set_max_wait_time(Duration::from_millis(50));
        assert_eq!(jb.max_wait_time(), Duration::from_millis(50));
        assert_eq!(seqs(&jb.get_ordered()), vec![3]);
    }

    #[test]
    fn test_reset_reseeds() {
        let mut jb = JitterBuffer::new(512, VIDEO_CLOCK, Duration::from_millis(100));

        jb.add(make_packet(1, 0));
        jb.add(make_packet(3, 0));
        assert_eq!(seqs(&jb.get_ordered()), vec![1]);

        jb.reset();
        assert_eq!(jb.buffered(), 0);
        assert!(jb.get_ordered().is_empty());

        jb.add(make_packet(500, 0));
        assert_eq!(seqs(&jb.get_ordered()), vec![500]);
    }

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        assert_eq!(JitterBuffer::new(0, VIDEO_CLOCK, Duration::ZERO).capacity(), 1);
        assert_eq!(JitterBuffer::new(4, VIDEO_CLOCK, Duration::ZERO).capacity(), 4);
        assert_eq!(JitterBuffer::new(500, VIDEO_CLOCK, Duration::ZERO).capacity(), 512);
        assert_eq!(JitterBuffer::new(1 << 20, VIDEO_CLOCK, Duration::ZERO).capacity(), 1 << 16);
    }

    #[test]
    fn test_large_forward_jump_keeps_releasing() {
        let mut jb = JitterBuffer::new(512, VIDEO_CLOCK, Duration::from_millis(100));

        jb.add(make_packet(100, 0));
        assert_eq!(seqs(&jb.get_ordered()), vec![100]);

        let start: u16 = 100 + 40_000;
        let mut released = Vec::new();
        for i in 0..20_000u16 {
            jb.add(make_packet(start + i, 3000 * (i as u32 + 1)));
            released.extend(seqs(&jb.get_ordered()));
        }

        let expected: Vec<u16> = (0..20_000u16).map(|i| start + i).collect();
        assert_eq!(released, expected);
        assert_eq!(jb.packets_late(), 0);
        assert_eq!(jb.buffered(), 0);
    }

    #[test]
    fn test_sender_restart_reseeds_behind() {
        let mut jb = JitterBuffer::new(64, VIDEO_CLOCK, Duration::from_millis(100));

        jb.add(make_packet(30_000, 0));
        jb.add(make_packet(30_002, 0));
        assert_eq!(seqs(&jb.get_ordered()), vec![30_000]);

        // within the window behind the read position: late
        jb.add(make_packet(29_990, 0));
        assert_eq!(jb.packets_late(), 1);
        assert!(jb.get_ordered().is_empty());

        // far behind: a restarted sender, pending packets are dropped
        jb.add(make_packet(1000, 500));
        jb.add(make_packet(1001, 3500));
        assert_eq!(seqs(&jb.get_ordered()), vec![1000, 1001]);
        assert_eq!(jb.packets_late(), 1);
        assert_eq!(jb.buffered(), 0);
    }

    #[test]
    fn test_huge_wait_window_does_not_overflow() {
        for max_wait in [Duration::MAX, Duration::from_millis(u64::MAX / 1000)] {
            let mut jb = JitterBuffer::new(512, VIDEO_CLOCK, max_wait);

            jb.add(make_packet(1, 0));
            jb.add(make_packet(3, u32::MAX / 2));
            assert_eq!(seqs(&jb.get_ordered()), vec![1]);

            jb.set_max_wait_time(Duration::MAX);
            jb.add(make_packet(4, 9000));
            assert!(jb.get_ordered().is_empty());
            assert_eq!(jb.packets_lost(), 0);
        }
    }

    #[test]
    fn test_shuffled_window_is_released_sorted() {
        let mut jb = JitterBuffer::new(64, VIDEO_CLOCK, Duration::from_millis(100));
        let start: u16 = 65_520;

        // first packet in place, the rest of the window interleaved
        let mut order: Vec<u16> = vec![0];
        order.extend((1..32u16).rev().step_by(2));
        order.extend((2..32u16).step_by(2));

        let mut released = Vec::new();
        for offset in order {
            jb.add(make_packet(start.wrapping_add(offset), 0));
            released.extend(seqs(&jb.get_ordered()));
        }

        let expected: Vec<u16> = (0..32u16).map(|o| start.wrapping_add(o)).collect();
        assert_eq!(released, expected);
    }
}
