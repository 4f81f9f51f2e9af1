//! # Streams
//!
//! A stream is an ordered, acknowledged channel multiplexed over a peer's line,
//! identified by a 40-hex id that is unique within that peer's stream map.
//!
//! [`Stream`] is the pure state machine: it numbers outbound frames, keeps them
//! until acknowledged, reorders inbound frames and tells the caller what to
//! transmit. It performs no I/O and takes the current time as an argument, so
//! the node actor owns all side effects.
//!
//! ## Sequencing
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `seq` | Sender's per-stream counter, starting at 0 |
//! | `ack` | Highest `seq` the sender has received (not necessarily in order) |
//! | `miss` | Gaps in the sender's reorder buffer, as absolute `seq` values |
//!
//! ## Limits
//!
//! - Acks are coalesced to one per second unless the gap since the last ack
//!   exceeds 30 or a duplicate arrived.
//! - A missed frame is retransmitted at most once every 5 seconds.
//! - Frames more than 100 ahead of the last in-order delivery are dropped, as
//!   are frames carrying more than 100 misses.
//! - Bare acknowledgements consume a sequence number but never reach handlers
//!   and never trigger an acknowledgement of their own.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tokio::sync::{mpsc, oneshot};

use crate::identity::Hashname;
use crate::messages::{Header, Packet};
use crate::node::Command;

/// Inbound gap (from the last acknowledged `seq`) that forces an immediate ack.
pub const ACK_GAP: i64 = 30;

/// Delay before a coalesced ack is flushed.
pub const ACK_DELAY: Duration = Duration::from_secs(1);

/// Frames further ahead of the in-order point than this are dropped.
pub const REORDER_WINDOW: i64 = 100;

/// Frames listing more misses than this are dropped.
pub const MISS_MAX: usize = 100;

/// Minimum time between retransmissions of the same frame.
pub const RESEND_INTERVAL: Duration = Duration::from_secs(5);

/// Who consumes in-order frames of a stream.
#[derive(Debug)]
pub enum Handler {
    /// Unsolicited stream; the first frame's `type` picks a handler.
    Unassigned,
    /// Frames are accepted and acknowledged but not delivered anywhere.
    Discard,
    App(mpsc::UnboundedSender<Packet>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The stream already sent `end`.
    Ended,
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Ended => write!(f, "sending to an ended stream"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Reason an inbound frame was not buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    InvalidSeq,
    Duplicate(i64),
    TooManyMisses(usize),
    TooFarAhead(i64),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::InvalidSeq => write!(f, "invalid sequence"),
            Rejection::Duplicate(seq) => write!(f, "duplicate seq {}", seq),
            Rejection::TooManyMisses(n) => write!(f, "too many misses ({})", n),
            Rejection::TooFarAhead(seq) => write!(f, "seq {} too far ahead", seq),
        }
    }
}

/// What the caller must do after [`Stream::receive`].
#[derive(Debug, Default)]
pub struct Received {
    /// Send a bare ack right away.
    pub ack_now: bool,
    /// Arm the (single) delayed-ack timer.
    pub start_flusher: bool,
    /// Previously sent frames to transmit again.
    pub resend: Vec<Packet>,
    /// Frames now deliverable, in sequence order.
    pub deliver: Vec<Packet>,
    pub rejected: Option<Rejection>,
}

#[derive(Debug)]
struct Outbound {
    seq: i64,
    packet: Packet,
    resent_at: Option<Instant>,
    done: Option<oneshot::Sender<()>>,
}

// ============================================================================
// Stream State Machine
// ============================================================================

#[derive(Debug)]
pub struct Stream {
    id: Hashname,
    pub handler: Handler,
    manual: bool,
    ended: bool,
    flusher: bool,

    in_seq: i64,
    out_seq: i64,
    in_done: i64,
    out_confirmed: i64,
    in_dups: u32,
    last_ack: i64,

    inq: VecDeque<Option<Packet>>,
    outq: Vec<Outbound>,
}

impl Stream {
    pub fn new(id: Hashname, handler: Handler) -> Self {
        Self {
            id,
            handler,
            manual: false,
            ended: false,
            flusher: false,
            in_seq: -1,
            out_seq: 0,
            in_done: -1,
            out_confirmed: -1,
            in_dups: 0,
            last_ack: -1,
            inq: VecDeque::new(),
            outq: Vec::new(),
        }
    }

    /// Skip ordering, acks and retransmission: every inbound frame is
    /// delivered as it arrives.
    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    pub fn id(&self) -> Hashname {
        self.id
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    /// Number of sent frames not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.outq.len()
    }

    /// Stamp sequencing fields onto an outbound frame and retain it for
    /// retransmission. `None` asks for a bare ack, which is suppressed (returns
    /// `Ok(None)`) when there is nothing new to acknowledge.
    pub fn prepare_send(
        &mut self,
        header: Option<Header>,
        body: Option<Vec<u8>>,
        done: Option<oneshot::Sender<()>>,
    ) -> Result<Option<Packet>, StreamError> {
        if self.ended {
            return match header {
                None => Ok(None),
                Some(_) => Err(StreamError::Ended),
            };
        }
        let mut header = match header {
            Some(header) => header,
            None if self.out_confirmed == self.in_seq && self.in_dups == 0 => return Ok(None),
            None => Header::default(),
        };

        let seq = self.out_seq;
        self.out_seq += 1;
        header.stream = Some(self.id.to_hex());
        header.seq = Some(seq);
        header.ack = (self.in_seq >= 0).then_some(self.in_seq);
        if !self.inq.is_empty() {
            let first = self.in_done + 1;
            header.miss = Some(
                self.inq
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| slot.is_none())
                    .map(|(i, _)| first + i as i64)
                    .collect(),
            );
        }

        self.out_confirmed = self.in_seq;
        self.in_dups = 0;
        self.ended = header.is_end();

        let packet = Packet::new(header, body);
        self.outq.push(Outbound {
            seq,
            packet: packet.clone(),
            resent_at: None,
            done,
        });
        Ok(Some(packet))
    }

    /// The delayed-ack timer fired; a new one may be armed.
    pub fn flusher_fired(&mut self) {
        self.flusher = false;
    }

    /// Process one decrypted inbound frame.
    pub fn receive(&mut self, packet: Packet, now: Instant) -> Received {
        let mut out = Received::default();
        let Some(seq) = packet.header.seq.filter(|seq| *seq >= 0) else {
            out.rejected = Some(Rejection::InvalidSeq);
            return out;
        };

        if self.manual {
            self.in_seq = seq;
            out.deliver.push(packet);
            return out;
        }

        if seq > self.in_done.saturating_add(REORDER_WINDOW) {
            out.rejected = Some(Rejection::TooFarAhead(seq));
            return out;
        }
        self.in_seq = seq;

        let bare_ack = packet.header.is_ack_only() && packet.body.is_none();
        if !bare_ack {
            if seq.saturating_sub(self.out_confirmed) > ACK_GAP || self.in_dups > 0 {
                out.ack_now = true;
            } else if !self.flusher {
                self.flusher = true;
                out.start_flusher = true;
            }
        }

        if seq <= self.in_done || self.is_buffered(seq) {
            self.in_dups += 1;
            out.rejected = Some(Rejection::Duplicate(seq));
            return out;
        }

        let miss = packet.header.miss.clone().unwrap_or_default();
        if miss.len() > MISS_MAX {
            out.rejected = Some(Rejection::TooManyMisses(miss.len()));
            return out;
        }

        if let Some(ack) = packet.header.ack {
            if ack > self.last_ack && ack <= self.out_seq {
                self.last_ack = ack;
                self.apply_ack(ack, &miss, now, &mut out.resend);
            }
        }

        let offset = (seq - (self.in_done + 1)) as usize;
        if self.inq.len() <= offset {
            self.inq.resize_with(offset + 1, || None);
        }
        self.inq[offset] = Some(packet);

        while let Some(Some(_)) = self.inq.front() {
            if let Some(Some(next)) = self.inq.pop_front() {
                self.in_done += 1;
                out.deliver.push(next);
            }
        }
        out
    }

    fn is_buffered(&self, seq: i64) -> bool {
        let offset = seq - (self.in_done + 1);
        offset >= 0
            && self
                .inq
                .get(offset as usize)
                .is_some_and(|slot| slot.is_some())
    }

    /// Release acknowledged frames (firing their completion) and collect the
    /// missed ones that are due for retransmission.
    fn apply_ack(&mut self, ack: i64, miss: &[i64], now: Instant, resend: &mut Vec<Packet>) {
        let pending = std::mem::take(&mut self.outq);
        for mut entry in pending {
            let missed = miss.contains(&entry.seq);
            if entry.seq <= ack && !missed {
                if let Some(done) = entry.done.take() {
                    let _ = done.send(());
                }
                continue;
            }
            if missed
                && entry
                    .resent_at
                    .is_none_or(|at| now.saturating_duration_since(at) >= RESEND_INTERVAL)
            {
                entry.resent_at = Some(now);
                resend.push(entry.packet.clone());
            }
            self.outq.push(entry);
        }
    }
}

// ============================================================================
// Application Handles
// ============================================================================

/// Cloneable sending half of a stream.
#[derive(Clone, Debug)]
pub struct StreamSender {
    peer: Hashname,
    id: Hashname,
    cmd_tx: mpsc::Sender<Command>,
}

impl StreamSender {
    pub fn peer(&self) -> Hashname {
        self.peer
    }

    pub fn id(&self) -> Hashname {
        self.id
    }

    /// Queue a frame. Delivery is best effort; the call returns once the node
    /// has accepted the frame.
    pub async fn send(&self, header: Header, body: Option<Vec<u8>>) -> Result<()> {
        self.submit(header, body, None).await
    }

    /// Send a frame and wait until the peer acknowledges it.
    pub async fn send_confirmed(&self, header: Header, body: Option<Vec<u8>>) -> Result<()> {
        let rx = self.send_tracked(header, body).await?;
        rx.await
            .map_err(|_| anyhow!("stream closed before acknowledgement"))
    }

    /// Send a frame and return a receiver that fires on acknowledgement.
    pub async fn send_tracked(
        &self,
        header: Header,
        body: Option<Vec<u8>>,
    ) -> Result<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.submit(header, body, Some(tx)).await?;
        Ok(rx)
    }

    pub async fn end(&self) -> Result<()> {
        self.send(Header::ending(None), None).await
    }

    async fn submit(
        &self,
        header: Header,
        body: Option<Vec<u8>>,
        done: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        self.cmd_tx
            .send(Command::StreamSend {
                peer: self.peer,
                stream: self.id,
                header,
                body,
                done,
            })
            .await
            .map_err(|_| anyhow!("node has shut down"))
    }
}

/// An application's end of a stream: send frames and receive the peer's frames
/// in order.
#[derive(Debug)]
pub struct StreamHandle {
    sender: StreamSender,
    rx: mpsc::UnboundedReceiver<Packet>,
}

impl StreamHandle {
    pub(crate) fn new(
        peer: Hashname,
        id: Hashname,
        cmd_tx: mpsc::Sender<Command>,
        rx: mpsc::UnboundedReceiver<Packet>,
    ) -> Self {
        Self {
            sender: StreamSender { peer, id, cmd_tx },
            rx,
        }
    }

    pub fn peer(&self) -> Hashname {
        self.sender.peer
    }

    pub fn id(&self) -> Hashname {
        self.sender.id
    }

    pub fn sender(&self) -> StreamSender {
        self.sender.clone()
    }

    pub async fn send(&self, header: Header, body: Option<Vec<u8>>) -> Result<()> {
        self.sender.send(header, body).await
    }

    pub async fn send_confirmed(&self, header: Header, body: Option<Vec<u8>>) -> Result<()> {
        self.sender.send_confirmed(header, body).await
    }

    pub async fn end(&self) -> Result<()> {
        self.sender.end().await
    }

    /// Next in-order frame from the peer. `None` once the node drops the
    /// stream.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    pub fn into_parts(self) -> (StreamSender, mpsc::UnboundedReceiver<Packet>) {
        (self.sender, self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Stream {
        Stream::new(Hashname::random(), Handler::Discard)
    }

    fn frame(seq: i64, body: &str) -> Packet {
        let mut header = Header::typed("data");
        header.seq = Some(seq);
        Packet::new(header, Some(body.as_bytes().to_vec()))
    }

    fn ack_frame(seq: i64, ack: i64, miss: Vec<i64>) -> Packet {
        Packet::new(
            Header {
                seq: Some(seq),
                ack: Some(ack),
                miss: Some(miss),
                ..Header::default()
            },
            None,
        )
    }

    fn bodies(packets: &[Packet]) -> Vec<String> {
        packets
            .iter()
            .map(|p| String::from_utf8(p.body.clone().unwrap_or_default()).unwrap())
            .collect()
    }

    #[test]
    fn out_of_order_frames_deliver_in_order_exactly_once() {
        let mut s = stream();
        let now = Instant::now();

        let first = s.receive(frame(0, "a"), now);
        assert_eq!(bodies(&first.deliver), vec!["a"]);

        let gap = s.receive(frame(2, "c"), now);
        assert!(gap.deliver.is_empty());
        assert!(gap.rejected.is_none());

        let fill = s.receive(frame(1, "b"), now);
        assert_eq!(bodies(&fill.deliver), vec!["b", "c"]);

        let dup = s.receive(frame(1, "b"), now);
        assert!(dup.deliver.is_empty());
        assert_eq!(dup.rejected, Some(Rejection::Duplicate(1)));
    }

    #[test]
    fn buffered_duplicate_is_dropped() {
        let mut s = stream();
        let now = Instant::now();
        s.receive(frame(3, "d"), now);
        let dup = s.receive(frame(3, "d"), now);
        assert_eq!(dup.rejected, Some(Rejection::Duplicate(3)));
    }

    #[test]
    fn outbound_frames_are_numbered_and_report_misses() {
        let mut s = stream();
        let now = Instant::now();
        s.receive(frame(0, "a"), now);
        s.receive(frame(3, "d"), now);

        let packet = s.prepare_send(Some(Header::typed("x")), None, None).unwrap().unwrap();
        assert_eq!(packet.header.seq, Some(0));
        assert_eq!(packet.header.ack, Some(3));
        assert_eq!(packet.header.miss, Some(vec![1, 2]));
        assert_eq!(packet.header.stream, Some(s.id().to_hex()));

        let next = s.prepare_send(Some(Header::typed("x")), None, None).unwrap().unwrap();
        assert_eq!(next.header.seq, Some(1));
        assert_eq!(s.unacked(), 2);
    }

    #[test]
    fn bare_ack_is_suppressed_when_nothing_new() {
        let mut s = stream();
        assert!(s.prepare_send(None, None, None).unwrap().is_none());

        s.receive(frame(0, "a"), Instant::now());
        s.receive(frame(1, "b"), Instant::now());
        let ack = s.prepare_send(None, None, None).unwrap().unwrap();
        assert!(ack.header.is_ack_only());
        assert_eq!(ack.header.ack, Some(1));

        assert!(s.prepare_send(None, None, None).unwrap().is_none());
    }

    #[test]
    fn duplicates_force_an_ack() {
        let mut s = stream();
        let now = Instant::now();
        s.receive(frame(0, "a"), now);
        s.prepare_send(None, None, None).unwrap();

        s.receive(frame(0, "a"), now);
        let forced = s.prepare_send(None, None, None).unwrap();
        assert!(forced.is_some());
    }

    #[test]
    fn ack_scheduling() {
        let mut s = stream();
        let now = Instant::now();

        let first = s.receive(frame(0, "a"), now);
        assert!(first.start_flusher);
        assert!(!first.ack_now);

        let second = s.receive(frame(1, "b"), now);
        assert!(!second.start_flusher, "only one flusher at a time");

        let jump = s.receive(frame(40, "far"), now);
        assert!(jump.ack_now);

        s.flusher_fired();
        let after = s.receive(frame(2, "c"), now);
        assert!(after.start_flusher);
        assert!(!after.ack_now);
    }

    #[test]
    fn duplicate_makes_next_frame_ack_immediately() {
        let mut s = stream();
        let now = Instant::now();
        s.receive(frame(0, "a"), now);
        s.receive(frame(0, "a"), now);
        let next = s.receive(frame(1, "b"), now);
        assert!(next.ack_now);
    }

    #[test]
    fn bare_acks_do_not_schedule_acks() {
        let mut s = stream();
        let result = s.receive(ack_frame(0, -1, vec![]), Instant::now());
        assert!(!result.start_flusher);
        assert!(!result.ack_now);
        assert_eq!(result.deliver.len(), 1);
    }

    #[test]
    fn first_frame_is_acked_without_a_reply() {
        let mut s = stream();
        let opening = s.prepare_send(Some(Header::typed("x")), None, None).unwrap().unwrap();
        assert_eq!(opening.header.ack, None, "nothing received yet");

        let mut peer = stream();
        peer.receive(frame(0, "a"), Instant::now());
        let ack = peer.prepare_send(None, None, None).unwrap().unwrap();
        assert_eq!(ack.header.ack, Some(0));
    }

    #[test]
    fn acknowledged_frames_fire_completion() {
        let mut s = stream();
        let (tx, mut rx) = oneshot::channel();
        s.prepare_send(Some(Header::typed("x")), None, Some(tx)).unwrap();
        s.prepare_send(Some(Header::typed("y")), None, None).unwrap();

        s.receive(ack_frame(0, 0, vec![]), Instant::now());
        assert!(rx.try_recv().is_ok());
        assert_eq!(s.unacked(), 1);
    }

    #[test]
    fn stale_or_future_acks_are_ignored() {
        let mut s = stream();
        s.prepare_send(Some(Header::typed("x")), None, None).unwrap();

        s.receive(ack_frame(0, 5, vec![]), Instant::now());
        assert_eq!(s.unacked(), 1, "ack beyond out_seq ignored");

        s.receive(ack_frame(1, 0, vec![]), Instant::now());
        assert_eq!(s.unacked(), 0);
    }

    #[test]
    fn missed_frame_is_resent_at_most_every_five_seconds() {
        let mut s = stream();
        for _ in 0..6 {
            s.prepare_send(Some(Header::typed("x")), None, None).unwrap();
        }
        let start = Instant::now();

        let first = s.receive(ack_frame(0, 3, vec![1]), start);
        assert_eq!(first.resend.len(), 1);
        assert_eq!(first.resend[0].header.seq, Some(1));

        let within = s.receive(ack_frame(1, 4, vec![1]), start + Duration::from_secs(2));
        assert!(within.resend.is_empty());

        let later = s.receive(ack_frame(2, 5, vec![1]), start + Duration::from_secs(6));
        assert_eq!(later.resend.len(), 1);

        // frame 1 is still pending, everything else up to 5 was acknowledged
        assert_eq!(s.unacked(), 1);
    }

    #[test]
    fn window_and_miss_limits() {
        let mut s = stream();
        let now = Instant::now();

        let far = s.receive(frame(101, "x"), now);
        assert_eq!(far.rejected, Some(Rejection::TooFarAhead(101)));

        let edge = s.receive(frame(99, "y"), now);
        assert!(edge.rejected.is_none());

        let misses = s.receive(ack_frame(5, 0, (0..101).collect()), now);
        assert_eq!(misses.rejected, Some(Rejection::TooManyMisses(101)));
    }

    #[test]
    fn negative_or_missing_seq_is_rejected() {
        let mut s = stream();
        let negative = s.receive(frame(-1, "x"), Instant::now());
        assert_eq!(negative.rejected, Some(Rejection::InvalidSeq));

        let missing = s.receive(Packet::new(Header::typed("x"), None), Instant::now());
        assert_eq!(missing.rejected, Some(Rejection::InvalidSeq));
    }

    #[test]
    fn extreme_seq_values_are_rejected_without_state_change() {
        let mut s = stream();
        let now = Instant::now();

        let huge = s.receive(frame(i64::MAX, "x"), now);
        assert_eq!(huge.rejected, Some(Rejection::TooFarAhead(i64::MAX)));
        assert!(huge.deliver.is_empty());
        assert!(!huge.ack_now && !huge.start_flusher);

        let min = s.receive(frame(i64::MIN, "x"), now);
        assert_eq!(min.rejected, Some(Rejection::InvalidSeq));

        // Straight off the wire.
        let wire = br#"{"type":"chat","stream":"0000000000000000000000000000000000000000","seq":9223372036854775807}"#;
        let mut buf = (wire.len() as u16).to_be_bytes().to_vec();
        buf.extend_from_slice(wire);
        let decoded = crate::messages::decode(&buf).unwrap();
        let result = s.receive(decoded, now);
        assert_eq!(result.rejected, Some(Rejection::TooFarAhead(i64::MAX)));

        // The stream still works afterwards, and no ack covers the bogus seq.
        let ok = s.receive(frame(0, "a"), now);
        assert_eq!(bodies(&ok.deliver), vec!["a"]);
        let ack = s.prepare_send(None, None, None).unwrap().unwrap();
        assert_eq!(ack.header.ack, Some(0));
    }

    #[test]
    fn seq_far_past_confirmed_forces_ack_without_overflow() {
        let mut s = stream();
        let now = Instant::now();
        for seq in 0..=ACK_GAP {
            s.receive(frame(seq, "x"), now);
        }
        let late = s.receive(frame(ACK_GAP + 1, "y"), now);
        assert!(late.ack_now);
    }

    #[test]
    fn manual_streams_deliver_immediately() {
        let mut s = stream().manual();
        let result = s.receive(frame(5, "x"), Instant::now());
        assert_eq!(bodies(&result.deliver), vec!["x"]);
        assert!(!result.start_flusher);
    }

    #[test]
    fn ended_stream_refuses_payloads_but_swallows_acks() {
        let mut s = stream();
        s.prepare_send(Some(Header::ending(None)), None, None).unwrap();
        assert!(s.is_ended());

        assert_eq!(
            s.prepare_send(Some(Header::typed("x")), None, None).unwrap_err(),
            StreamError::Ended
        );
        s.receive(frame(0, "a"), Instant::now());
        assert!(s.prepare_send(None, None, None).unwrap().is_none());
    }
}
