//! End-to-end badge protocol tests against a scripted badge.
//!
//! These drive a real `Adapter` in detached (loopback) mode: a simulator
//! consumes the adapter's outbound command queue, plays the badge's side
//! of the protocol (write credits, chunk ACKs, the stash register), and
//! injects the corresponding inbound records via `feed_line`.

use std::cell::RefCell;
use std::rc::Rc;

use nametag_device::frame::{ack_message, decode_message, encode_message, tag};
use nametag_device::{decode_stash, Badge, Frame, ProtocolError};
use nametag_transport::records::{decode_bytes, encode_bytes};
use nametag_transport::{Adapter, Device};
use tokio::sync::mpsc;

const HANDLE: i64 = 1;

#[derive(Clone, Copy, PartialEq)]
enum AckMode {
    /// Acknowledge every chunk correctly.
    Normal,
    /// Corrupt the zero slot of the first ACK, then behave.
    CorruptFirst,
    /// Credit writes but never acknowledge chunks.
    Silent,
}

#[derive(Default)]
struct SimState {
    /// Raw register contents (what a GATT read of attribute 3 returns).
    register: Vec<u8>,
    /// Reassembled bulk payload across chunks.
    bulk_body: Vec<u8>,
    /// How many times each chunk index was received.
    chunk_counts: Vec<u32>,
    /// Whether the CCCD subscribe arrived before any bulk chunk.
    subscribed: bool,
    acks_sent: u32,
}

struct Sim {
    adapter: Rc<Adapter>,
    state: Rc<RefCell<SimState>>,
    mode: AckMode,
}

impl Sim {
    fn new(adapter: Rc<Adapter>, mode: AckMode) -> (Sim, Rc<RefCell<SimState>>) {
        let state = Rc::new(RefCell::new(SimState::default()));
        (
            Sim {
                adapter,
                state: state.clone(),
                mode,
            },
            state,
        )
    }

    /// Consume outbound commands forever; the test drops this future once
    /// the operation under test completes.
    async fn run(self, mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        let mut assembly: Vec<u8> = Vec::new();
        while let Some(raw) = out_rx.recv().await {
            let line = String::from_utf8(raw).unwrap();
            let mut parts = line.split_ascii_whitespace();
            match parts.next() {
                Some("disconn") => {
                    self.adapter.feed_line(&format!("disconn={HANDLE}"));
                }
                Some("read") => {
                    let data = encode_bytes(&self.state.borrow().register);
                    self.adapter
                        .feed_line(&format!("read={HANDLE} attr=3 data={data}"));
                }
                Some("write") => {
                    let _handle = parts.next().unwrap();
                    let attr: u16 = parts.next().unwrap().parse().unwrap();
                    let data = decode_bytes(parts.next().unwrap_or(""));
                    self.adapter.feed_line(&format!("write={HANDLE} count=1"));
                    match attr {
                        4 => self.state.borrow_mut().subscribed = true,
                        3 => self.on_data(&mut assembly, &data),
                        _ => panic!("write to unexpected attribute {attr}"),
                    }
                }
                other => panic!("unexpected command: {other:?} in {line:?}"),
            }
        }
    }

    fn on_data(&self, assembly: &mut Vec<u8>, data: &[u8]) {
        if assembly.is_empty() && data.first() != Some(&0x01) {
            // Bare packet: the stash register.
            self.state.borrow_mut().register = data.to_vec();
            return;
        }
        assembly.extend_from_slice(data);
        if assembly.last() != Some(&0x03) {
            return;
        }
        let framed = std::mem::take(assembly);
        let (msg_tag, body) = decode_message(&framed).unwrap();
        // Any framed packet clobbers the stash register.
        self.state.borrow_mut().register = framed;

        if msg_tag != tag::GLYPHS && msg_tag != tag::FRAMES {
            return; // mode/speed/brightness: no acknowledgement
        }

        // Wrapped bulk chunk: {0, total_be16, index_be16, len_u8, data…, xor}.
        assert!(body.len() >= 7);
        let xor = body[..body.len() - 1].iter().fold(0u8, |acc, &b| acc ^ b);
        assert_eq!(xor, body[body.len() - 1], "chunk XOR mismatch");
        let index = u16::from_be_bytes([body[3], body[4]]) as usize;
        let len = body[5] as usize;

        let mut state = self.state.borrow_mut();
        assert!(state.subscribed, "bulk chunk before CCCD subscribe");
        if state.chunk_counts.len() <= index {
            state.chunk_counts.resize(index + 1, 0);
        }
        state.chunk_counts[index] += 1;
        if state.chunk_counts[index] == 1 {
            state.bulk_body.extend_from_slice(&body[6..6 + len]);
        }

        let ack = match self.mode {
            AckMode::Silent => return,
            AckMode::CorruptFirst if state.acks_sent == 0 => {
                encode_message(msg_tag, &[0x42, body[3], body[4], 0x00])
            }
            _ => ack_message(msg_tag, index as u16),
        };
        state.acks_sent += 1;
        drop(state);
        self.adapter
            .feed_line(&format!("notify={HANDLE} attr=3 data={}", encode_bytes(&ack)));
    }
}

fn scan_badge(adapter: &Adapter) -> Rc<Device> {
    adapter.feed_line("scan=aa:bb:cc s=-55 u=fff0 m=%fe%ca%00%00%00%00%ff%ff");
    adapter.devices().pop().unwrap()
}

/// Detached adapter with a connected badge; outbound commands so far are
/// drained, so the returned queue starts clean.
async fn connected_badge(
    adapter: &Rc<Adapter>,
    out_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> Badge {
    let dev = scan_badge(adapter);
    let (result, _) = tokio::join!(adapter.connect(&dev), async {
        adapter.feed_line(&format!("conn=aa:bb:cc handle={HANDLE}"));
    });
    result.unwrap();
    while out_rx.try_recv().is_ok() {}

    let badge = Badge::new(adapter.clone(), dev).unwrap();
    assert_eq!(badge.id(), "CAFE");
    badge
}

#[tokio::test(start_paused = true)]
async fn bulk_upload_three_chunks() {
    let (adapter, mut out_rx) = Adapter::detached();
    let badge = connected_badge(&adapter, &mut out_rx).await;
    let (sim, state) = Sim::new(adapter.clone(), AckMode::Normal);
    let frames = vec![Frame::blank(), Frame::blank(), Frame::blank()];

    tokio::select! {
        result = badge.show_frames(&frames, 250) => result.unwrap(),
        _ = sim.run(out_rx) => unreachable!(),
    }

    let state = state.borrow();
    assert_eq!(state.chunk_counts, vec![1, 1, 1]);
    // 24 zeros + count + msec + 3 × 96 bytes of bitmap.
    assert_eq!(state.bulk_body.len(), 27 + 3 * 96);
    assert_eq!(state.bulk_body[24], 3);
    assert_eq!(
        u16::from_be_bytes([state.bulk_body[25], state.bulk_body[26]]),
        250
    );
}

#[tokio::test(start_paused = true)]
async fn corrupted_ack_causes_exactly_one_resend() {
    let (adapter, mut out_rx) = Adapter::detached();
    let badge = connected_badge(&adapter, &mut out_rx).await;
    let (sim, state) = Sim::new(adapter.clone(), AckMode::CorruptFirst);
    let frames = vec![Frame::blank(), Frame::blank(), Frame::blank()];

    tokio::select! {
        result = badge.show_frames(&frames, 250) => result.unwrap(),
        _ = sim.run(out_rx) => unreachable!(),
    }

    // Chunk 0 was delivered twice (original + one retry), the rest once.
    assert_eq!(state.borrow().chunk_counts, vec![2, 1, 1]);
}

#[tokio::test(start_paused = true)]
async fn silent_badge_times_out_per_chunk() {
    let (adapter, mut out_rx) = Adapter::detached();
    let badge = connected_badge(&adapter, &mut out_rx).await;
    let (sim, _state) = Sim::new(adapter.clone(), AckMode::Silent);
    let frames = vec![Frame::blank()];

    let result = tokio::select! {
        result = badge.show_frames(&frames, 250) => result,
        _ = sim.run(out_rx) => unreachable!(),
    };
    assert!(matches!(result, Err(ProtocolError::AckTimeout { chunk: 0 })));
}

#[tokio::test(start_paused = true)]
async fn stash_round_trip() {
    let (adapter, mut out_rx) = Adapter::detached();
    let badge = connected_badge(&adapter, &mut out_rx).await;
    let (sim, state) = Sim::new(adapter.clone(), AckMode::Normal);
    let payload = b"\x03GAM\x00\x00MAN";

    tokio::select! {
        result = async {
            badge.write_stash(payload).await?;
            badge.read_stash().await
        } => {
            let stash = result.unwrap().unwrap();
            assert_eq!(stash.data, payload);
            assert!(!stash.from_backup);
            assert!(!stash.displaced);
        }
        _ = sim.run(out_rx) => unreachable!(),
    }

    // The register holds the raw packet and still validates.
    let register = state.borrow().register.clone();
    assert_eq!(register[0], 0x89);
    assert_eq!(decode_stash(&register).unwrap(), payload);
}

#[tokio::test(start_paused = true)]
async fn lost_register_falls_back_to_displaced_backup() {
    let (adapter, mut out_rx) = Adapter::detached();
    let badge = connected_badge(&adapter, &mut out_rx).await;
    let (sim, state) = Sim::new(adapter.clone(), AckMode::Normal);
    let payload = b"\x03GAM\x00\x00TWIN";

    tokio::select! {
        result = async {
            badge.write_stash(payload).await?;
            // A display packet clobbers the on-device register.
            badge.set_brightness(255).await?;
            badge.read_stash().await
        } => {
            let stash = result.unwrap().unwrap();
            assert_eq!(stash.data, payload);
            assert!(stash.from_backup);
            assert!(stash.displaced);
        }
        _ = sim.run(out_rx) => unreachable!(),
    }

    // The register really does hold the brightness frame now.
    assert!(decode_stash(&state.borrow().register).is_none());
}

#[tokio::test]
async fn bad_readback_fails_the_stash_write() {
    let (adapter, mut out_rx) = Adapter::detached();
    let badge = connected_badge(&adapter, &mut out_rx).await;

    // Hand-drive the exchange: credit the write, then answer the verify
    // read with a register that does not start with what was written.
    let (result, _) = tokio::join!(badge.write_stash(b"HELLO"), async {
        while let Some(raw) = out_rx.recv().await {
            let line = String::from_utf8(raw).unwrap();
            match line.split_ascii_whitespace().next() {
                Some("write") => adapter.feed_line(&format!("write={HANDLE} count=1")),
                Some("read") => {
                    adapter.feed_line(&format!("read={HANDLE} attr=3 data=%00%00junk"));
                    break;
                }
                _ => {}
            }
        }
    });
    assert!(matches!(result, Err(ProtocolError::StashReadback { .. })));
}
