//! Adapter driver for the Bluefruit serial bridge
//!
//! The adapter multiplexes BLE scans, connect/disconnect handshakes and
//! GATT traffic for every remote device over one serial line. This module
//! is the single owner of that line: an internal pump task reads inbound
//! records and drains the outbound command queue, and every asynchronous
//! event is routed to a per-device completion cell.
//!
//! ```text
//!   [SerialLine]  ←→  pump task  ←→  Adapter (device table, completions)
//!                                       |
//!                             Connection / per-badge tasks
//! ```
//!
//! Completion cells are single-producer/single-consumer oneshot channels:
//! the adapter holds the sender, the requesting task holds the receiver.
//! There is no pub/sub bus; routing is deterministic by (handle, attribute).

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::TransportError;
use crate::records::{self, Record};
use crate::serial::{SerialLine, SerialReader, SerialWriter};

/// Adapter limits and timing.
pub mod limits {
    use std::time::Duration;

    /// Concurrent connections the adapter firmware supports.
    pub const MAX_CONNECTIONS: usize = 5;
    /// Outstanding GATT writes allowed per device before backpressure.
    pub const MAX_WRITES: usize = 5;
    /// Hard limit on one outbound command line. Documented as 64 by the
    /// adapter firmware, but 80 is what it actually accepts.
    pub const MAX_COMMAND_SIZE: usize = 80;
    /// Devices unseen for longer than this are evicted on `time` events.
    pub const MAX_SCAN_AGE: Duration = Duration::from_secs(60);
    /// Inbound silence longer than this fails the session. Heuristic;
    /// calibrate against the adapter firmware in use.
    pub const READ_SILENCE: Duration = Duration::from_millis(1500);
}

type ConnectWaiter = oneshot::Sender<Result<i64, TransportError>>;
type DisconnectWaiter = oneshot::Sender<Result<(), TransportError>>;
type WriteWaiter = oneshot::Sender<Result<(), TransportError>>;
type ReadWaiter = oneshot::Sender<Result<Vec<u8>, TransportError>>;

/// Connection handle state of one device.
///
/// `Down` → `Connecting` (connect request) → `Up` (`conn`) or `Down`
/// (`conn_fail`); `Up` → `Disconnecting` (disconnect request) → `Down`
/// (`disconn`). Any state collapses to `Down` when the session fails.
enum Link {
    Down,
    Connecting(Option<ConnectWaiter>),
    Up(i64),
    Disconnecting(Option<DisconnectWaiter>),
}

struct DeviceState {
    last_seen: Instant,
    rssi: i16,
    uuids: HashSet<u16>,
    mdata: Vec<u8>,
    link: Link,
    reads: HashMap<u16, ReadWaiter>,
    notifies: HashMap<u16, oneshot::Sender<Vec<u8>>>,
    writes: VecDeque<WriteWaiter>,
    last_write: Option<oneshot::Receiver<Result<(), TransportError>>>,
}

/// One observed remote device, keyed by its advertised address.
pub struct Device {
    addr: String,
    state: RefCell<DeviceState>,
    // Signalled whenever a write slot frees up.
    write_slots: Notify,
}

impl Device {
    fn new(addr: &str) -> Device {
        Device {
            addr: addr.to_string(),
            state: RefCell::new(DeviceState {
                last_seen: Instant::now(),
                rssi: 0,
                uuids: HashSet::new(),
                mdata: Vec::new(),
                link: Link::Down,
                reads: HashMap::new(),
                notifies: HashMap::new(),
                writes: VecDeque::new(),
                last_write: None,
            }),
            write_slots: Notify::new(),
        }
    }

    /// Stable address string from the advertisement.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// When the most recent advertisement or event arrived.
    pub fn last_seen(&self) -> Instant {
        self.state.borrow().last_seen
    }

    /// Last advertised signal strength; zero if unknown.
    pub fn rssi(&self) -> i16 {
        self.state.borrow().rssi
    }

    /// Whether the advertisement carried the given 16-bit service UUID.
    pub fn advertises_service(&self, uuid: u16) -> bool {
        self.state.borrow().uuids.contains(&uuid)
    }

    /// The most recent manufacturer-specific payload.
    pub fn manufacturer_data(&self) -> Vec<u8> {
        self.state.borrow().mdata.clone()
    }

    /// Adapter handle when connected.
    pub fn handle(&self) -> Option<i64> {
        match self.state.borrow().link {
            Link::Up(h) => Some(h),
            _ => None,
        }
    }

    pub fn fully_connected(&self) -> bool {
        matches!(self.state.borrow().link, Link::Up(_))
    }

    pub fn fully_disconnected(&self) -> bool {
        matches!(self.state.borrow().link, Link::Down)
    }

    /// A connect handshake is in flight for this device.
    pub fn connect_pending(&self) -> bool {
        matches!(self.state.borrow().link, Link::Connecting(_))
    }

    /// Outstanding (un-credited) GATT writes.
    pub fn pending_writes(&self) -> usize {
        self.state.borrow().writes.len()
    }

    /// Fail every pending read/write and drop armed notify cells.
    fn fail_ops(&self, err: &TransportError) {
        let (reads, writes) = {
            let mut st = self.state.borrow_mut();
            st.notifies.clear();
            let reads: Vec<_> = st.reads.drain().collect();
            let writes: Vec<_> = st.writes.drain(..).collect();
            (reads, writes)
        };
        for (_, tx) in reads {
            let _ = tx.send(Err(err.clone()));
        }
        for tx in writes {
            let _ = tx.send(Err(err.clone()));
        }
        self.write_slots.notify_waiters();
    }

    /// Collapse the link to `Down`, resolving whichever handshake waiter
    /// was outstanding. `result` is what a pending *disconnect* receives;
    /// a pending *connect* always receives an error.
    fn settle_link(&self, result: Result<(), TransportError>) {
        let link = std::mem::replace(&mut self.state.borrow_mut().link, Link::Down);
        match link {
            Link::Connecting(Some(w)) => {
                let err = match &result {
                    Err(e) => e.clone(),
                    Ok(()) => TransportError::Connection(format!("{}: disconnected", self.addr)),
                };
                let _ = w.send(Err(err));
            }
            Link::Disconnecting(Some(w)) => {
                let _ = w.send(result);
            }
            _ => {}
        }
    }

    fn touch(&self) {
        self.state.borrow_mut().last_seen = Instant::now();
    }
}

/// Driver for one adapter session.
///
/// Single-threaded cooperative ownership: construct and use inside a
/// `tokio::task::LocalSet`. Clones of the `Rc` may be held by any number
/// of local tasks; all futures handed out are single-consumer.
pub struct Adapter {
    devices: RefCell<HashMap<String, Rc<Device>>>,
    handles: RefCell<HashMap<i64, Rc<Device>>>,
    busy_connecting: RefCell<HashSet<String>>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    failure: RefCell<Option<TransportError>>,
    pump: RefCell<Option<tokio::task::JoinHandle<()>>>,
}

impl Adapter {
    /// Open the serial device and start the I/O pump.
    ///
    /// Must be called inside a `LocalSet`.
    pub fn open(path: &str) -> Result<Rc<Adapter>, TransportError> {
        let line = SerialLine::open(path)?;
        let (reader, writer) = line.split();
        Ok(Adapter::attach(reader, writer))
    }

    /// Start an adapter session over an already-open byte channel.
    ///
    /// Must be called inside a `LocalSet`.
    pub fn attach<R, W>(reader: SerialReader<R>, writer: SerialWriter<W>) -> Rc<Adapter>
    where
        R: AsyncRead + Unpin + 'static,
        W: AsyncWrite + Unpin + 'static,
    {
        let (adapter, out_rx) = Adapter::detached();
        let pump = tokio::task::spawn_local(Adapter::pump(adapter.clone(), reader, writer, out_rx));
        *adapter.pump.borrow_mut() = Some(pump);
        adapter
    }

    /// Build an adapter with no serial device attached, returning the
    /// outbound command queue. Inbound records are supplied via
    /// [`Adapter::feed_line`]. Used by tests and event-sequence replay.
    pub fn detached() -> (Rc<Adapter>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let adapter = Rc::new(Adapter {
            devices: RefCell::new(HashMap::new()),
            handles: RefCell::new(HashMap::new()),
            busy_connecting: RefCell::new(HashSet::new()),
            out_tx,
            failure: RefCell::new(None),
            pump: RefCell::new(None),
        });
        (adapter, out_rx)
    }

    async fn pump<R, W>(
        adapter: Rc<Adapter>,
        mut reader: SerialReader<R>,
        mut writer: SerialWriter<W>,
        mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let path = reader.path().to_string();
        let mut buf = BytesMut::with_capacity(4096);
        let mut seen_lines: u64 = 0;
        let mut last_rx = Instant::now();
        let result = loop {
            tokio::select! {
                res = reader.read_into(&mut buf) => match res {
                    Err(e) => break Err(e),
                    Ok(_) => {
                        last_rx = Instant::now();
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let raw = buf.split_to(pos + 1);
                            seen_lines += 1;
                            if seen_lines == 1 {
                                continue; // first line may be truncated
                            }
                            let text = String::from_utf8_lossy(&raw[..raw.len() - 1]);
                            adapter.feed_line(text.trim());
                        }
                    }
                },
                _ = tokio::time::sleep_until(last_rx + limits::READ_SILENCE) => {
                    break Err(TransportError::Port(format!(
                        "{path}: adapter silent for {:?}",
                        limits::READ_SILENCE
                    )));
                }
                cmd = out_rx.recv() => match cmd {
                    Some(data) => {
                        if let Err(e) = writer.write_all(&data).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
            }
        };
        if let Err(e) = result {
            error!("Adapter session failed: {e}");
            adapter.fail_session(e);
        }
    }

    /// Process one inbound record line.
    ///
    /// Called by the I/O pump; public so tests and replay tooling can
    /// drive the adapter without a serial device.
    pub fn feed_line(&self, text: &str) {
        let Some(record) = Record::parse(text) else {
            return;
        };
        match record.event() {
            "scan" => self.on_scan(&record),
            "time" => self.on_time(&record),
            "ERR" => error!("Adapter reported: {record}"),
            event => {
                debug!("<= {record}");
                match event {
                    "conn" => self.on_conn(&record),
                    "conn_fail" => self.on_conn_fail(&record),
                    "disconn" => self.on_disconn(&record),
                    "disconn_fail" => self.on_disconn_fail(&record),
                    "read" => self.on_read(&record),
                    "read_fail" => self.on_read_fail(&record),
                    "notify" => self.on_notify(&record),
                    "write" => self.on_write(&record),
                    "write_fail" => self.on_write_fail(&record),
                    _ => {}
                }
            }
        }
    }

    // ---- Event handlers ----

    fn on_scan(&self, record: &Record) {
        let Some(addr) = record.get("scan") else {
            warn!("Unmatched \"scan\": {record}");
            return;
        };
        let rssi = record.get_int("s").unwrap_or(0) as i16;
        let uuids: HashSet<u16> = record
            .get("u")
            .unwrap_or("")
            .split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|u| u16::from_str_radix(u, 16).ok())
            .collect();
        let mdata = record.get_bytes("m");

        let dev = self
            .devices
            .borrow_mut()
            .entry(addr.to_string())
            .or_insert_with(|| {
                debug!("NEW device {addr}");
                Rc::new(Device::new(addr))
            })
            .clone();
        let mut st = dev.state.borrow_mut();
        st.last_seen = Instant::now();
        st.rssi = rssi;
        st.uuids = uuids;
        st.mdata = mdata;
    }

    fn on_time(&self, _record: &Record) {
        let now = Instant::now();
        self.devices.borrow_mut().retain(|addr, dev| {
            let st = dev.state.borrow();
            let age = now.saturating_duration_since(st.last_seen);
            if age <= limits::MAX_SCAN_AGE || !matches!(st.link, Link::Down) {
                true
            } else {
                debug!("LOST ({:.1}s): {addr}", age.as_secs_f64());
                false
            }
        });
    }

    fn on_conn(&self, record: &Record) {
        let (Some(addr), Some(handle)) = (record.get("conn"), record.get_int("handle")) else {
            warn!("Unmatched \"conn\": {record}");
            return;
        };
        let Some(dev) = self.devices.borrow().get(addr).cloned() else {
            warn!("Unmatched \"conn\": {record}");
            return;
        };
        self.handles.borrow_mut().insert(handle, dev.clone());
        let waiter = {
            let mut st = dev.state.borrow_mut();
            st.last_seen = Instant::now();
            match std::mem::replace(&mut st.link, Link::Up(handle)) {
                Link::Connecting(w) => w,
                _ => None,
            }
        };
        let claimed = match waiter {
            Some(w) => w.send(Ok(handle)).is_ok(),
            None => false,
        };
        if !claimed {
            // Requester gone (cancelled mid-connect) or the adapter
            // connected on its own: do not leak the connection.
            warn!("Orphaned connection to {addr}; disconnecting");
            drop(self.request_disconnect(&dev));
        }
    }

    fn on_conn_fail(&self, record: &Record) {
        let err = TransportError::Connection(format!("Connection failed: {record}"));
        let named = record
            .get("conn")
            .or_else(|| record.get("conn_fail"))
            .filter(|addr| !addr.is_empty())
            .and_then(|addr| self.devices.borrow().get(addr).cloned());
        let targets: Vec<Rc<Device>> = match named {
            Some(dev) => vec![dev],
            None => self
                .devices
                .borrow()
                .values()
                .filter(|d| d.connect_pending())
                .cloned()
                .collect(),
        };
        for dev in targets {
            if dev.connect_pending() {
                dev.touch();
                dev.settle_link(Err(err.clone()));
            }
        }
    }

    fn on_disconn(&self, record: &Record) {
        let Some(handle) = record.conn_handle() else {
            warn!("Unmatched \"disconn\": {record}");
            return;
        };
        let Some(dev) = self.handles.borrow_mut().remove(&handle) else {
            warn!("Unmatched \"disconn\": {record}");
            return;
        };
        dev.touch();
        let err = TransportError::Connection(format!("Disconnected: {record}"));
        dev.fail_ops(&err);
        dev.settle_link(Ok(()));
    }

    fn on_disconn_fail(&self, record: &Record) {
        let dev = record
            .conn_handle()
            .and_then(|h| self.handles.borrow().get(&h).cloned());
        let Some(dev) = dev else {
            warn!("Unmatched \"disconn_fail\": {record}");
            return;
        };
        dev.touch();
        dev.settle_link(Err(TransportError::Connection(format!(
            "Disconnection failed: {record}"
        ))));
    }

    fn device_for(&self, record: &Record) -> Option<Rc<Device>> {
        record
            .conn_handle()
            .and_then(|h| self.handles.borrow().get(&h).cloned())
    }

    fn on_read(&self, record: &Record) {
        let dev = self.device_for(record);
        let attr = record.get_int("attr").map(|a| a as u16);
        let waiter = match (&dev, attr) {
            (Some(dev), Some(attr)) => dev.state.borrow_mut().reads.remove(&attr),
            _ => None,
        };
        let Some(waiter) = waiter else {
            warn!("Unmatched \"read\": {record}");
            return;
        };
        if let Some(dev) = &dev {
            dev.touch();
        }
        let _ = waiter.send(Ok(record.get_bytes("data")));
    }

    fn on_read_fail(&self, record: &Record) {
        let dev = self.device_for(record);
        let attr = record.get_int("attr").map(|a| a as u16);
        let waiter = match (&dev, attr) {
            (Some(dev), Some(attr)) => dev.state.borrow_mut().reads.remove(&attr),
            _ => None,
        };
        let Some(waiter) = waiter else {
            warn!("Unmatched \"read_fail\": {record}");
            return;
        };
        if let Some(dev) = &dev {
            dev.touch();
        }
        let _ = waiter.send(Err(TransportError::Connection(format!(
            "Read failed: {record}"
        ))));
    }

    fn on_notify(&self, record: &Record) {
        let dev = self.device_for(record);
        let attr = record.get_int("attr").map(|a| a as u16);
        let waiter = match (&dev, attr) {
            (Some(dev), Some(attr)) => dev.state.borrow_mut().notifies.remove(&attr),
            _ => None,
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(record.get_bytes("data"));
            }
            None => debug!("Unclaimed \"notify\": {record}"),
        }
    }

    fn on_write(&self, record: &Record) {
        let Some(dev) = self.device_for(record) else {
            warn!("Unmatched \"write\": {record}");
            return;
        };
        let count = record.get_int("count").unwrap_or(0).max(0) as usize;
        dev.touch();
        let done: Vec<WriteWaiter> = {
            let mut st = dev.state.borrow_mut();
            if count > st.writes.len() {
                warn!(
                    "Unmatched \"write\" (count={count} > pending={}): {record}",
                    st.writes.len()
                );
            }
            let n = count.min(st.writes.len());
            st.writes.drain(..n).collect()
        };
        for tx in done {
            let _ = tx.send(Ok(()));
        }
        dev.write_slots.notify_waiters();
    }

    fn on_write_fail(&self, record: &Record) {
        let dev = self.device_for(record);
        let Some(dev) = dev.filter(|d| d.pending_writes() > 0) else {
            warn!("Unmatched \"write_fail\": {record}");
            return;
        };
        let err = TransportError::Connection(format!("Write failed: {record}"));
        let done: Vec<WriteWaiter> = dev.state.borrow_mut().writes.drain(..).collect();
        for tx in done {
            let _ = tx.send(Err(err.clone()));
        }
        dev.write_slots.notify_waiters();
    }

    // ---- Operations ----

    /// Request a connection to `dev` and wait for the handshake.
    ///
    /// Preconditions: the device is fully disconnected and no other
    /// connect is pending anywhere on the adapter.
    pub async fn connect(&self, dev: &Rc<Device>) -> Result<i64, TransportError> {
        if let Some(err) = self.failure() {
            return Err(err);
        }
        if self
            .devices
            .borrow()
            .values()
            .any(|d| d.connect_pending())
        {
            return Err(TransportError::Adapter(format!(
                "{}: another connect is already pending",
                dev.addr
            )));
        }
        let rx = {
            let mut st = dev.state.borrow_mut();
            if !matches!(st.link, Link::Down) {
                return Err(TransportError::Adapter(format!(
                    "{}: not fully disconnected",
                    dev.addr
                )));
            }
            let (tx, rx) = oneshot::channel();
            st.link = Link::Connecting(Some(tx));
            rx
        };
        if let Err(e) = self.send_line(&format!("conn {}", dev.addr)) {
            dev.state.borrow_mut().link = Link::Down;
            return Err(e);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.failure().unwrap_or(TransportError::Stopped)),
        }
    }

    /// Request a disconnect if connected. Does not wait for the `disconn`
    /// event; the returned receiver resolves when it arrives.
    pub fn request_disconnect(
        &self,
        dev: &Rc<Device>,
    ) -> Option<oneshot::Receiver<Result<(), TransportError>>> {
        if self.failure().is_some() {
            return None;
        }
        let (handle, rx) = {
            let mut st = dev.state.borrow_mut();
            match st.link {
                Link::Up(h) => {
                    let (tx, rx) = oneshot::channel();
                    st.link = Link::Disconnecting(Some(tx));
                    (h, rx)
                }
                _ => return None,
            }
        };
        if self.send_line(&format!("disconn {handle}")).is_err() {
            // Session is failing; fail_session resolves the waiter.
            return Some(rx);
        }
        Some(rx)
    }

    /// Enqueue a GATT write to `attr`. Blocks only while `MAX_WRITES`
    /// writes are already outstanding on this device; completion is
    /// delivered through the device's write-credit queue (`flush`).
    pub async fn write(
        &self,
        dev: &Rc<Device>,
        attr: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        loop {
            if let Some(err) = self.failure() {
                return Err(err);
            }
            let (handle, pending) = {
                let st = dev.state.borrow();
                let handle = match st.link {
                    Link::Up(h) => h,
                    _ => {
                        return Err(TransportError::Connection(format!(
                            "{}: not connected",
                            dev.addr
                        )))
                    }
                };
                (handle, st.writes.len())
            };
            if pending < limits::MAX_WRITES {
                self.send_line(&format!(
                    "write {handle} {attr} {}",
                    records::encode_bytes(data)
                ))?;
                let (tx, rx) = oneshot::channel();
                let mut st = dev.state.borrow_mut();
                st.writes.push_back(tx);
                st.last_write = Some(rx);
                return Ok(());
            }
            dev.write_slots.notified().await;
        }
    }

    /// Wait for the last enqueued write on `dev` to be credited.
    pub async fn flush(&self, dev: &Rc<Device>) -> Result<(), TransportError> {
        let rx = dev.state.borrow_mut().last_write.take();
        match rx {
            None => Ok(()),
            Some(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(self.failure().unwrap_or(TransportError::Stopped)),
            },
        }
    }

    /// GATT read of `attr` on a connected device.
    pub async fn read(&self, dev: &Rc<Device>, attr: u16) -> Result<Vec<u8>, TransportError> {
        if let Some(err) = self.failure() {
            return Err(err);
        }
        let handle = dev.handle().ok_or_else(|| {
            TransportError::Connection(format!("{}: not connected", dev.addr))
        })?;
        let (tx, rx) = oneshot::channel();
        if dev.state.borrow_mut().reads.insert(attr, tx).is_some() {
            warn!("{}: replacing pending read for attr {attr}", dev.addr);
        }
        if let Err(e) = self.send_line(&format!("read {handle} {attr}")) {
            dev.state.borrow_mut().reads.remove(&attr);
            return Err(e);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.failure().unwrap_or(TransportError::Stopped)),
        }
    }

    /// Arm a one-shot cell for the next `notify` on `attr`. Re-arm by
    /// calling again; only the most recent receiver is live.
    pub fn prepare_notify(&self, dev: &Rc<Device>, attr: u16) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        dev.state.borrow_mut().notifies.insert(attr, tx);
        rx
    }

    /// Fire-and-forget echo through the adapter.
    pub fn echo(&self, data: &[u8]) -> Result<(), TransportError> {
        self.send_line(&format!("echo {}", records::encode_bytes(data)))
    }

    /// Fire-and-forget no-op (write pacing aid).
    pub fn noop(&self, data: &[u8]) -> Result<(), TransportError> {
        self.send_line(&format!("noop {}", records::encode_bytes(data)))
    }

    /// Whether a connect to `dev` may be started right now: connection
    /// capacity left, device fully disconnected, and no connect pending
    /// or reserved anywhere on the adapter.
    pub fn ready_to_connect(&self, dev: &Rc<Device>) -> bool {
        self.failure().is_none()
            && self.handles.borrow().len() < limits::MAX_CONNECTIONS
            && dev.fully_disconnected()
            && self.busy_connecting.borrow().is_empty()
            && !self
                .devices
                .borrow()
                .values()
                .any(|d| d.connect_pending())
    }

    /// Snapshot of the device table.
    pub fn devices(&self) -> Vec<Rc<Device>> {
        self.devices.borrow().values().cloned().collect()
    }

    /// Reserve the adapter-wide busy-connecting slot for `addr`.
    pub fn mark_busy(&self, addr: &str) {
        self.busy_connecting.borrow_mut().insert(addr.to_string());
    }

    /// Release the busy-connecting slot (idempotent).
    pub fn clear_busy(&self, addr: &str) {
        self.busy_connecting.borrow_mut().remove(addr);
    }

    /// The sticky session failure, if the session has ended.
    pub fn failure(&self) -> Option<TransportError> {
        self.failure.borrow().clone()
    }

    /// Gracefully stop the session, failing every pending operation.
    pub fn shutdown(&self) {
        self.fail_session(TransportError::Stopped);
        if let Some(pump) = self.pump.borrow_mut().take() {
            pump.abort();
        }
    }

    fn fail_session(&self, err: TransportError) {
        if self.failure.borrow().is_some() {
            return;
        }
        *self.failure.borrow_mut() = Some(err.clone());
        let devices: Vec<Rc<Device>> = self.devices.borrow().values().cloned().collect();
        for dev in devices {
            dev.fail_ops(&err);
            dev.settle_link(Err(err.clone()));
        }
        self.handles.borrow_mut().clear();
        self.busy_connecting.borrow_mut().clear();
    }

    fn send_line(&self, line: &str) -> Result<(), TransportError> {
        if let Some(err) = self.failure() {
            return Err(err);
        }
        if line.len() > limits::MAX_COMMAND_SIZE {
            error!(
                "Command over {} bytes dropped: {line}",
                limits::MAX_COMMAND_SIZE
            );
            return Err(TransportError::Adapter(format!(
                "command too long ({} bytes)",
                line.len()
            )));
        }
        debug!("=> {line}");
        let mut data = Vec::with_capacity(line.len() + 2);
        data.push(b'\n');
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.out_tx.send(data).map_err(|_| TransportError::Stopped)
    }
}

/// Scoped connection to one device.
///
/// `open` performs the connect handshake and releases the scheduler's
/// busy-connecting reservation once the handshake completes either way.
/// `close` is the clean teardown; dropping the guard (cancellation)
/// fires the disconnect request without waiting for the event.
pub struct Connection {
    adapter: Rc<Adapter>,
    dev: Rc<Device>,
    open: bool,
}

impl Connection {
    pub async fn open(adapter: Rc<Adapter>, dev: Rc<Device>) -> Result<Connection, TransportError> {
        let result = adapter.connect(&dev).await;
        adapter.clear_busy(dev.addr());
        result?;
        Ok(Connection {
            adapter,
            dev,
            open: true,
        })
    }

    pub fn device(&self) -> &Rc<Device> {
        &self.dev
    }

    pub fn adapter(&self) -> &Rc<Adapter> {
        &self.adapter
    }

    /// Disconnect and wait for the `disconn` event.
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.open = false;
        if let Some(rx) = self.adapter.request_disconnect(&self.dev) {
            if let Ok(result) = rx.await {
                result?;
            }
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.open {
            drop(self.adapter.request_disconnect(&self.dev));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_lines(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(data) = rx.try_recv() {
            out.push(String::from_utf8(data).unwrap().trim().to_string());
        }
        out
    }

    fn badge_scan(adapter: &Adapter, addr: &str, rssi: i16) {
        adapter.feed_line(&format!(
            "scan={addr} s={rssi} u=fff0 m=%12%34%00%00%00%00%ff%ff"
        ));
    }

    #[tokio::test]
    async fn scan_upserts_device() {
        let (adapter, _rx) = Adapter::detached();
        badge_scan(&adapter, "aa:bb", -60);
        let devices = adapter.devices();
        assert_eq!(devices.len(), 1);
        let dev = &devices[0];
        assert_eq!(dev.addr(), "aa:bb");
        assert_eq!(dev.rssi(), -60);
        assert!(dev.advertises_service(0xFFF0));
        assert_eq!(dev.manufacturer_data()[..2], [0x12, 0x34]);
        assert!(dev.fully_disconnected());

        badge_scan(&adapter, "aa:bb", -40);
        assert_eq!(adapter.devices().len(), 1);
        assert_eq!(adapter.devices()[0].rssi(), -40);
    }

    #[tokio::test]
    async fn connect_resolves_on_conn_event() {
        let (adapter, mut rx) = Adapter::detached();
        badge_scan(&adapter, "aa:bb", -60);
        let dev = adapter.devices().pop().unwrap();

        let (result, _) = tokio::join!(adapter.connect(&dev), async {
            adapter.feed_line("conn=aa:bb handle=1");
        });
        assert_eq!(result.unwrap(), 1);
        assert!(dev.fully_connected());
        assert_eq!(dev.handle(), Some(1));
        assert!(drain_lines(&mut rx).contains(&"conn aa:bb".to_string()));
    }

    #[tokio::test]
    async fn connect_fails_on_conn_fail_event() {
        let (adapter, _rx) = Adapter::detached();
        badge_scan(&adapter, "aa:bb", -60);
        let dev = adapter.devices().pop().unwrap();

        let (result, _) = tokio::join!(adapter.connect(&dev), async {
            adapter.feed_line("conn_fail=aa:bb");
        });
        assert!(matches!(result, Err(TransportError::Connection(_))));
        assert!(dev.fully_disconnected());
    }

    #[tokio::test]
    async fn only_one_connect_pending_adapter_wide() {
        let (adapter, _rx) = Adapter::detached();
        badge_scan(&adapter, "aa:bb", -60);
        badge_scan(&adapter, "cc:dd", -60);
        let devices = adapter.devices();
        let first = devices.iter().find(|d| d.addr() == "aa:bb").unwrap();
        let second = devices.iter().find(|d| d.addr() == "cc:dd").unwrap();

        let (first_result, second_result, _) = tokio::join!(
            adapter.connect(first),
            async {
                // Runs before the conn event lands: first is still pending.
                let err = adapter.connect(second).await;
                assert!(matches!(err, Err(TransportError::Adapter(_))));
                err
            },
            async {
                adapter.feed_line("conn=aa:bb handle=1");
            }
        );
        assert!(first_result.is_ok());
        assert!(second_result.is_err());
        assert!(!adapter.ready_to_connect(second));
        adapter.feed_line("disconn=1");
        assert!(adapter.ready_to_connect(second));
    }

    #[tokio::test]
    async fn write_credit_resolves_oldest_first() {
        let (adapter, mut rx) = Adapter::detached();
        badge_scan(&adapter, "aa:bb", -60);
        let dev = adapter.devices().pop().unwrap();
        let (_, _) = tokio::join!(adapter.connect(&dev), async {
            adapter.feed_line("conn=aa:bb handle=3");
        });

        for i in 0..3u8 {
            adapter.write(&dev, 3, &[i]).await.unwrap();
        }
        assert_eq!(dev.pending_writes(), 3);
        adapter.feed_line("write=3 count=2");
        assert_eq!(dev.pending_writes(), 1);

        let (flushed, _) = tokio::join!(adapter.flush(&dev), async {
            adapter.feed_line("write=3 count=1");
        });
        flushed.unwrap();
        assert_eq!(dev.pending_writes(), 0);

        let lines = drain_lines(&mut rx);
        assert!(lines.iter().any(|l| l == "write 3 3 %00"));
        assert!(lines.iter().any(|l| l == "write 3 3 %02"));
    }

    #[tokio::test]
    async fn write_backpressure_waits_for_credit() {
        let (adapter, _rx) = Adapter::detached();
        badge_scan(&adapter, "aa:bb", -60);
        let dev = adapter.devices().pop().unwrap();
        let (_, _) = tokio::join!(adapter.connect(&dev), async {
            adapter.feed_line("conn=aa:bb handle=1");
        });

        for _ in 0..limits::MAX_WRITES {
            adapter.write(&dev, 3, b"x").await.unwrap();
        }
        let (sixth, _) = tokio::join!(adapter.write(&dev, 3, b"y"), async {
            assert_eq!(dev.pending_writes(), limits::MAX_WRITES);
            adapter.feed_line("write=1 count=1");
        });
        sixth.unwrap();
        assert_eq!(dev.pending_writes(), limits::MAX_WRITES);
    }

    #[tokio::test]
    async fn replayed_writes_all_complete_after_disconnect() {
        // connect -> write x3 -> disconnect: every write completes and
        // none remain pending.
        let (adapter, _rx) = Adapter::detached();
        badge_scan(&adapter, "aa:bb", -60);
        let dev = adapter.devices().pop().unwrap();
        let (_, _) = tokio::join!(adapter.connect(&dev), async {
            adapter.feed_line("conn=aa:bb handle=1");
        });
        for _ in 0..3 {
            adapter.write(&dev, 3, b"z").await.unwrap();
        }
        adapter.feed_line("write=1 count=1");
        adapter.feed_line("disconn=1");
        assert_eq!(dev.pending_writes(), 0);
        assert!(dev.fully_disconnected());

        let flushed = adapter.flush(&dev).await;
        assert!(matches!(flushed, Err(TransportError::Connection(_))));
    }

    #[tokio::test]
    async fn disconnect_fails_pending_reads() {
        let (adapter, _rx) = Adapter::detached();
        badge_scan(&adapter, "aa:bb", -60);
        let dev = adapter.devices().pop().unwrap();
        let (_, _) = tokio::join!(adapter.connect(&dev), async {
            adapter.feed_line("conn=aa:bb handle=1");
        });

        let (read, _) = tokio::join!(adapter.read(&dev, 3), async {
            adapter.feed_line("disconn=1");
        });
        assert!(matches!(read, Err(TransportError::Connection(_))));
    }

    #[tokio::test]
    async fn read_resolves_with_decoded_data() {
        let (adapter, _rx) = Adapter::detached();
        badge_scan(&adapter, "aa:bb", -60);
        let dev = adapter.devices().pop().unwrap();
        let (_, _) = tokio::join!(adapter.connect(&dev), async {
            adapter.feed_line("conn=aa:bb handle=1");
        });

        let (read, _) = tokio::join!(adapter.read(&dev, 3), async {
            adapter.feed_line("read=1 attr=3 data=%83%52GAM");
        });
        assert_eq!(read.unwrap(), vec![0x83, 0x52, b'G', b'A', b'M']);

        let (read, _) = tokio::join!(adapter.read(&dev, 3), async {
            adapter.feed_line("read_fail=1 attr=3");
        });
        assert!(matches!(read, Err(TransportError::Connection(_))));
    }

    #[tokio::test]
    async fn notify_cell_is_one_shot() {
        let (adapter, _rx) = Adapter::detached();
        badge_scan(&adapter, "aa:bb", -60);
        let dev = adapter.devices().pop().unwrap();
        let (_, _) = tokio::join!(adapter.connect(&dev), async {
            adapter.feed_line("conn=aa:bb handle=1");
        });

        let armed = adapter.prepare_notify(&dev, 3);
        adapter.feed_line("notify=1 attr=3 data=%01%02");
        assert_eq!(armed.await.unwrap(), vec![1, 2]);

        // Nothing armed: the payload is dropped, the next cell only sees
        // notifications after it was armed.
        adapter.feed_line("notify=1 attr=3 data=%aa");
        let armed = adapter.prepare_notify(&dev, 3);
        adapter.feed_line("notify=1 attr=3 data=%bb");
        assert_eq!(armed.await.unwrap(), vec![0xbb]);
    }

    #[tokio::test(start_paused = true)]
    async fn time_event_evicts_stale_disconnected_devices() {
        let (adapter, _rx) = Adapter::detached();
        badge_scan(&adapter, "aa:bb", -60);
        badge_scan(&adapter, "cc:dd", -60);
        let dev = adapter
            .devices()
            .into_iter()
            .find(|d| d.addr() == "cc:dd")
            .unwrap();
        let (_, _) = tokio::join!(adapter.connect(&dev), async {
            adapter.feed_line("conn=cc:dd handle=1");
        });

        tokio::time::advance(limits::MAX_SCAN_AGE + std::time::Duration::from_secs(1)).await;
        adapter.feed_line("time");
        let addrs: Vec<String> = adapter
            .devices()
            .iter()
            .map(|d| d.addr().to_string())
            .collect();
        // The stale disconnected device is gone; the connected one stays.
        assert_eq!(addrs, vec!["cc:dd".to_string()]);
    }

    #[tokio::test]
    async fn over_long_commands_are_rejected() {
        let (adapter, mut rx) = Adapter::detached();
        badge_scan(&adapter, "aa:bb", -60);
        let dev = adapter.devices().pop().unwrap();
        let (_, _) = tokio::join!(adapter.connect(&dev), async {
            adapter.feed_line("conn=aa:bb handle=1");
        });
        drain_lines(&mut rx);

        // 30 percent-escaped bytes is 90+ characters on the wire.
        let result = adapter.write(&dev, 3, &[0u8; 30]).await;
        assert!(matches!(result, Err(TransportError::Adapter(_))));
        assert!(drain_lines(&mut rx).is_empty());
        assert_eq!(dev.pending_writes(), 0);
    }

    #[tokio::test]
    async fn session_failure_fails_everything() {
        let (adapter, _rx) = Adapter::detached();
        badge_scan(&adapter, "aa:bb", -60);
        let dev = adapter.devices().pop().unwrap();
        let (_, _) = tokio::join!(adapter.connect(&dev), async {
            adapter.feed_line("conn=aa:bb handle=1");
        });
        adapter.write(&dev, 3, b"x").await.unwrap();

        let (read, flush, _) = tokio::join!(adapter.read(&dev, 3), adapter.flush(&dev), async {
            adapter.shutdown();
        });
        assert!(read.is_err());
        assert!(flush.is_err());
        assert!(dev.fully_disconnected());
        assert!(matches!(adapter.failure(), Some(TransportError::Stopped)));
        assert!(adapter.connect(&dev).await.is_err());
    }

    #[tokio::test]
    async fn busy_slot_gates_readiness() {
        let (adapter, _rx) = Adapter::detached();
        badge_scan(&adapter, "aa:bb", -60);
        let dev = adapter.devices().pop().unwrap();
        assert!(adapter.ready_to_connect(&dev));
        adapter.mark_busy("aa:bb");
        assert!(!adapter.ready_to_connect(&dev));
        adapter.clear_busy("aa:bb");
        assert!(adapter.ready_to_connect(&dev));
    }

    async fn attach_duplex() -> (
        Rc<Adapter>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
    ) {
        let (host_side, adapter_side) = tokio::io::duplex(4096);
        let (rd, wr) = tokio::io::split(adapter_side);
        let adapter = Adapter::attach(SerialReader::new("duplex", rd), SerialWriter::new(wr));
        let (host_rd, host_wr) = tokio::io::split(host_side);
        (adapter, host_wr, host_rd)
    }

    #[tokio::test(start_paused = true)]
    async fn silent_adapter_fails_the_session() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (adapter, _host_wr, _host_rd) = attach_duplex().await;
                tokio::time::sleep(limits::READ_SILENCE + std::time::Duration::from_millis(100))
                    .await;
                assert!(matches!(adapter.failure(), Some(TransportError::Port(_))));
                assert!(adapter.connect(&Rc::new(Device::new("aa:bb"))).await.is_err());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn pump_discards_the_first_line_and_dispatches_the_rest() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (adapter, mut host_wr, mut host_rd) = attach_duplex().await;
                host_wr
                    .write_all(b"scan=tr:un:ca s=-10 u=fff0\nscan=aa:bb s=-50 u=fff0 m=%ff\n")
                    .await
                    .unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;

                // The possibly-truncated first line never reached dispatch.
                let addrs: Vec<String> = adapter
                    .devices()
                    .iter()
                    .map(|d| d.addr().to_string())
                    .collect();
                assert_eq!(addrs, vec!["aa:bb".to_string()]);
                assert_eq!(adapter.devices()[0].manufacturer_data(), vec![0xff]);

                // Outbound commands are newline-wrapped onto the wire.
                adapter.echo(b"hi").unwrap();
                let mut wire = vec![0u8; 64];
                let n = host_rd.read(&mut wire).await.unwrap();
                assert_eq!(&wire[..n], b"\necho hi\n");
            })
            .await;
    }

    #[tokio::test]
    async fn scoped_connection_closes_cleanly() {
        let (adapter, mut rx) = Adapter::detached();
        badge_scan(&adapter, "aa:bb", -60);
        let dev = adapter.devices().pop().unwrap();
        adapter.mark_busy("aa:bb");

        let (conn, _) = tokio::join!(
            Connection::open(adapter.clone(), dev.clone()),
            async {
                adapter.feed_line("conn=aa:bb handle=7");
            }
        );
        let conn = conn.unwrap();
        // Busy slot was handed off at connect completion.
        assert!(adapter.busy_connecting.borrow().is_empty());

        let (closed, _) = tokio::join!(conn.close(), async {
            adapter.feed_line("disconn=7");
        });
        closed.unwrap();
        assert!(dev.fully_disconnected());
        assert!(drain_lines(&mut rx).contains(&"disconn 7".to_string()));
    }
}
