use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use protocol::{flow_hash, LatencyInfo, Stream};

use crate::error::AgentError;

const SNAPLEN: i32 = 1600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopping,
}

/// Owns the single packet source for this agent and the per-flow stream
/// trackers it feeds. At most one capture runs at a time, guarded by
/// `state`; the reader thread is the sole writer of `flows` while
/// running, and RPC handlers only read it after the reader has
/// quiesced.
pub struct CapturePipeline {
    state: Mutex<State>,
    running: Arc<AtomicBool>,
    flows: Arc<Mutex<HashMap<u64, Stream>>>,
    reader: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Default for CapturePipeline {
    fn default() -> Self {
        CapturePipeline {
            state: Mutex::new(State::Idle),
            running: Arc::new(AtomicBool::new(false)),
            flows: Arc::new(Mutex::new(HashMap::new())),
            reader: Mutex::new(None),
        }
    }
}

impl CapturePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the capture loop if idle. A call while already running is a
    /// no-op success, matching the agent RPC's idempotence contract.
    pub fn start(&self, device: &str, port: u16) -> Result<(), AgentError> {
        let mut state = self.state.lock().unwrap();
        if *state != State::Idle {
            return Ok(());
        }

        let filter = format!("tcp and port {port}");
        let mut cap = pcap::Capture::from_device(device)
            .map_err(|source| AgentError::OpenDevice { device: device.to_string(), source })?
            .promisc(true)
            .snaplen(SNAPLEN)
            .timeout(1000)
            .open()
            .map_err(|source| AgentError::OpenDevice { device: device.to_string(), source })?;
        cap.filter(&filter, true)
            .map_err(|source| AgentError::SetFilter { filter: filter.clone(), source })?;

        self.flows.lock().unwrap().clear();
        self.running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let flows = Arc::clone(&self.flows);
        let handle = std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                let packet = match cap.next_packet() {
                    Ok(p) => p,
                    Err(pcap::Error::TimeoutExpired) => continue,
                    Err(_) => break, // EOF or device error: stop reading
                };
                if let Some((src, dst, payload)) = parse_tcp_payload(packet.data) {
                    let now_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
                    let key = flow_hash(src, dst);
                    let mut flows = flows.lock().unwrap();
                    flows.entry(key).or_default().on_payload(payload, now_ns);
                }
            }
        });

        *self.reader.lock().unwrap() = Some(handle);
        *state = State::Running;
        Ok(())
    }

    /// Signals the reader to stop, waits for it to quiesce, and returns a
    /// drained snapshot of every flow's completed latency samples keyed
    /// by flow hash. Flow state itself is left in place until `goodbye`.
    pub fn stop_and_collect(&self) -> HashMap<u64, Vec<LatencyInfo>> {
        {
            let mut state = self.state.lock().unwrap();
            if *state == State::Running {
                *state = State::Stopping;
            }
        }
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.state.lock().unwrap() = State::Idle;

        let mut flows = self.flows.lock().unwrap();
        flows.iter_mut().map(|(hash, stream)| (*hash, stream.pair_and_collect())).collect()
    }

    /// Stops any in-progress capture and discards all flow state.
    pub fn goodbye(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.state.lock().unwrap() = State::Idle;
        self.flows.lock().unwrap().clear();
    }
}

/// Unwraps an Ethernet frame down to its TCP payload and the 4-tuple it
/// belongs to. Returns `None` for anything without a TCP layer (per
/// spec: payloads without a TCP layer are dropped).
fn parse_tcp_payload(data: &[u8]) -> Option<(SocketAddr, SocketAddr, &[u8])> {
    let eth = etherparse::Ethernet2HeaderSlice::from_slice(data).ok()?;
    let after_eth = &data[eth.slice().len()..];

    let (ip_src, ip_dst, transport_start, transport_proto): (IpAddr, IpAddr, usize, u8) =
        match etherparse::Ipv4HeaderSlice::from_slice(after_eth) {
            Ok(ipv4) => (
                IpAddr::V4(ipv4.source_addr()),
                IpAddr::V4(ipv4.destination_addr()),
                ipv4.slice().len(),
                ipv4.protocol().0,
            ),
            Err(_) => {
                let ipv6 = etherparse::Ipv6HeaderSlice::from_slice(after_eth).ok()?;
                (
                    IpAddr::V6(ipv6.source_addr()),
                    IpAddr::V6(ipv6.destination_addr()),
                    ipv6.slice().len(),
                    ipv6.next_header().0,
                )
            }
        };

    const TCP_PROTO: u8 = 6;
    if transport_proto != TCP_PROTO {
        return None;
    }

    let tcp_slice = &after_eth[transport_start..];
    let tcp = etherparse::TcpHeaderSlice::from_slice(tcp_slice).ok()?;
    let payload = &tcp_slice[tcp.slice().len()..];

    let src = SocketAddr::new(ip_src, tcp.source_port());
    let dst = SocketAddr::new(ip_dst, tcp.destination_port());
    Some((src, dst, payload))
}
