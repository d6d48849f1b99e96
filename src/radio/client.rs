//! Framed TCP/serial transport for a single Meshtastic radio, plus the
//! small set of operations the rest of the crate drives through
//! [`super::RadioConfig`]/[`RadioClient`].
//!
//! Frames follow Meshtastic's stream protocol: a two-byte magic (`0x94
//! 0xC3`), a big-endian `u16` length, then that many bytes of
//! `ToRadio`/`FromRadio` protobuf.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use prost::Message;
use rand::Rng;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::packet::DecodedPacket;
use crate::shutdown::Shutdown;

use super::proto::{self, from_radio, to_radio};
use super::{node_id_from_num, RadioConfig, RadioError};

const MAGIC: [u8; 2] = [0x94, 0xC3];
const EVENT_CHANNEL_CAPACITY: usize = 16;
const PACKET_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    Connected,
    Lost,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoRaInfo {
    pub modem_preset: String,
    pub channel_num: u32,
}

enum Transport {
    Tcp(TcpStream),
    Serial(Arc<StdMutex<Box<dyn serialport::SerialPort>>>),
}

impl Transport {
    async fn read_some(&mut self) -> std::io::Result<Vec<u8>> {
        match self {
            Transport::Tcp(stream) => {
                let mut buf = [0u8; 1024];
                let n = stream.read(&mut buf).await?;
                Ok(buf[..n].to_vec())
            }
            Transport::Serial(port) => {
                let port = port.clone();
                tokio::task::spawn_blocking(move || {
                    let mut guard = port.lock().expect("serial port mutex poisoned");
                    let mut buf = [0u8; 1024];
                    match guard.read(&mut buf) {
                        Ok(n) => Ok(buf[..n].to_vec()),
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
                        Err(e) => Err(e),
                    }
                })
                .await
                .expect("blocking serial read task panicked")
            }
        }
    }

    async fn write_all(&mut self, data: Vec<u8>) -> std::io::Result<()> {
        match self {
            Transport::Tcp(stream) => stream.write_all(&data).await,
            Transport::Serial(port) => {
                let port = port.clone();
                tokio::task::spawn_blocking(move || {
                    let mut guard = port.lock().expect("serial port mutex poisoned");
                    guard.write_all(&data)?;
                    guard.flush()
                })
                .await
                .expect("blocking serial write task panicked")
            }
        }
    }
}

/// Owns the radio session. One client per process: only `ConnectionManager`
/// is meant to hold a live handle.
pub struct RadioClient {
    transport: AsyncMutex<Option<Transport>>,
    read_buf: AsyncMutex<Vec<u8>>,
    reader_handle: AsyncMutex<Option<JoinHandle<()>>>,
    my_node_num: StdMutex<Option<u32>>,
    lora_info: StdMutex<Option<LoRaInfo>>,
    packet_tx: broadcast::Sender<DecodedPacket>,
    event_tx: broadcast::Sender<RadioEvent>,
    local_packet_id: AtomicU32,
}

impl RadioClient {
    pub fn new() -> Arc<Self> {
        let (packet_tx, _) = broadcast::channel(PACKET_CHANNEL_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            transport: AsyncMutex::new(None),
            read_buf: AsyncMutex::new(Vec::new()),
            reader_handle: AsyncMutex::new(None),
            my_node_num: StdMutex::new(None),
            lora_info: StdMutex::new(None),
            packet_tx,
            event_tx,
            local_packet_id: AtomicU32::new(rand::thread_rng().gen_range(0..0x0FFF_FFFF)),
        })
    }

    /// Opens the transport, sends `want_config_id`, and waits (bounded) for
    /// `MyNodeInfo` to come back. Spawns the background reader loop on
    /// success.
    pub async fn connect(
        self: &Arc<Self>,
        config: &RadioConfig,
        shutdown: Shutdown,
    ) -> Result<String, RadioError> {
        let transport = match config {
            RadioConfig::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true).ok();
                Transport::Tcp(stream)
            }
            RadioConfig::Serial { path } => {
                let port = serialport::new(path.as_str(), 115_200)
                    .timeout(Duration::from_millis(200))
                    .open()?;
                Transport::Serial(Arc::new(StdMutex::new(port)))
            }
        };

        // Abort any reader left over from a prior session before touching the
        // transport it was reading from: otherwise it can keep running
        // against the new transport once installed below and race the
        // handshake for `await_my_node_info`'s frames.
        if let Some(old) = self.reader_handle.lock().await.take() {
            old.abort();
        }

        *self.transport.lock().await = Some(transport);
        self.read_buf.lock().await.clear();

        let want_config_id: u32 = rand::thread_rng().gen();
        let handshake = proto::ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::WantConfigId(want_config_id)),
        };
        self.send_to_radio(&handshake).await?;

        let node_num = tokio::time::timeout(Duration::from_secs(10), self.await_my_node_info())
            .await
            .map_err(|_| RadioError::Timeout)??;

        *self.my_node_num.lock().expect("mutex poisoned") = Some(node_num);
        self.event_tx.send(RadioEvent::Connected).ok();

        self.spawn_reader(shutdown).await;

        Ok(node_id_from_num(node_num))
    }

    async fn await_my_node_info(self: &Arc<Self>) -> Result<u32, RadioError> {
        loop {
            let frame = self.read_frame().await?;
            let Some(frame) = frame else {
                return Err(RadioError::NotConnected);
            };
            let decoded = proto::FromRadio::decode(frame.as_slice())?;
            match decoded.payload_variant {
                Some(from_radio::PayloadVariant::MyInfo(info)) => return Ok(info.my_node_num),
                Some(from_radio::PayloadVariant::Config(cfg)) => {
                    *self.lora_info.lock().expect("mutex poisoned") = Some(LoRaInfo {
                        modem_preset: modem_preset_name(cfg.modem_preset),
                        channel_num: cfg.channel_num,
                    });
                }
                _ => {}
            }
        }
    }

    async fn spawn_reader(self: &Arc<Self>, shutdown: Shutdown) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let frame = shutdown.race(this.read_frame()).await;
                match frame {
                    None => break, // shutdown
                    Some(Ok(None)) => {
                        this.event_tx.send(RadioEvent::Lost).ok();
                        break;
                    }
                    Some(Err(_)) => {
                        this.event_tx.send(RadioEvent::Lost).ok();
                        break;
                    }
                    Some(Ok(Some(frame))) => {
                        if let Ok(decoded) = proto::FromRadio::decode(frame.as_slice()) {
                            if let Some(from_radio::PayloadVariant::Packet(packet)) =
                                decoded.payload_variant
                            {
                                let json = mesh_packet_to_json(&packet);
                                this.packet_tx
                                    .send(DecodedPacket::from_map(
                                        json.as_object().expect("packet json is object").clone(),
                                    ))
                                    .ok();
                            }
                        }
                    }
                }
            }
        });
        *self.reader_handle.lock().await = Some(handle);
    }

    pub fn packets(&self) -> broadcast::Receiver<DecodedPacket> {
        self.packet_tx.subscribe()
    }

    /// Non-destructive `SO_ERROR` peek for TCP transports, the socket-level
    /// signal `ConnectionManager`'s liveness check mixes in alongside the
    /// event-driven and heartbeat signals. Always `None` over serial.
    pub async fn socket_error(&self) -> Option<std::io::Error> {
        let guard = self.transport.lock().await;
        match guard.as_ref() {
            Some(Transport::Tcp(stream)) => {
                let sock_ref = socket2::SockRef::from(stream);
                sock_ref.take_error().ok().flatten()
            }
            _ => None,
        }
    }

    pub fn connection_events(&self) -> broadcast::Receiver<RadioEvent> {
        self.event_tx.subscribe()
    }

    pub fn my_node_id(&self) -> Option<String> {
        self.my_node_num
            .lock()
            .expect("mutex poisoned")
            .map(node_id_from_num)
    }

    pub async fn get_my_node_info(&self) -> Result<String, RadioError> {
        self.my_node_id().ok_or(RadioError::NotConnected)
    }

    pub fn lora_config(&self) -> Option<LoRaInfo> {
        self.lora_info.lock().expect("mutex poisoned").clone()
    }

    /// Sends a text message, optionally addressed; Meshtastic broadcast
    /// destination is `0xFFFFFFFF`.
    pub async fn send_text(
        &self,
        destination: Option<&str>,
        text: &str,
        channel: u32,
    ) -> Result<u32, RadioError> {
        let to = destination
            .and_then(super::node_num_from_id)
            .unwrap_or(0xFFFF_FFFF);
        let id = self.next_local_packet_id();
        let packet = proto::MeshPacket {
            from: self.my_node_num.lock().expect("mutex poisoned").unwrap_or(0),
            to,
            id,
            rx_time: 0,
            channel,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::data::PortNum::TextMessageApp as i32,
                payload: text.as_bytes().to_vec(),
            })),
        };
        let to_radio = proto::ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Packet(packet)),
        };
        self.send_to_radio(&to_radio).await?;
        Ok(id)
    }

    /// Issues a traceroute toward `destination`. Decoding the reply's hop
    /// list is out of scope; the core only needs send success/failure.
    pub async fn send_traceroute(&self, destination: &str) -> Result<(), RadioError> {
        let to = super::node_num_from_id(destination).ok_or(RadioError::NotConnected)?;
        let id = self.next_local_packet_id();
        let packet = proto::MeshPacket {
            from: self.my_node_num.lock().expect("mutex poisoned").unwrap_or(0),
            to,
            id,
            rx_time: 0,
            channel: 0,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::data::PortNum::TracerouteApp as i32,
                payload: Vec::new(),
            })),
        };
        let to_radio = proto::ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Packet(packet)),
        };
        self.send_to_radio(&to_radio).await
    }

    fn next_local_packet_id(&self) -> u32 {
        loop {
            let current = self.local_packet_id.load(Ordering::Relaxed);
            let next = current.wrapping_add(1) & 0x7FFF_FFFF;
            if self
                .local_packet_id
                .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return next;
            }
        }
    }

    async fn send_to_radio(&self, message: &proto::ToRadio) -> Result<(), RadioError> {
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(RadioError::NotConnected)?;
        let encoded = message.encode_to_vec();
        let len = encoded.len() as u16;
        let mut frame = Vec::with_capacity(encoded.len() + 4);
        frame.extend_from_slice(&MAGIC);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&encoded);
        transport.write_all(frame).await?;
        Ok(())
    }

    /// Reads the next complete frame, returning `None` on clean EOF.
    ///
    /// The accumulator lives in `self.read_buf`, not a local, so bytes past
    /// the first complete frame in a read (a routine occurrence: one
    /// `read_some` commonly returns several small frames, or a frame plus
    /// the next one's prefix) survive to the next call instead of being
    /// dropped when this function returns.
    async fn read_frame(&self) -> std::io::Result<Option<Vec<u8>>> {
        let mut buf = self.read_buf.lock().await;
        loop {
            if let Some((frame, consumed)) = try_extract_frame(&buf) {
                buf.drain(..consumed);
                return Ok(Some(frame));
            }
            let chunk = {
                let mut guard = self.transport.lock().await;
                let transport = guard.as_mut().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotConnected, "no transport")
                })?;
                transport.read_some().await?
            };
            if chunk.is_empty() {
                if buf.is_empty() {
                    continue;
                }
                return Ok(None);
            }
            buf.extend_from_slice(&chunk);
        }
    }
}

/// Scans `buf` for a complete `0x94 0xC3 <len_hi> <len_lo> <payload>` frame.
/// Returns the payload and the number of bytes consumed from the front.
fn try_extract_frame(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    let magic_pos = buf.windows(2).position(|w| w == MAGIC)?;
    let header_start = magic_pos + 2;
    if buf.len() < header_start + 2 {
        return None;
    }
    let len = u16::from_be_bytes([buf[header_start], buf[header_start + 1]]) as usize;
    let payload_start = header_start + 2;
    let payload_end = payload_start + len;
    if buf.len() < payload_end {
        return None;
    }
    Some((buf[payload_start..payload_end].to_vec(), payload_end))
}

fn modem_preset_name(raw: i32) -> String {
    proto::lo_ra_config::ModemPreset::try_from(raw)
        .map(|p| p.as_str_name().to_string())
        .unwrap_or_else(|_| "Unknown".to_string())
}

fn port_name(raw: i32) -> String {
    proto::data::PortNum::try_from(raw)
        .map(|p| p.as_str_name().to_string())
        .unwrap_or_else(|_| "UNKNOWN_APP".to_string())
}

/// Converts a decoded `MeshPacket` into the JSON-map shape the rest of the
/// crate (`packet::DecodedPacket`) consumes.
fn mesh_packet_to_json(packet: &proto::MeshPacket) -> serde_json::Value {
    use base64::Engine;

    let decoded = match &packet.payload_variant {
        Some(proto::mesh_packet::PayloadVariant::Decoded(data)) => json!({
            "portnum": port_name(data.portnum),
            "payload": base64::engine::general_purpose::STANDARD.encode(&data.payload),
        }),
        _ => json!({}),
    };

    json!({
        "fromId": node_id_from_num(packet.from),
        "toId": node_id_from_num(packet.to),
        "id": packet.id,
        "rxTime": packet.rx_time,
        "channel": packet.channel,
        "decoded": decoded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_frame_from_prefixed_noise() {
        let mut buf = vec![0x00, 0x01];
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&3u16.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3]);
        buf.extend_from_slice(&[9, 9]); // trailing noise from the next frame

        let (frame, consumed) = try_extract_frame(&buf).unwrap();
        assert_eq!(frame, vec![1, 2, 3]);
        assert_eq!(consumed, buf.len() - 2);
    }

    #[test]
    fn two_frames_in_one_chunk_both_extract() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&3u16.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3]);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&2u16.to_be_bytes());
        buf.extend_from_slice(&[4, 5]);

        let (first, consumed) = try_extract_frame(&buf).unwrap();
        assert_eq!(first, vec![1, 2, 3]);
        buf.drain(..consumed);

        let (second, consumed) = try_extract_frame(&buf).unwrap();
        assert_eq!(second, vec![4, 5]);
        buf.drain(..consumed);
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&10u16.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3]);
        assert!(try_extract_frame(&buf).is_none());
    }

    #[test]
    fn packet_json_roundtrips_text_payload() {
        let packet = proto::MeshPacket {
            from: 0xabcd1234,
            to: 0xFFFF_FFFF,
            id: 42,
            rx_time: 1000,
            channel: 0,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::data::PortNum::TextMessageApp as i32,
                payload: b"hi".to_vec(),
            })),
        };
        let value = mesh_packet_to_json(&packet);
        let decoded = DecodedPacket::from_map(value.as_object().unwrap().clone());
        assert_eq!(decoded.from_id(), Some("!abcd1234"));
        assert_eq!(decoded.portnum(), Some("TEXT_MESSAGE_APP"));
        assert_eq!(decoded.payload_text().as_deref(), Some("hi"));
    }
}
